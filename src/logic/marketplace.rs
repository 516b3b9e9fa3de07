use chrono::Utc;
use itertools::Itertools;
use log::info;
use std::sync::Arc;

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::logic::registry::grant_op;
use crate::logic::templates::TemplateService;
use crate::model::{
    generate_id, CategoryCount, CategoryQuery, Id, InstallOutcome, Installation, ListingKind,
    ListingMetadata, MarketplaceListing, Page, Rating, RatingAggregate, UserContext, Visibility,
};
use crate::store::traits::{Store, WriteBatch, WriteOp};

const MAX_REVIEW_LEN: usize = 1000;

/// How well a listing matches a search term; lower ranks first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    ExactName,
    PartialName,
    DescriptionOrCategory,
}

pub(crate) fn match_tier(listing: &MarketplaceListing, term: &str) -> Option<MatchTier> {
    let term = term.to_lowercase();
    let name = listing.name.to_lowercase();

    if name == term {
        Some(MatchTier::ExactName)
    } else if name.contains(&term) {
        Some(MatchTier::PartialName)
    } else if listing
        .description
        .as_deref()
        .is_some_and(|d| d.to_lowercase().contains(&term))
        || listing.category.to_lowercase().contains(&term)
    {
        Some(MatchTier::DescriptionOrCategory)
    } else {
        None
    }
}

fn popularity(a: &MarketplaceListing, b: &MarketplaceListing) -> std::cmp::Ordering {
    b.install_count
        .cmp(&a.install_count)
        .then_with(|| a.name.cmp(&b.name))
}

/// Count categories case-insensitively, keeping the first spelling seen.
/// Most used first, then by name.
pub(crate) fn category_counts(categories: impl IntoIterator<Item = String>) -> Vec<CategoryCount> {
    categories
        .into_iter()
        .into_group_map_by(|c| c.to_lowercase())
        .into_values()
        .filter_map(|names| {
            let count = names.len();
            names
                .into_iter()
                .next()
                .map(|category| CategoryCount { category, count })
        })
        .sorted_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.category.cmp(&b.category))
        })
        .collect()
}

/// Discovery, installation and ratings for published blocks and templates
pub struct MarketplaceService<S> {
    store: Arc<S>,
    settings: EngineSettings,
    templates: TemplateService<S>,
}

impl<S: Store> MarketplaceService<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        let templates = TemplateService::new(store.clone(), settings.clone());
        Self {
            store,
            settings,
            templates,
        }
    }

    async fn load_active(&self, listing_id: &Id) -> EngineResult<MarketplaceListing> {
        match self.store.get_listing(listing_id).await? {
            Some(listing) if listing.active => Ok(listing),
            _ => Err(EngineError::not_found("listing", listing_id.clone())),
        }
    }

    async fn active_listings(&self) -> EngineResult<Vec<MarketplaceListing>> {
        Ok(self
            .store
            .list_listings()
            .await?
            .into_iter()
            .filter(|l| l.active)
            .collect())
    }

    /// List a definition the actor authored or a template the actor owns.
    /// The target becomes public. Publishing the same target again refreshes
    /// the existing listing instead of creating a second one.
    pub async fn publish(
        &self,
        actor: &UserContext,
        kind: ListingKind,
        target_id: &Id,
        metadata: ListingMetadata,
    ) -> EngineResult<MarketplaceListing> {
        let mut batch = WriteBatch::new();
        let (name, description, category) = match kind {
            ListingKind::Block => {
                let mut definition = match self.store.get_block_definition(target_id).await? {
                    Some(d) if actor.owns(&d.author) => d,
                    _ => return Err(EngineError::not_found("block definition", target_id.clone())),
                };
                let summary = (
                    definition.name.clone(),
                    definition.description.clone(),
                    definition.category.clone(),
                );
                if definition.visibility != Visibility::Public {
                    definition.visibility = Visibility::Public;
                    definition.updated_at = Utc::now();
                    batch.push(WriteOp::PutBlockDefinition(definition));
                }
                summary
            }
            ListingKind::Template => {
                let mut template = match self.store.get_template(target_id).await? {
                    Some(t) if actor.owns(&t.owner_id) => t,
                    _ => return Err(EngineError::not_found("template", target_id.clone())),
                };
                let summary = (
                    template.name.clone(),
                    template.description.clone(),
                    template.category.clone(),
                );
                if !template.is_public {
                    template.is_public = true;
                    template.updated_at = Utc::now();
                    batch.push(WriteOp::PutTemplate(template));
                }
                summary
            }
        };

        let existing = self
            .store
            .list_listings_for_target(target_id)
            .await?
            .into_iter()
            .find(|l| l.kind == kind);

        let mut listing = existing.unwrap_or_else(|| MarketplaceListing {
            id: generate_id(),
            kind,
            target_id: target_id.clone(),
            name: name.clone(),
            description: None,
            category: category.clone(),
            tags: Vec::new(),
            publisher_id: actor.user_id.clone(),
            verified: false,
            featured: false,
            active: true,
            install_count: 0,
            rating: RatingAggregate::default(),
            created_at: Utc::now(),
        });
        listing.name = name;
        listing.category = category;
        listing.description = metadata.description.or(description);
        listing.tags = metadata.tags;
        listing.active = true;
        batch.push(WriteOp::PutListing(listing.clone()));

        self.store.apply(batch).await?;
        info!(
            "Published {} {} as listing {}",
            kind, target_id, listing.id
        );

        // Counters are store-owned; re-read so a refreshed listing reports them
        self.load_active(&listing.id).await
    }

    /// Set the curation flags on a listing. Only configured curators may
    /// curate; anyone else gets NotFound.
    pub async fn curate(
        &self,
        actor: &UserContext,
        listing_id: &Id,
        featured: Option<bool>,
        verified: Option<bool>,
    ) -> EngineResult<MarketplaceListing> {
        if !self.settings.is_curator(&actor.user_id) {
            return Err(EngineError::not_found("listing", listing_id.clone()));
        }
        let mut listing = self.load_active(listing_id).await?;
        if let Some(featured) = featured {
            listing.featured = featured;
        }
        if let Some(verified) = verified {
            listing.verified = verified;
        }
        self.store
            .apply(WriteBatch::single(WriteOp::PutListing(listing.clone())))
            .await?;
        info!(
            "{} curated listing {} (featured={}, verified={})",
            actor.user_id, listing.id, listing.featured, listing.verified
        );
        Ok(listing)
    }

    /// Active listings, most installed first
    pub async fn index(
        &self,
        page: Option<usize>,
        per_page: Option<usize>,
    ) -> EngineResult<Page<MarketplaceListing>> {
        let listings = self
            .active_listings()
            .await?
            .into_iter()
            .sorted_by(popularity)
            .collect();
        Ok(Page::from_vec(
            listings,
            page.unwrap_or(1),
            self.settings.per_page(per_page),
        ))
    }

    /// Featured listings, best rated first
    pub async fn featured(&self, limit: Option<usize>) -> EngineResult<Vec<MarketplaceListing>> {
        let limit = limit.unwrap_or(self.settings.featured_limit);
        Ok(self
            .active_listings()
            .await?
            .into_iter()
            .filter(|l| l.featured)
            .sorted_by(|a, b| {
                b.rating
                    .avg
                    .total_cmp(&a.rating.avg)
                    .then_with(|| popularity(a, b))
            })
            .take(limit)
            .collect())
    }

    /// Categories of active listings with their listing counts
    pub async fn categories(&self) -> EngineResult<Vec<CategoryCount>> {
        let listings = self.active_listings().await?;
        Ok(category_counts(listings.into_iter().map(|l| l.category)))
    }

    pub async fn show(&self, listing_id: &Id) -> EngineResult<MarketplaceListing> {
        self.load_active(listing_id).await
    }

    /// Case-insensitive match over name, description and category. Exact name
    /// matches rank above partial name matches, which rank above description
    /// or category matches; ties go to the most installed, then by name.
    pub async fn search(&self, term: &str) -> EngineResult<Vec<MarketplaceListing>> {
        let term = term.trim();
        if term.is_empty() {
            return Err(EngineError::validation("Search term must not be empty"));
        }

        let results: Vec<MarketplaceListing> = self
            .active_listings()
            .await?
            .into_iter()
            .filter_map(|l| match_tier(&l, term).map(|tier| (tier, l)))
            .sorted_by(|(ta, a), (tb, b)| ta.cmp(tb).then_with(|| popularity(a, b)))
            .map(|(_, l)| l)
            .collect();

        info!("Search '{}' matched {} listings", term, results.len());
        Ok(results)
    }

    pub async fn find_by_category(
        &self,
        category: &str,
        query: CategoryQuery,
    ) -> EngineResult<Page<MarketplaceListing>> {
        let listings = self
            .active_listings()
            .await?
            .into_iter()
            .filter(|l| l.category.eq_ignore_ascii_case(category.trim()))
            .filter(|l| query.verified.map_or(true, |v| l.verified == v))
            .sorted_by(popularity)
            .collect();
        Ok(Page::from_vec(
            listings,
            query.page.unwrap_or(1),
            self.settings.per_page(query.per_page),
        ))
    }

    /// Block listings grant the definition to the actor; template listings
    /// instantiate the template for them. Every call counts as an install.
    pub async fn install(
        &self,
        actor: &UserContext,
        listing_id: &Id,
    ) -> EngineResult<InstallOutcome> {
        let listing = self.load_active(listing_id).await?;
        let count = WriteOp::IncrementInstallCount {
            listing_id: listing.id.clone(),
        };

        let outcome = match listing.kind {
            ListingKind::Block => {
                if self
                    .store
                    .get_block_definition(&listing.target_id)
                    .await?
                    .is_none()
                {
                    return Err(EngineError::missing_definition(listing.target_id.clone()));
                }
                let batch = WriteBatch::single(grant_op(actor, &listing.target_id, &listing.id))
                    .with(count);
                self.store.apply(batch).await?;
                InstallOutcome::Block {
                    definition_id: listing.target_id.clone(),
                }
            }
            ListingKind::Template => {
                let (instance, batch) = self
                    .templates
                    .prepare_instantiation(actor, &listing.target_id, None, None)
                    .await?;
                self.store.apply(batch.with(count)).await?;
                InstallOutcome::Template {
                    instance: Box::new(instance),
                }
            }
        };

        info!(
            "Installed listing {} ({}) for {}",
            listing.id, listing.kind, actor.user_id
        );
        Ok(outcome)
    }

    /// Revoke a block grant. The install count is left as is.
    pub async fn uninstall(&self, actor: &UserContext, listing_id: &Id) -> EngineResult<()> {
        let listing = self
            .store
            .get_listing(listing_id)
            .await?
            .ok_or_else(|| EngineError::not_found("listing", listing_id.clone()))?;
        if listing.kind != ListingKind::Block {
            return Err(EngineError::validation(
                "Template installs create instances; delete the instance instead",
            ));
        }

        self.store
            .apply(WriteBatch::single(WriteOp::RevokeBlock {
                user_id: actor.user_id.clone(),
                definition_id: listing.target_id.clone(),
            }))
            .await?;
        info!("Uninstalled listing {} for {}", listing_id, actor.user_id);
        Ok(())
    }

    pub async fn installations(&self, actor: &UserContext) -> EngineResult<Vec<Installation>> {
        Ok(self
            .store
            .list_installations_for_user(&actor.user_id)
            .await?)
    }

    /// Most recently updated first
    pub async fn reviews(
        &self,
        listing_id: &Id,
        page: Option<usize>,
        per_page: Option<usize>,
    ) -> EngineResult<Page<Rating>> {
        self.load_active(listing_id).await?;
        let ratings = self.store.list_ratings_for_listing(listing_id).await?;
        Ok(Page::from_vec(
            ratings,
            page.unwrap_or(1),
            self.settings.per_page(per_page),
        ))
    }

    /// Record the actor's score, replacing any earlier one, and return the
    /// recomputed aggregate
    pub async fn rate(
        &self,
        actor: &UserContext,
        listing_id: &Id,
        score: u8,
        review: Option<String>,
    ) -> EngineResult<RatingAggregate> {
        if !(1..=5).contains(&score) {
            return Err(EngineError::validation("Score must be between 1 and 5"));
        }
        if review
            .as_deref()
            .is_some_and(|r| r.chars().count() > MAX_REVIEW_LEN)
        {
            return Err(EngineError::validation(format!(
                "Review must be at most {} characters",
                MAX_REVIEW_LEN
            )));
        }
        self.load_active(listing_id).await?;

        let now = Utc::now();
        self.store
            .apply(WriteBatch::single(WriteOp::UpsertRating(Rating {
                listing_id: listing_id.clone(),
                user_id: actor.user_id.clone(),
                score,
                review,
                created_at: now,
                updated_at: now,
            })))
            .await?;

        let listing = self.load_active(listing_id).await?;
        info!(
            "{} rated listing {} with {} (avg {:.2} over {})",
            actor.user_id, listing_id, score, listing.rating.avg, listing.rating.count
        );
        Ok(listing.rating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(name: &str, description: &str, category: &str, installs: u64) -> MarketplaceListing {
        MarketplaceListing {
            id: name.to_string(),
            kind: ListingKind::Block,
            target_id: name.to_string(),
            name: name.to_string(),
            description: Some(description.to_string()),
            category: category.to_string(),
            tags: Vec::new(),
            publisher_id: "p".to_string(),
            verified: false,
            featured: false,
            active: true,
            install_count: installs,
            rating: RatingAggregate::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_match_tiers() {
        let email = listing("Email", "Send mail", "messaging", 0);
        assert_eq!(match_tier(&email, "EMAIL"), Some(MatchTier::ExactName));
        assert_eq!(match_tier(&email, "mai"), Some(MatchTier::PartialName));
        assert_eq!(
            match_tier(&email, "messag"),
            Some(MatchTier::DescriptionOrCategory)
        );
        assert_eq!(match_tier(&email, "webhook"), None);
        assert!(MatchTier::ExactName < MatchTier::PartialName);
    }

    #[test]
    fn test_category_counts_ignore_case() {
        let counts = category_counts(
            ["messaging", "Storage", "Messaging", "ai", "storage", "messaging"]
                .map(String::from),
        );
        assert_eq!(
            counts,
            vec![
                CategoryCount {
                    category: "messaging".to_string(),
                    count: 3
                },
                CategoryCount {
                    category: "Storage".to_string(),
                    count: 2
                },
                CategoryCount {
                    category: "ai".to_string(),
                    count: 1
                },
            ]
        );
        assert!(category_counts(Vec::<String>::new()).is_empty());
    }
}
