use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;

use crate::model::{
    BlockDefinition, Id, Installation, Instance, ListingKind, MarketplaceListing, Rating,
    RatingAggregate, Snapshot, Template,
};
use crate::store::traits::{
    BatchStore, BlockDefinitionStore, Expect, InstanceStore, MarketplaceStore, RevisionConflict,
    SnapshotStore, TemplateStore, WriteBatch, WriteOp,
};

#[derive(Debug, Default)]
struct MemoryState {
    definitions: HashMap<Id, BlockDefinition>,
    /// Keyed by (user_id, definition_id)
    installations: HashMap<(Id, Id), Installation>,
    instances: HashMap<Id, Instance>,
    snapshots: HashMap<Id, Snapshot>,
    templates: HashMap<Id, Template>,
    listings: HashMap<Id, MarketplaceListing>,
    /// Keyed by (listing_id, user_id)
    ratings: HashMap<(Id, Id), Rating>,
}

/// Prior value of one touched key, replayed in reverse to roll a batch back
enum Undo {
    Definition(Id, Option<BlockDefinition>),
    Installation((Id, Id), Option<Installation>),
    Instance(Id, Option<Instance>),
    Snapshot(Id, Option<Snapshot>),
    Template(Id, Option<Template>),
    Listing(Id, Option<MarketplaceListing>),
    Rating((Id, Id), Option<Rating>),
}

fn restore<K: Hash + Eq, V>(map: &mut HashMap<K, V>, key: K, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

fn check_expect(instance_id: &Id, expect: Expect, found: Option<u64>) -> Result<()> {
    let satisfied = match expect {
        Expect::Absent => found.is_none(),
        Expect::Revision(revision) => found == Some(revision),
    };
    if satisfied {
        Ok(())
    } else {
        Err(RevisionConflict {
            instance_id: instance_id.clone(),
            expected: expect,
            found,
        }
        .into())
    }
}

impl MemoryState {
    fn rollback(&mut self, journal: Vec<Undo>) {
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Definition(k, v) => restore(&mut self.definitions, k, v),
                Undo::Installation(k, v) => restore(&mut self.installations, k, v),
                Undo::Instance(k, v) => restore(&mut self.instances, k, v),
                Undo::Snapshot(k, v) => restore(&mut self.snapshots, k, v),
                Undo::Template(k, v) => restore(&mut self.templates, k, v),
                Undo::Listing(k, v) => restore(&mut self.listings, k, v),
                Undo::Rating(k, v) => restore(&mut self.ratings, k, v),
            }
        }
    }

    fn apply_op(&mut self, op: WriteOp, journal: &mut Vec<Undo>) -> Result<()> {
        match op {
            WriteOp::PutInstance { instance, expect } => {
                let found = self.instances.get(&instance.id).map(|i| i.revision);
                check_expect(&instance.id, expect, found)?;
                let id = instance.id.clone();
                let previous = self.instances.insert(id.clone(), instance);
                journal.push(Undo::Instance(id, previous));
            }
            WriteOp::DeleteInstance {
                instance_id,
                expect,
            } => {
                let found = self.instances.get(&instance_id).map(|i| i.revision);
                check_expect(&instance_id, expect, found)?;
                let previous = self.instances.remove(&instance_id);
                journal.push(Undo::Instance(instance_id.clone(), previous));

                let owned: Vec<Id> = self
                    .snapshots
                    .values()
                    .filter(|s| s.instance_id == instance_id)
                    .map(|s| s.id.clone())
                    .collect();
                for snapshot_id in owned {
                    let previous = self.snapshots.remove(&snapshot_id);
                    journal.push(Undo::Snapshot(snapshot_id, previous));
                }
            }
            WriteOp::InsertSnapshot(snapshot) => {
                if self.snapshots.contains_key(&snapshot.id) {
                    return Err(anyhow!("Snapshot '{}' already exists", snapshot.id));
                }
                if !self.instances.contains_key(&snapshot.instance_id) {
                    return Err(anyhow!(
                        "Snapshot '{}' references missing instance '{}'",
                        snapshot.id,
                        snapshot.instance_id
                    ));
                }
                let id = snapshot.id.clone();
                self.snapshots.insert(id.clone(), snapshot);
                journal.push(Undo::Snapshot(id, None));
            }
            WriteOp::DeleteSnapshot { snapshot_id } => {
                let previous = self.snapshots.remove(&snapshot_id);
                journal.push(Undo::Snapshot(snapshot_id, previous));
            }
            WriteOp::PutTemplate(mut template) => {
                if let Some(existing) = self.templates.get(&template.id) {
                    template.rating = existing.rating;
                    template.usage_count = existing.usage_count;
                }
                let id = template.id.clone();
                let previous = self.templates.insert(id.clone(), template);
                journal.push(Undo::Template(id, previous));
            }
            WriteOp::DeleteTemplate { template_id } => {
                let previous = self.templates.remove(&template_id);
                journal.push(Undo::Template(template_id, previous));
            }
            WriteOp::IncrementTemplateUsage { template_id } => {
                let template = self
                    .templates
                    .get_mut(&template_id)
                    .ok_or_else(|| anyhow!("Template '{}' not found", template_id))?;
                let previous = template.clone();
                template.usage_count += 1;
                journal.push(Undo::Template(template_id, Some(previous)));
            }
            WriteOp::PutBlockDefinition(mut definition) => {
                if let Some(existing) = self.definitions.get(&definition.id) {
                    definition.rating = existing.rating;
                    definition.install_count = existing.install_count;
                }
                let id = definition.id.clone();
                let previous = self.definitions.insert(id.clone(), definition);
                journal.push(Undo::Definition(id, previous));
            }
            WriteOp::DeleteBlockDefinition { definition_id } => {
                let previous = self.definitions.remove(&definition_id);
                journal.push(Undo::Definition(definition_id.clone(), previous));

                let grants: Vec<(Id, Id)> = self
                    .installations
                    .keys()
                    .filter(|(_, def)| *def == definition_id)
                    .cloned()
                    .collect();
                for key in grants {
                    let previous = self.installations.remove(&key);
                    journal.push(Undo::Installation(key, previous));
                }
            }
            WriteOp::GrantBlock(installation) => {
                let key = (
                    installation.user_id.clone(),
                    installation.definition_id.clone(),
                );
                if !self.installations.contains_key(&key) {
                    self.installations.insert(key.clone(), installation);
                    journal.push(Undo::Installation(key, None));
                }
            }
            WriteOp::RevokeBlock {
                user_id,
                definition_id,
            } => {
                let key = (user_id, definition_id);
                let previous = self.installations.remove(&key);
                journal.push(Undo::Installation(key, previous));
            }
            WriteOp::PutListing(mut listing) => {
                if let Some(existing) = self.listings.get(&listing.id) {
                    listing.install_count = existing.install_count;
                    listing.rating = existing.rating;
                }
                let id = listing.id.clone();
                let previous = self.listings.insert(id.clone(), listing);
                journal.push(Undo::Listing(id, previous));
            }
            WriteOp::IncrementInstallCount { listing_id } => {
                let listing = self
                    .listings
                    .get_mut(&listing_id)
                    .ok_or_else(|| anyhow!("Listing '{}' not found", listing_id))?;
                let previous = listing.clone();
                listing.install_count += 1;
                let (kind, target_id) = (listing.kind, listing.target_id.clone());
                journal.push(Undo::Listing(listing_id, Some(previous)));

                if kind == ListingKind::Block {
                    if let Some(definition) = self.definitions.get_mut(&target_id) {
                        let previous = definition.clone();
                        definition.install_count += 1;
                        journal.push(Undo::Definition(target_id, Some(previous)));
                    }
                }
            }
            WriteOp::UpsertRating(mut rating) => {
                if !self.listings.contains_key(&rating.listing_id) {
                    return Err(anyhow!("Listing '{}' not found", rating.listing_id));
                }
                let key = (rating.listing_id.clone(), rating.user_id.clone());
                if let Some(existing) = self.ratings.get(&key) {
                    rating.created_at = existing.created_at;
                }
                let previous = self.ratings.insert(key.clone(), rating);
                journal.push(Undo::Rating(key.clone(), previous));

                self.recompute_rating(&key.0, journal);
            }
        }
        Ok(())
    }

    fn recompute_rating(&mut self, listing_id: &Id, journal: &mut Vec<Undo>) {
        let aggregate = RatingAggregate::from_scores(
            self.ratings
                .values()
                .filter(|r| &r.listing_id == listing_id)
                .map(|r| r.score),
        );

        let Some(listing) = self.listings.get_mut(listing_id) else {
            return;
        };
        let previous = listing.clone();
        listing.rating = aggregate;
        let (kind, target_id) = (listing.kind, listing.target_id.clone());
        journal.push(Undo::Listing(listing_id.clone(), Some(previous)));

        match kind {
            ListingKind::Block => {
                if let Some(definition) = self.definitions.get_mut(&target_id) {
                    let previous = definition.clone();
                    definition.rating = aggregate;
                    journal.push(Undo::Definition(target_id, Some(previous)));
                }
            }
            ListingKind::Template => {
                if let Some(template) = self.templates.get_mut(&target_id) {
                    let previous = template.clone();
                    template.rating = aggregate;
                    journal.push(Undo::Template(target_id, Some(previous)));
                }
            }
        }
    }
}

/// Process-local store. Every batch runs under one write lock, so readers
/// see either none or all of it; failed batches are rolled back from a
/// journal of the keys they touched.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous form of [`BatchStore::apply`]; the lock is never held
    /// across an await, so callers outside an async context can write too.
    pub fn apply_now(&self, batch: WriteBatch) -> Result<()> {
        let mut state = self.state.write();
        let mut journal = Vec::new();

        for op in batch.ops {
            if let Err(err) = state.apply_op(op, &mut journal) {
                state.rollback(journal);
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlockDefinitionStore for MemoryStore {
    async fn get_block_definition(&self, id: &Id) -> Result<Option<BlockDefinition>> {
        Ok(self.state.read().definitions.get(id).cloned())
    }

    async fn list_block_definitions(&self) -> Result<Vec<BlockDefinition>> {
        let mut definitions: Vec<BlockDefinition> =
            self.state.read().definitions.values().cloned().collect();
        definitions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(definitions)
    }

    async fn list_installations_for_user(&self, user_id: &Id) -> Result<Vec<Installation>> {
        let mut installations: Vec<Installation> = self
            .state
            .read()
            .installations
            .values()
            .filter(|i| &i.user_id == user_id)
            .cloned()
            .collect();
        installations.sort_by(|a, b| a.installed_at.cmp(&b.installed_at));
        Ok(installations)
    }
}

#[async_trait::async_trait]
impl InstanceStore for MemoryStore {
    async fn get_instance(&self, id: &Id) -> Result<Option<Instance>> {
        Ok(self.state.read().instances.get(id).cloned())
    }

    async fn list_instances_for_owner(&self, owner_id: &Id) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .state
            .read()
            .instances
            .values()
            .filter(|i| &i.owner_id == owner_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(instances)
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    async fn get_snapshot(&self, id: &Id) -> Result<Option<Snapshot>> {
        Ok(self.state.read().snapshots.get(id).cloned())
    }

    async fn list_snapshots_for_instance(&self, instance_id: &Id) -> Result<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = self
            .state
            .read()
            .snapshots
            .values()
            .filter(|s| &s.instance_id == instance_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.instance_revision.cmp(&a.instance_revision))
        });
        Ok(snapshots)
    }
}

#[async_trait::async_trait]
impl TemplateStore for MemoryStore {
    async fn get_template(&self, id: &Id) -> Result<Option<Template>> {
        Ok(self.state.read().templates.get(id).cloned())
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        let mut templates: Vec<Template> = self.state.read().templates.values().cloned().collect();
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(templates)
    }
}

#[async_trait::async_trait]
impl MarketplaceStore for MemoryStore {
    async fn get_listing(&self, id: &Id) -> Result<Option<MarketplaceListing>> {
        Ok(self.state.read().listings.get(id).cloned())
    }

    async fn list_listings(&self) -> Result<Vec<MarketplaceListing>> {
        let mut listings: Vec<MarketplaceListing> =
            self.state.read().listings.values().cloned().collect();
        listings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(listings)
    }

    async fn list_listings_for_target(&self, target_id: &Id) -> Result<Vec<MarketplaceListing>> {
        Ok(self
            .state
            .read()
            .listings
            .values()
            .filter(|l| &l.target_id == target_id)
            .cloned()
            .collect())
    }

    async fn get_rating(&self, listing_id: &Id, user_id: &Id) -> Result<Option<Rating>> {
        let key = (listing_id.clone(), user_id.clone());
        Ok(self.state.read().ratings.get(&key).cloned())
    }

    async fn list_ratings_for_listing(&self, listing_id: &Id) -> Result<Vec<Rating>> {
        let mut ratings: Vec<Rating> = self
            .state
            .read()
            .ratings
            .values()
            .filter(|r| &r.listing_id == listing_id)
            .cloned()
            .collect();
        ratings.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(ratings)
    }
}

#[async_trait::async_trait]
impl BatchStore for MemoryStore {
    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        self.apply_now(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Instance;
    use chrono::Utc;

    fn instance(owner: &str) -> Instance {
        Instance::new(owner.to_string(), "Flow".to_string(), None)
    }

    fn listing(id: &str) -> MarketplaceListing {
        MarketplaceListing {
            id: id.to_string(),
            kind: ListingKind::Template,
            target_id: "tpl-1".to_string(),
            name: "Listing".to_string(),
            description: None,
            category: "marketing".to_string(),
            tags: Vec::new(),
            publisher_id: "author".to_string(),
            verified: false,
            featured: false,
            active: true,
            install_count: 0,
            rating: RatingAggregate::default(),
            created_at: Utc::now(),
        }
    }

    fn rating(listing_id: &str, user_id: &str, score: u8) -> Rating {
        Rating {
            listing_id: listing_id.to_string(),
            user_id: user_id.to_string(),
            score,
            review: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_guarded_instance_writes() {
        let store = MemoryStore::new();
        let mut flow = instance("alice");

        store
            .apply(WriteBatch::single(WriteOp::PutInstance {
                instance: flow.clone(),
                expect: Expect::Absent,
            }))
            .await
            .unwrap();

        // Inserting the same id again loses the race
        let err = store
            .apply(WriteBatch::single(WriteOp::PutInstance {
                instance: flow.clone(),
                expect: Expect::Absent,
            }))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<RevisionConflict>().is_some());

        flow.revision = 1;
        store
            .apply(WriteBatch::single(WriteOp::PutInstance {
                instance: flow.clone(),
                expect: Expect::Revision(0),
            }))
            .await
            .unwrap();

        let stale = store
            .apply(WriteBatch::single(WriteOp::PutInstance {
                instance: flow.clone(),
                expect: Expect::Revision(0),
            }))
            .await
            .unwrap_err();
        let conflict = stale.downcast_ref::<RevisionConflict>().unwrap();
        assert_eq!(conflict.found, Some(1));
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_every_op() {
        let store = MemoryStore::new();
        let flow = instance("alice");

        let batch = WriteBatch::new()
            .with(WriteOp::PutInstance {
                instance: flow.clone(),
                expect: Expect::Absent,
            })
            .with(WriteOp::PutListing(listing("l-1")))
            .with(WriteOp::IncrementTemplateUsage {
                template_id: "missing".to_string(),
            });

        assert!(store.apply(batch).await.is_err());
        assert!(store.get_instance(&flow.id).await.unwrap().is_none());
        assert!(store.get_listing(&"l-1".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rating_upsert_recomputes_aggregate() {
        let store = MemoryStore::new();
        store
            .apply(WriteBatch::single(WriteOp::PutListing(listing("l-1"))))
            .await
            .unwrap();

        for (user, score) in [("a", 4), ("b", 2), ("a", 5)] {
            store
                .apply(WriteBatch::single(WriteOp::UpsertRating(rating(
                    "l-1", user, score,
                ))))
                .await
                .unwrap();
        }

        let stored = store.get_listing(&"l-1".to_string()).await.unwrap().unwrap();
        assert_eq!(stored.rating.count, 2);
        assert!((stored.rating.avg - 3.5).abs() < f64::EPSILON);

        // Re-publishing the listing keeps store-owned counters
        store
            .apply(WriteBatch::single(WriteOp::PutListing(listing("l-1"))))
            .await
            .unwrap();
        let stored = store.get_listing(&"l-1".to_string()).await.unwrap().unwrap();
        assert_eq!(stored.rating.count, 2);
    }

    #[tokio::test]
    async fn test_deleting_instance_drops_its_snapshots() {
        let store = MemoryStore::new();
        let flow = instance("alice");
        let snapshot =
            Snapshot::capture(&flow, "v1".to_string(), None, "alice".to_string()).unwrap();

        store
            .apply(
                WriteBatch::new()
                    .with(WriteOp::PutInstance {
                        instance: flow.clone(),
                        expect: Expect::Absent,
                    })
                    .with(WriteOp::InsertSnapshot(snapshot.clone())),
            )
            .await
            .unwrap();

        store
            .apply(WriteBatch::single(WriteOp::DeleteInstance {
                instance_id: flow.id.clone(),
                expect: Expect::Revision(0),
            }))
            .await
            .unwrap();

        assert!(store.get_snapshot(&snapshot.id).await.unwrap().is_none());
    }
}
