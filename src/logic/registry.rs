use chrono::Utc;
use log::info;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::logic::schema::SchemaValidator;
use crate::model::{
    generate_id, BlockDefinition, Id, Installation, ListingKind, NewBlockDefinition,
    RatingAggregate, UserContext, Visibility,
};
use crate::store::traits::{Store, WriteBatch, WriteOp};

/// Definitions resolved for one operation, keyed by id
pub type DefinitionSet = HashMap<Id, BlockDefinition>;

const MAX_NAME_LEN: usize = 255;

pub(crate) fn is_visible(
    definition: &BlockDefinition,
    actor: &UserContext,
    granted: &HashSet<Id>,
) -> bool {
    definition.builtin
        || definition.visibility == Visibility::Public
        || actor.owns(&definition.author)
        || granted.contains(&definition.id)
}

pub(crate) async fn granted_ids<S: Store>(
    store: &S,
    actor: &UserContext,
) -> EngineResult<HashSet<Id>> {
    Ok(store
        .list_installations_for_user(&actor.user_id)
        .await?
        .into_iter()
        .map(|i| i.definition_id)
        .collect())
}

/// Load the requested definitions, keeping only those the actor may use.
/// Ids that are absent or invisible are simply missing from the result.
pub(crate) async fn visible_definitions<S: Store>(
    store: &S,
    actor: &UserContext,
    ids: &[Id],
) -> EngineResult<DefinitionSet> {
    let mut set = DefinitionSet::new();
    if ids.is_empty() {
        return Ok(set);
    }

    let granted = granted_ids(store, actor).await?;
    for id in ids {
        if set.contains_key(id) {
            continue;
        }
        if let Some(definition) = store.get_block_definition(id).await? {
            if is_visible(&definition, actor, &granted) {
                set.insert(id.clone(), definition);
            }
        }
    }
    Ok(set)
}

pub(crate) fn grant_op(actor: &UserContext, definition_id: &Id, listing_id: &Id) -> WriteOp {
    WriteOp::GrantBlock(Installation {
        user_id: actor.user_id.clone(),
        definition_id: definition_id.clone(),
        listing_id: listing_id.clone(),
        installed_at: Utc::now(),
    })
}

/// Catalog of block types: built-ins, definitions the actor authored, public
/// ones, and ones granted through marketplace installs.
pub struct BlockRegistry<S> {
    store: Arc<S>,
}

impl<S: Store> BlockRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Author a new block definition owned by the actor
    pub async fn register(
        &self,
        actor: &UserContext,
        new_definition: NewBlockDefinition,
    ) -> EngineResult<BlockDefinition> {
        Self::check_definition(&new_definition)?;

        let now = Utc::now();
        let definition = BlockDefinition {
            id: generate_id(),
            name: new_definition.name.trim().to_string(),
            description: new_definition.description,
            category: new_definition.category.trim().to_string(),
            config_schema: new_definition.config_schema,
            ports: new_definition.ports,
            allows_self_loop: new_definition.allows_self_loop,
            version: new_definition.version,
            author: actor.user_id.clone(),
            visibility: new_definition.visibility,
            builtin: false,
            rating: RatingAggregate::default(),
            install_count: 0,
            created_at: now,
            updated_at: now,
        };

        self.store
            .apply(WriteBatch::single(WriteOp::PutBlockDefinition(
                definition.clone(),
            )))
            .await?;

        info!(
            "Registered block definition '{}' ({}) for {}",
            definition.name, definition.id, actor.user_id
        );
        Ok(definition)
    }

    pub async fn get(
        &self,
        actor: &UserContext,
        definition_id: &Id,
    ) -> EngineResult<BlockDefinition> {
        let mut found =
            visible_definitions(self.store.as_ref(), actor, std::slice::from_ref(definition_id))
                .await?;
        found
            .remove(definition_id)
            .ok_or_else(|| EngineError::not_found("block definition", definition_id.clone()))
    }

    /// Everything the actor can place, ordered by category then name
    pub async fn list_available(
        &self,
        actor: &UserContext,
        category: Option<&str>,
    ) -> EngineResult<Vec<BlockDefinition>> {
        let granted = granted_ids(self.store.as_ref(), actor).await?;
        let mut definitions: Vec<BlockDefinition> = self
            .store
            .list_block_definitions()
            .await?
            .into_iter()
            .filter(|d| is_visible(d, actor, &granted))
            .filter(|d| category.map_or(true, |c| d.category.eq_ignore_ascii_case(c)))
            .collect();

        definitions.sort_by(|a, b| a.category.cmp(&b.category).then(a.name.cmp(&b.name)));
        Ok(definitions)
    }

    /// Delete a definition the actor authored. Its marketplace listings are
    /// deactivated in the same write; blocks already placed keep their
    /// config and will report the definition as missing.
    pub async fn remove(&self, actor: &UserContext, definition_id: &Id) -> EngineResult<()> {
        let definition = self.get(actor, definition_id).await?;
        if definition.builtin || !actor.owns(&definition.author) {
            return Err(EngineError::not_found("block definition", definition_id.clone()));
        }

        let mut batch = WriteBatch::single(WriteOp::DeleteBlockDefinition {
            definition_id: definition_id.clone(),
        });
        for mut listing in self.store.list_listings_for_target(definition_id).await? {
            if listing.active {
                listing.active = false;
                batch.push(WriteOp::PutListing(listing));
            }
        }

        self.store.apply(batch).await?;
        info!("Removed block definition {}", definition_id);
        Ok(())
    }

    /// Make a definition usable by the actor through its marketplace listing.
    /// The listing must be an active block listing for that definition.
    pub async fn grant(
        &self,
        actor: &UserContext,
        definition_id: &Id,
        listing_id: &Id,
    ) -> EngineResult<()> {
        match self.store.get_listing(listing_id).await? {
            Some(listing)
                if listing.active
                    && listing.kind == ListingKind::Block
                    && &listing.target_id == definition_id => {}
            _ => return Err(EngineError::not_found("listing", listing_id.clone())),
        }
        if self.store.get_block_definition(definition_id).await?.is_none() {
            return Err(EngineError::missing_definition(definition_id.clone()));
        }
        self.store
            .apply(WriteBatch::single(grant_op(actor, definition_id, listing_id)))
            .await?;
        Ok(())
    }

    /// Drop the actor's grant. Definitions that stay visible for other
    /// reasons remain usable.
    pub async fn revoke(&self, actor: &UserContext, definition_id: &Id) -> EngineResult<()> {
        self.store
            .apply(WriteBatch::single(WriteOp::RevokeBlock {
                user_id: actor.user_id.clone(),
                definition_id: definition_id.clone(),
            }))
            .await?;
        Ok(())
    }

    fn check_definition(definition: &NewBlockDefinition) -> EngineResult<()> {
        let name = definition.name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(EngineError::validation(format!(
                "Block name must be 1..={} characters",
                MAX_NAME_LEN
            )));
        }
        if definition.category.trim().is_empty() {
            return Err(EngineError::validation("Block category is required"));
        }
        if definition.version.trim().is_empty() {
            return Err(EngineError::validation("Block version is required"));
        }

        let ports = definition.ports.inputs.iter().chain(&definition.ports.outputs);
        if ports.into_iter().any(|p| p.trim().is_empty()) {
            return Err(EngineError::validation("Port names must not be blank"));
        }

        let violations = SchemaValidator::check_defaults(&definition.config_schema);
        if !violations.is_empty() {
            return Err(EngineError::invalid_config(
                "Schema defaults violate their own constraints",
                violations,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConfigSchema, FieldSpec, FieldType, MarketplaceListing, PortSpec};
    use crate::store::traits::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn new_definition(name: &str, visibility: Visibility) -> NewBlockDefinition {
        NewBlockDefinition {
            name: name.to_string(),
            description: None,
            category: "actions".to_string(),
            config_schema: ConfigSchema::new()
                .field("channel", FieldSpec::new(FieldType::String).required()),
            ports: PortSpec::new(&["in"], &["out"]),
            allows_self_loop: false,
            version: "1.0.0".to_string(),
            visibility,
        }
    }

    fn block_listing(definition_id: &Id) -> MarketplaceListing {
        MarketplaceListing {
            id: generate_id(),
            kind: ListingKind::Block,
            target_id: definition_id.clone(),
            name: "Listed".to_string(),
            description: None,
            category: "actions".to_string(),
            tags: Vec::new(),
            publisher_id: "alice".to_string(),
            verified: false,
            featured: false,
            active: true,
            install_count: 0,
            rating: RatingAggregate::default(),
            created_at: Utc::now(),
        }
    }

    fn registry() -> BlockRegistry<MemoryStore> {
        BlockRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_private_definitions_are_hidden_from_others() {
        let registry = registry();
        let alice = UserContext::new("alice");
        let bob = UserContext::new("bob");

        let private = registry
            .register(&alice, new_definition("Slack post", Visibility::Private))
            .await
            .unwrap();
        registry
            .register(&alice, new_definition("Public post", Visibility::Public))
            .await
            .unwrap();

        assert!(registry.get(&alice, &private.id).await.is_ok());
        assert!(registry.get(&bob, &private.id).await.unwrap_err().is_not_found());
        assert_eq!(registry.list_available(&bob, None).await.unwrap().len(), 1);

        let listing = block_listing(&private.id);
        registry
            .store
            .apply(WriteBatch::single(WriteOp::PutListing(listing.clone())))
            .await
            .unwrap();
        registry.grant(&bob, &private.id, &listing.id).await.unwrap();
        assert!(registry.get(&bob, &private.id).await.is_ok());

        registry.revoke(&bob, &private.id).await.unwrap();
        assert!(registry.get(&bob, &private.id).await.is_err());
    }

    #[tokio::test]
    async fn test_grant_requires_a_matching_listing() {
        let registry = registry();
        let alice = UserContext::new("alice");
        let mallory = UserContext::new("mallory");
        let private = registry
            .register(&alice, new_definition("Payroll", Visibility::Private))
            .await
            .unwrap();

        let err = registry
            .grant(&mallory, &private.id, &"made-up".to_string())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        // A listing for some other definition does not unlock this one
        let other = registry
            .register(&alice, new_definition("Other", Visibility::Public))
            .await
            .unwrap();
        let listing = block_listing(&other.id);
        registry
            .store
            .apply(WriteBatch::single(WriteOp::PutListing(listing.clone())))
            .await
            .unwrap();
        let err = registry
            .grant(&mallory, &private.id, &listing.id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        assert!(registry.get(&mallory, &private.id).await.unwrap_err().is_not_found());
        assert!(registry
            .store
            .list_installations_for_user(&mallory.user_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_defaults_outside_constraints() {
        let registry = registry();
        let mut definition = new_definition("Delay", Visibility::Public);
        definition.config_schema = ConfigSchema::new().field(
            "seconds",
            FieldSpec::new(FieldType::Integer)
                .with_range(Some(1.0), Some(60.0))
                .with_default(json!(600)),
        );

        let err = registry
            .register(&UserContext::new("alice"), definition)
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_only_author_can_remove() {
        let registry = registry();
        let alice = UserContext::new("alice");
        let definition = registry
            .register(&alice, new_definition("Shared", Visibility::Public))
            .await
            .unwrap();

        let err = registry
            .remove(&UserContext::new("bob"), &definition.id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        registry.remove(&alice, &definition.id).await.unwrap();
        assert!(registry.get(&alice, &definition.id).await.is_err());
    }
}
