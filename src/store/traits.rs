use anyhow::Result;
use thiserror::Error;

use crate::model::{
    BlockDefinition, Id, Installation, Instance, MarketplaceListing, Rating, Snapshot, Template,
};

/// Raised (inside `anyhow`) when a guarded instance write finds a different
/// revision than the one the caller read. Callers recover it with
/// `err.downcast_ref::<RevisionConflict>()` and retry on fresh state.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("instance '{instance_id}' changed concurrently (expected {expected:?}, found {found:?})")]
pub struct RevisionConflict {
    pub instance_id: Id,
    pub expected: Expect,
    pub found: Option<u64>,
}

/// Precondition on the stored instance row for a guarded write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// No instance with this id may exist yet
    Absent,
    /// The stored instance must be at exactly this revision
    Revision(u64),
}

/// One write inside an atomic [`WriteBatch`].
///
/// Derived counters (`usage_count`, `install_count`, rating aggregates) are
/// owned by the store: the `Put*` variants never overwrite them, they only
/// change through the dedicated increment and rating operations.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    PutInstance { instance: Instance, expect: Expect },
    /// Also removes every snapshot of the instance
    DeleteInstance { instance_id: Id, expect: Expect },
    /// Insert-only; an existing id is an error
    InsertSnapshot(Snapshot),
    DeleteSnapshot { snapshot_id: Id },
    PutTemplate(Template),
    DeleteTemplate { template_id: Id },
    IncrementTemplateUsage { template_id: Id },
    PutBlockDefinition(BlockDefinition),
    /// Also drops every grant of the definition
    DeleteBlockDefinition { definition_id: Id },
    /// Idempotent per (user, definition)
    GrantBlock(Installation),
    RevokeBlock { user_id: Id, definition_id: Id },
    PutListing(MarketplaceListing),
    /// Bumps the listing and, for block listings, the wrapped definition
    IncrementInstallCount { listing_id: Id },
    /// Upserts the (listing, user) rating, then recomputes the listing's
    /// aggregate from all stored ratings and mirrors it onto the wrapped
    /// definition or template
    UpsertRating(Rating),
}

/// Ordered writes that commit together or not at all
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(op: WriteOp) -> Self {
        Self { ops: vec![op] }
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn with(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[async_trait::async_trait]
pub trait BlockDefinitionStore: Send + Sync {
    async fn get_block_definition(&self, id: &Id) -> Result<Option<BlockDefinition>>;
    async fn list_block_definitions(&self) -> Result<Vec<BlockDefinition>>;
    /// Block grants the user obtained through marketplace installs
    async fn list_installations_for_user(&self, user_id: &Id) -> Result<Vec<Installation>>;
}

#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get_instance(&self, id: &Id) -> Result<Option<Instance>>;
    async fn list_instances_for_owner(&self, owner_id: &Id) -> Result<Vec<Instance>>;
}

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get_snapshot(&self, id: &Id) -> Result<Option<Snapshot>>;
    /// Newest first
    async fn list_snapshots_for_instance(&self, instance_id: &Id) -> Result<Vec<Snapshot>>;
}

#[async_trait::async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_template(&self, id: &Id) -> Result<Option<Template>>;
    async fn list_templates(&self) -> Result<Vec<Template>>;
}

#[async_trait::async_trait]
pub trait MarketplaceStore: Send + Sync {
    async fn get_listing(&self, id: &Id) -> Result<Option<MarketplaceListing>>;
    async fn list_listings(&self) -> Result<Vec<MarketplaceListing>>;
    async fn list_listings_for_target(&self, target_id: &Id) -> Result<Vec<MarketplaceListing>>;
    async fn get_rating(&self, listing_id: &Id, user_id: &Id) -> Result<Option<Rating>>;
    async fn list_ratings_for_listing(&self, listing_id: &Id) -> Result<Vec<Rating>>;
}

#[async_trait::async_trait]
pub trait BatchStore: Send + Sync {
    /// Apply every op in order as one atomic unit. On error nothing is
    /// persisted and no reader observes any part of the batch.
    async fn apply(&self, batch: WriteBatch) -> Result<()>;
}

pub trait Store:
    BlockDefinitionStore
    + InstanceStore
    + SnapshotStore
    + TemplateStore
    + MarketplaceStore
    + BatchStore
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: BlockDefinitionStore
        + InstanceStore
        + SnapshotStore
        + TemplateStore
        + MarketplaceStore
        + BatchStore
        + Send
        + Sync
{
}
