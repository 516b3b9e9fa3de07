use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Id, Instance, RatingAggregate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingKind {
    Block,
    Template,
}

impl std::fmt::Display for ListingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ListingKind::Block => write!(f, "block"),
            ListingKind::Template => write!(f, "template"),
        }
    }
}

impl std::str::FromStr for ListingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(ListingKind::Block),
            "template" => Ok(ListingKind::Template),
            _ => Err(format!("Unknown listing kind: {}", s)),
        }
    }
}

/// A discoverable wrapper around a block definition or a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceListing {
    pub id: Id,
    pub kind: ListingKind,
    /// Block definition id or template id, depending on `kind`
    pub target_id: Id,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub publisher_id: Id,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub featured: bool,
    pub active: bool,
    #[serde(default)]
    pub install_count: u64,
    #[serde(default)]
    pub rating: RatingAggregate,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied metadata when publishing to the marketplace
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingMetadata {
    /// Defaults to the wrapped item's description
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A category and how many entries carry it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: usize,
}

/// One user's score for one listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub listing_id: Id,
    pub user_id: Id,
    pub score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CategoryQuery {
    /// Only listings whose verified flag matches, when set
    pub verified: Option<bool>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

/// Result of installing a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InstallOutcome {
    /// The definition is now usable in the user's registry
    Block { definition_id: Id },
    /// A new instance was created from the template
    Template { instance: Box<Instance> },
}
