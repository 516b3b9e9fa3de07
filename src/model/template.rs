use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Id, Position, RatingAggregate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

/// A block inside a blueprint, addressed by a blueprint-local key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintNode {
    pub key: String,
    pub definition_id: Id,
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Relative to the blueprint origin (top-left of the captured graph)
    pub position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintEdge {
    pub source_key: String,
    pub source_port: String,
    pub target_key: String,
    pub target_port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Instance-agnostic topology: no instance, block or connection ids survive
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Blueprint {
    pub nodes: Vec<BlueprintNode>,
    pub edges: Vec<BlueprintEdge>,
}

impl Blueprint {
    pub fn node(&self, key: &str) -> Option<&BlueprintNode> {
        self.nodes.iter().find(|n| n.key == key)
    }

    /// Distinct definition ids in first-use order
    pub fn definition_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = Vec::new();
        for node in &self.nodes {
            if !ids.contains(&node.definition_id) {
                ids.push(node.definition_id.clone());
            }
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Id,
    pub owner_id: Id,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub blueprint: Blueprint,
    pub is_public: bool,
    #[serde(default)]
    pub rating: RatingAggregate,
    #[serde(default)]
    pub usage_count: u64,
    /// Instance the blueprint was captured from; informational only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_instance_id: Option<Id>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn is_visible_to(&self, user_id: &str) -> bool {
        self.is_public || self.owner_id == user_id
    }
}

/// Caller-supplied metadata for `create_from_instance`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_public: bool,
}

impl TemplateMetadata {
    pub fn named(name: &str, category: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            category: category.to_string(),
            difficulty: None,
            tags: Vec::new(),
            is_public: false,
        }
    }
}

/// Template update model for PATCH operations
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TemplateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Option<Difficulty>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
}

/// What a template would produce, without instantiating it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplatePreview {
    pub id: Id,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub difficulty: Option<Difficulty>,
    pub block_count: usize,
    pub connection_count: usize,
    pub definitions: Vec<PreviewDefinition>,
    /// Definitions the blueprint uses that the viewer cannot currently place
    pub unavailable_definitions: Vec<Id>,
    pub rating: RatingAggregate,
    pub usage_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewDefinition {
    pub definition_id: Id,
    pub name: Option<String>,
    pub category: Option<String>,
    pub uses: usize,
}
