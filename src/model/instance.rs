use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_id, Id, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Draft,
    Active,
    Inactive,
    Suspended,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus::Draft
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InstanceStatus::Draft => write!(f, "draft"),
            InstanceStatus::Active => write!(f, "active"),
            InstanceStatus::Inactive => write!(f, "inactive"),
            InstanceStatus::Suspended => write!(f, "suspended"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(InstanceStatus::Draft),
            "active" => Ok(InstanceStatus::Active),
            "inactive" => Ok(InstanceStatus::Inactive),
            "suspended" => Ok(InstanceStatus::Suspended),
            _ => Err(format!("Unknown instance status: {}", s)),
        }
    }
}

/// A placed, configured block inside one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockNode {
    pub id: Id,
    pub definition_id: Id,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Directed edge from one block's output port to another block's input port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Id,
    pub source_id: Id,
    pub source_port: String,
    pub target_id: Id,
    pub target_port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl Connection {
    pub fn touches(&self, block_id: &str) -> bool {
        self.source_id == block_id || self.target_id == block_id
    }

    /// Same endpoints and ports, ignoring id and config
    pub fn same_edge(&self, other: &Connection) -> bool {
        self.source_id == other.source_id
            && self.source_port == other.source_port
            && self.target_id == other.target_id
            && self.target_port == other.target_port
    }
}

/// Opaque layout/view state; the engine never looks inside
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanvasState(pub serde_json::Value);

impl Default for CanvasState {
    fn default() -> Self {
        CanvasState(serde_json::Value::Object(serde_json::Map::new()))
    }
}

impl From<serde_json::Value> for CanvasState {
    fn from(value: serde_json::Value) -> Self {
        CanvasState(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Id,
    pub owner_id: Id,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: InstanceStatus,
    pub blocks: Vec<BlockNode>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub canvas: CanvasState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_template_id: Option<Id>,
    /// Bumped on every persisted write; used for optimistic concurrency
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(owner_id: Id, name: String, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            owner_id,
            name,
            description,
            status: InstanceStatus::Draft,
            blocks: Vec::new(),
            connections: Vec::new(),
            canvas: CanvasState::default(),
            source_template_id: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn block(&self, block_id: &str) -> Option<&BlockNode> {
        self.blocks.iter().find(|b| b.id == block_id)
    }

    pub fn block_mut(&mut self, block_id: &str) -> Option<&mut BlockNode> {
        self.blocks.iter_mut().find(|b| b.id == block_id)
    }

    pub fn connection(&self, connection_id: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == connection_id)
    }

    pub fn incident_connections(&self, block_id: &str) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.touches(block_id))
            .collect()
    }

    /// Update the updated_at timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            name: self.name.clone(),
            status: self.status,
            block_count: self.blocks.len(),
            connection_count: self.connections.len(),
            source_template_id: self.source_template_id.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Lightweight listing row for an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: Id,
    pub owner_id: Id,
    pub name: String,
    pub status: InstanceStatus,
    pub block_count: usize,
    pub connection_count: usize,
    pub source_template_id: Option<Id>,
    pub updated_at: DateTime<Utc>,
}

/// Instance input model for creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInstance {
    pub name: String,
    pub description: Option<String>,
    /// Seed the graph from this template's blueprint
    pub template_id: Option<Id>,
}

/// Instance update model for PATCH operations
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstanceUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `Some(None)` clears the description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
}
