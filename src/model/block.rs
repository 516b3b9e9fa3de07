use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{Id, RatingAggregate};

/// Value types a config field may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Number => write!(f, "number"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Object => write!(f, "object"),
            FieldType::Array => write!(f, "array"),
        }
    }
}

/// Optional constraints; each only applies to the field types it makes sense for
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldConstraints {
    /// Inclusive numeric lower bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive numeric upper bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Minimum length of strings (chars) or arrays (items)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Closed set of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub constraints: FieldConstraints,
    /// Filled in when the field is absent from a newly placed block
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl FieldSpec {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            constraints: FieldConstraints::default(),
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.constraints.min = min;
        self.constraints.max = max;
        self
    }

    pub fn with_length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.constraints.min_length = min;
        self.constraints.max_length = max;
        self
    }

    pub fn one_of(mut self, values: Vec<serde_json::Value>) -> Self {
        self.constraints.one_of = Some(values);
        self
    }
}

/// Tagged description of the config a block type accepts: `field → spec`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSchema {
    pub fields: BTreeMap<String, FieldSpec>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, spec: FieldSpec) -> Self {
        self.fields.insert(name.to_string(), spec);
        self
    }
}

/// Port names a block type exposes. An empty list accepts any port name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortSpec {
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl PortSpec {
    pub fn new(inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            inputs: inputs.iter().map(|p| p.to_string()).collect(),
            outputs: outputs.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn accepts_input(&self, port: &str) -> bool {
        self.inputs.is_empty() || self.inputs.iter().any(|p| p == port)
    }

    pub fn accepts_output(&self, port: &str) -> bool {
        self.outputs.is_empty() || self.outputs.iter().any(|p| p == port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub id: Id,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub category: String,
    pub config_schema: ConfigSchema,
    #[serde(default)]
    pub ports: PortSpec,
    /// Whether a connection may leave and enter the same block
    #[serde(default)]
    pub allows_self_loop: bool,
    pub version: String,
    pub author: Id,
    pub visibility: Visibility,
    /// Shipped with the engine; cannot be removed by users
    #[serde(default)]
    pub builtin: bool,
    #[serde(default)]
    pub rating: RatingAggregate,
    #[serde(default)]
    pub install_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input model for authoring a block type; id, author and counters are set server-side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBlockDefinition {
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub config_schema: ConfigSchema,
    #[serde(default)]
    pub ports: PortSpec,
    #[serde(default)]
    pub allows_self_loop: bool,
    pub version: String,
    pub visibility: Visibility,
}

/// Grant recorded when a user installs a block listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installation {
    pub user_id: Id,
    pub definition_id: Id,
    pub listing_id: Id,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TypeMismatch,
    MissingRequiredField,
    UndefinedField,
    OutOfRange,
    InvalidLength,
    NotAllowed,
    UnknownDefinition,
    OrphanedConnection,
    DuplicateConnection,
    InvalidPort,
}

/// One problem found while checking a config or a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigViolation {
    pub kind: ViolationKind,
    /// Block or connection the problem was found on, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl ConfigViolation {
    pub fn field(kind: ViolationKind, field: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject_id: None,
            field: Some(field.to_string()),
            message: message.into(),
        }
    }

    pub fn on(kind: ViolationKind, subject_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject_id: Some(subject_id.to_string()),
            field: None,
            message: message.into(),
        }
    }

    pub fn about(mut self, subject_id: &str) -> Self {
        self.subject_id = Some(subject_id.to_string());
        self
    }
}
