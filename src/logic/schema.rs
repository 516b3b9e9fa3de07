use serde_json::{Map, Value};

use crate::model::{ConfigSchema, ConfigViolation, FieldSpec, FieldType, ViolationKind};

/// Interprets a [`ConfigSchema`] against a block config map
pub struct SchemaValidator;

impl SchemaValidator {
    /// Fill in declared defaults for fields the config leaves out
    pub fn apply_defaults(schema: &ConfigSchema, config: &mut Map<String, Value>) {
        for (name, spec) in &schema.fields {
            if let Some(default) = &spec.default {
                if !config.contains_key(name) {
                    config.insert(name.clone(), default.clone());
                }
            }
        }
    }

    /// Check a config map, returning every violation found
    pub fn validate(schema: &ConfigSchema, config: &Map<String, Value>) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();

        for key in config.keys() {
            if !schema.fields.contains_key(key) {
                violations.push(ConfigViolation::field(
                    ViolationKind::UndefinedField,
                    key,
                    format!("Field '{}' is not defined in the block schema", key),
                ));
            }
        }

        for (name, spec) in &schema.fields {
            match config.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        violations.push(ConfigViolation::field(
                            ViolationKind::MissingRequiredField,
                            name,
                            format!("Required field '{}' is missing", name),
                        ));
                    }
                }
                Some(value) => Self::validate_value(name, spec, value, &mut violations),
            }
        }

        violations
    }

    /// Declared defaults that would themselves fail their field's checks
    pub fn check_defaults(schema: &ConfigSchema) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();
        for (name, spec) in &schema.fields {
            if let Some(default) = spec.default.as_ref().filter(|d| !d.is_null()) {
                Self::validate_value(name, spec, default, &mut violations);
            }
        }
        violations
    }

    fn validate_value(
        name: &str,
        spec: &FieldSpec,
        value: &Value,
        violations: &mut Vec<ConfigViolation>,
    ) {
        if !Self::matches_type(spec.field_type, value) {
            violations.push(ConfigViolation::field(
                ViolationKind::TypeMismatch,
                name,
                format!(
                    "Type mismatch for field '{}': expected {}, found {}",
                    name,
                    spec.field_type,
                    Self::describe(value)
                ),
            ));
            // Constraints are meaningless on a value of the wrong type
            return;
        }

        let constraints = &spec.constraints;

        if let Some(number) = value.as_f64() {
            let below = constraints.min.is_some_and(|min| number < min);
            let above = constraints.max.is_some_and(|max| number > max);
            if below || above {
                violations.push(ConfigViolation::field(
                    ViolationKind::OutOfRange,
                    name,
                    format!(
                        "Field '{}' value {} is outside [{}, {}]",
                        name,
                        number,
                        constraints
                            .min
                            .map_or("-inf".to_string(), |m| m.to_string()),
                        constraints.max.map_or("inf".to_string(), |m| m.to_string())
                    ),
                ));
            }
        }

        let length = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            _ => None,
        };
        if let Some(length) = length {
            let short = constraints.min_length.is_some_and(|min| length < min);
            let long = constraints.max_length.is_some_and(|max| length > max);
            if short || long {
                violations.push(ConfigViolation::field(
                    ViolationKind::InvalidLength,
                    name,
                    format!("Field '{}' has invalid length {}", name, length),
                ));
            }
        }

        if let Some(allowed) = &constraints.one_of {
            if !allowed.contains(value) {
                violations.push(ConfigViolation::field(
                    ViolationKind::NotAllowed,
                    name,
                    format!("Field '{}' value {} is not an allowed choice", name, value),
                ));
            }
        }
    }

    fn matches_type(field_type: FieldType, value: &Value) -> bool {
        match field_type {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }

    fn describe(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_f64() => "number",
            Value::Number(_) => "integer",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_schema() -> ConfigSchema {
        ConfigSchema::new()
            .field(
                "url",
                FieldSpec::new(FieldType::String).required().with_length(Some(1), None),
            )
            .field(
                "method",
                FieldSpec::new(FieldType::String)
                    .with_default(json!("GET"))
                    .one_of(vec![json!("GET"), json!("POST")]),
            )
            .field(
                "timeout_secs",
                FieldSpec::new(FieldType::Integer).with_range(Some(1.0), Some(300.0)),
            )
    }

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_defaults_fill_only_missing_fields() {
        let schema = http_schema();
        let mut cfg = config(json!({"url": "https://example.com", "method": "POST"}));
        SchemaValidator::apply_defaults(&schema, &mut cfg);
        assert_eq!(cfg["method"], json!("POST"));

        let mut cfg = config(json!({"url": "https://example.com"}));
        SchemaValidator::apply_defaults(&schema, &mut cfg);
        assert_eq!(cfg["method"], json!("GET"));
        assert!(SchemaValidator::validate(&schema, &cfg).is_empty());
    }

    #[test]
    fn test_reports_each_kind_of_violation() {
        let schema = http_schema();
        let cfg = config(json!({
            "method": "DELETE",
            "timeout_secs": 900,
            "retries": 3
        }));

        let kinds: Vec<ViolationKind> = SchemaValidator::validate(&schema, &cfg)
            .into_iter()
            .map(|v| v.kind)
            .collect();

        assert!(kinds.contains(&ViolationKind::UndefinedField));
        assert!(kinds.contains(&ViolationKind::MissingRequiredField));
        assert!(kinds.contains(&ViolationKind::NotAllowed));
        assert!(kinds.contains(&ViolationKind::OutOfRange));
    }

    #[test]
    fn test_type_mismatch_skips_constraints() {
        let schema = http_schema();
        let cfg = config(json!({"url": "https://example.com", "timeout_secs": 2.5}));

        let violations = SchemaValidator::validate(&schema, &cfg);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::TypeMismatch);
        assert_eq!(violations[0].field.as_deref(), Some("timeout_secs"));
    }
}
