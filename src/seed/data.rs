use chrono::Utc;
use serde_json::json;

use crate::model::{
    BlockDefinition, ConfigSchema, FieldSpec, FieldType, PortSpec, RatingAggregate, Visibility,
};

pub const SYSTEM_AUTHOR: &str = "system";
pub const BUILTIN_VERSION: &str = "1.0.0";

/// Helper function to create a BlockDefinition with system audit info
fn create_system_block(
    id: &str,
    name: &str,
    description: &str,
    category: &str,
    config_schema: ConfigSchema,
    ports: PortSpec,
) -> BlockDefinition {
    let now = Utc::now();

    BlockDefinition {
        id: id.to_string(),
        name: name.to_string(),
        description: Some(description.to_string()),
        category: category.to_string(),
        config_schema,
        ports,
        allows_self_loop: false,
        version: BUILTIN_VERSION.to_string(),
        author: SYSTEM_AUTHOR.to_string(),
        visibility: Visibility::Public,
        builtin: true,
        rating: RatingAggregate::default(),
        install_count: 0,
        created_at: now,
        updated_at: now,
    }
}

fn webhook_trigger() -> BlockDefinition {
    create_system_block(
        "builtin.trigger.webhook",
        "Webhook",
        "Starts the flow when an HTTP request arrives",
        "trigger",
        ConfigSchema::new()
            .field(
                "path",
                FieldSpec::new(FieldType::String)
                    .required()
                    .with_length(Some(1), Some(255)),
            )
            .field(
                "method",
                FieldSpec::new(FieldType::String)
                    .with_default(json!("POST"))
                    .one_of(vec![json!("GET"), json!("POST"), json!("PUT"), json!("DELETE")]),
            )
            .field("secret", FieldSpec::new(FieldType::String)),
        PortSpec::new(&[], &["out"]),
    )
}

fn schedule_trigger() -> BlockDefinition {
    create_system_block(
        "builtin.trigger.schedule",
        "Schedule",
        "Starts the flow on a cron schedule",
        "trigger",
        ConfigSchema::new()
            .field(
                "cron",
                FieldSpec::new(FieldType::String)
                    .required()
                    .with_length(Some(9), Some(120)),
            )
            .field(
                "timezone",
                FieldSpec::new(FieldType::String).with_default(json!("UTC")),
            ),
        PortSpec::new(&[], &["out"]),
    )
}

fn http_request_action() -> BlockDefinition {
    create_system_block(
        "builtin.action.http_request",
        "HTTP Request",
        "Calls an external HTTP endpoint",
        "action",
        ConfigSchema::new()
            .field(
                "url",
                FieldSpec::new(FieldType::String)
                    .required()
                    .with_length(Some(1), Some(2048)),
            )
            .field(
                "method",
                FieldSpec::new(FieldType::String)
                    .with_default(json!("GET"))
                    .one_of(vec![
                        json!("GET"),
                        json!("POST"),
                        json!("PUT"),
                        json!("PATCH"),
                        json!("DELETE"),
                    ]),
            )
            .field("headers", FieldSpec::new(FieldType::Object))
            .field("body", FieldSpec::new(FieldType::String))
            .field(
                "timeout_seconds",
                FieldSpec::new(FieldType::Integer)
                    .with_default(json!(30))
                    .with_range(Some(1.0), Some(300.0)),
            ),
        PortSpec::new(&["in"], &["success", "error"]),
    )
}

fn send_email_action() -> BlockDefinition {
    create_system_block(
        "builtin.action.send_email",
        "Send Email",
        "Sends an email message",
        "action",
        ConfigSchema::new()
            .field(
                "to",
                FieldSpec::new(FieldType::Array)
                    .required()
                    .with_length(Some(1), Some(50)),
            )
            .field(
                "subject",
                FieldSpec::new(FieldType::String)
                    .required()
                    .with_length(Some(1), Some(255)),
            )
            .field("body", FieldSpec::new(FieldType::String).required())
            .field(
                "format",
                FieldSpec::new(FieldType::String)
                    .with_default(json!("text"))
                    .one_of(vec![json!("text"), json!("html")]),
            ),
        PortSpec::new(&["in"], &["out"]),
    )
}

fn delay_action() -> BlockDefinition {
    create_system_block(
        "builtin.action.delay",
        "Delay",
        "Waits before passing control on",
        "action",
        ConfigSchema::new().field(
            "seconds",
            FieldSpec::new(FieldType::Integer)
                .required()
                .with_range(Some(1.0), Some(86_400.0)),
        ),
        PortSpec::new(&["in"], &["out"]),
    )
}

fn condition_logic() -> BlockDefinition {
    create_system_block(
        "builtin.logic.condition",
        "Condition",
        "Routes to one of two branches based on an expression",
        "logic",
        ConfigSchema::new()
            .field(
                "expression",
                FieldSpec::new(FieldType::String)
                    .required()
                    .with_length(Some(1), Some(1000)),
            ),
        PortSpec::new(&["in"], &["true", "false"]),
    )
}

fn loop_logic() -> BlockDefinition {
    let mut definition = create_system_block(
        "builtin.logic.loop",
        "Loop",
        "Repeats its body for each item or until the iteration limit",
        "logic",
        ConfigSchema::new()
            .field("items_path", FieldSpec::new(FieldType::String))
            .field(
                "max_iterations",
                FieldSpec::new(FieldType::Integer)
                    .with_default(json!(100))
                    .with_range(Some(1.0), Some(10_000.0)),
            ),
        PortSpec::new(&["in", "continue"], &["body", "continue", "done"]),
    );
    definition.allows_self_loop = true;
    definition
}

/// Block types shipped with the engine
pub fn builtin_blocks() -> Vec<BlockDefinition> {
    vec![
        webhook_trigger(),
        schedule_trigger(),
        http_request_action(),
        send_email_action(),
        delay_action(),
        condition_logic(),
        loop_logic(),
    ]
}
