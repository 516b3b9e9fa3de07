use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::logic::commit::{load_owned_instance, mutate_instance};
use crate::logic::registry::{visible_definitions, DefinitionSet};
use crate::logic::schema::SchemaValidator;
use crate::model::{
    generate_id, BlockNode, ConfigViolation, Connection, Id, Instance, Position, UserContext,
    ViolationKind,
};
use crate::store::traits::Store;

/// Names a block inside a batch: an existing id, or the key given to a block
/// added earlier in the same batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockRef {
    Id(Id),
    Key(String),
}

impl From<&str> for BlockRef {
    fn from(id: &str) -> Self {
        BlockRef::Id(id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphEdit {
    AddBlock {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        definition_id: Id,
        #[serde(default)]
        config: Map<String, Value>,
        position: Position,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    RemoveBlock {
        block: BlockRef,
    },
    UpdateBlockConfig {
        block: BlockRef,
        patch: Map<String, Value>,
    },
    MoveBlock {
        block: BlockRef,
        position: Position,
    },
    Connect {
        source: BlockRef,
        source_port: String,
        target: BlockRef,
        target_port: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<Value>,
    },
    Disconnect {
        connection_id: Id,
    },
}

/// Endpoints of a connection to create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConnection {
    pub source_id: Id,
    pub source_port: String,
    pub target_id: Id,
    pub target_port: String,
    #[serde(default)]
    pub config: Option<Value>,
}

impl NewConnection {
    pub fn new(source_id: &str, source_port: &str, target_id: &str, target_port: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            source_port: source_port.to_string(),
            target_id: target_id.to_string(),
            target_port: target_port.to_string(),
            config: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub instance: Instance,
    /// Batch-local keys resolved to the ids of the blocks they created
    pub keys: BTreeMap<String, Id>,
    pub added_connections: Vec<Id>,
    pub removed_connections: Vec<Id>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphValidation {
    pub valid: bool,
    pub violations: Vec<ConfigViolation>,
    pub block_count: usize,
    pub connection_count: usize,
}

fn check_position(position: &Position) -> EngineResult<()> {
    if position.x.is_finite() && position.y.is_finite() {
        Ok(())
    } else {
        Err(EngineError::validation("Block position must be finite"))
    }
}

fn block_not_found(block_id: &str) -> EngineError {
    EngineError::not_found("block", block_id)
}

/// Graph mutations on an in-memory instance. Nothing here touches the store.
pub(crate) struct GraphMutator;

impl GraphMutator {
    pub(crate) fn add_block(
        instance: &mut Instance,
        definitions: &DefinitionSet,
        definition_id: &Id,
        mut config: Map<String, Value>,
        position: Position,
        label: Option<String>,
    ) -> EngineResult<BlockNode> {
        let definition = definitions
            .get(definition_id)
            .ok_or_else(|| EngineError::not_found("block definition", definition_id.clone()))?;
        check_position(&position)?;

        SchemaValidator::apply_defaults(&definition.config_schema, &mut config);
        let violations = SchemaValidator::validate(&definition.config_schema, &config);
        if !violations.is_empty() {
            return Err(EngineError::invalid_config(
                format!("Config does not match '{}' schema", definition.name),
                violations,
            ));
        }

        let node = BlockNode {
            id: generate_id(),
            definition_id: definition_id.clone(),
            config,
            position,
            label,
        };
        instance.blocks.push(node.clone());
        Ok(node)
    }

    /// Returns the ids of the connections removed with the block
    pub(crate) fn remove_block(instance: &mut Instance, block_id: &str) -> EngineResult<Vec<Id>> {
        let index = instance
            .blocks
            .iter()
            .position(|b| b.id == block_id)
            .ok_or_else(|| block_not_found(block_id))?;
        instance.blocks.remove(index);

        let mut removed = Vec::new();
        instance.connections.retain(|c| {
            if c.touches(block_id) {
                removed.push(c.id.clone());
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    /// Merge `patch` into the block's config: present keys overwrite,
    /// `null` clears, absent keys are kept
    pub(crate) fn update_block_config(
        instance: &mut Instance,
        definitions: &DefinitionSet,
        block_id: &str,
        patch: Map<String, Value>,
    ) -> EngineResult<BlockNode> {
        let block = instance
            .block_mut(block_id)
            .ok_or_else(|| block_not_found(block_id))?;
        let definition = definitions
            .get(&block.definition_id)
            .ok_or_else(|| EngineError::missing_definition(block.definition_id.clone()))?;

        let mut merged = block.config.clone();
        for (key, value) in patch {
            if value.is_null() {
                merged.remove(&key);
            } else {
                merged.insert(key, value);
            }
        }

        let violations: Vec<ConfigViolation> =
            SchemaValidator::validate(&definition.config_schema, &merged)
                .into_iter()
                .map(|v| v.about(block_id))
                .collect();
        if !violations.is_empty() {
            return Err(EngineError::invalid_config(
                format!("Config does not match '{}' schema", definition.name),
                violations,
            ));
        }

        block.config = merged;
        Ok(block.clone())
    }

    pub(crate) fn move_block(
        instance: &mut Instance,
        block_id: &str,
        position: Position,
    ) -> EngineResult<BlockNode> {
        check_position(&position)?;
        let block = instance
            .block_mut(block_id)
            .ok_or_else(|| block_not_found(block_id))?;
        block.position = position;
        Ok(block.clone())
    }

    pub(crate) fn connect(
        instance: &mut Instance,
        definitions: &DefinitionSet,
        request: NewConnection,
    ) -> EngineResult<Connection> {
        if request.source_port.trim().is_empty() || request.target_port.trim().is_empty() {
            return Err(EngineError::validation("Connection ports must not be blank"));
        }

        let source = instance.block(&request.source_id).ok_or_else(|| {
            EngineError::validation(format!(
                "Source block '{}' is not part of instance '{}'",
                request.source_id, instance.id
            ))
        })?;
        let target = instance.block(&request.target_id).ok_or_else(|| {
            EngineError::validation(format!(
                "Target block '{}' is not part of instance '{}'",
                request.target_id, instance.id
            ))
        })?;

        let source_definition = definitions.get(&source.definition_id);
        let target_definition = definitions.get(&target.definition_id);

        if source.id == target.id && !source_definition.is_some_and(|d| d.allows_self_loop) {
            return Err(EngineError::validation(format!(
                "Block '{}' cannot connect to itself",
                source.id
            )));
        }
        if let Some(definition) = source_definition {
            if !definition.ports.accepts_output(&request.source_port) {
                return Err(EngineError::validation(format!(
                    "'{}' has no output port '{}'",
                    definition.name, request.source_port
                )));
            }
        }
        if let Some(definition) = target_definition {
            if !definition.ports.accepts_input(&request.target_port) {
                return Err(EngineError::validation(format!(
                    "'{}' has no input port '{}'",
                    definition.name, request.target_port
                )));
            }
        }

        let connection = Connection {
            id: generate_id(),
            source_id: request.source_id,
            source_port: request.source_port,
            target_id: request.target_id,
            target_port: request.target_port,
            config: request.config,
        };

        if let Some(existing) = instance
            .connections
            .iter()
            .find(|c| c.same_edge(&connection))
        {
            return Err(EngineError::Conflict(format!(
                "Connection {}.{} -> {}.{} already exists as '{}'",
                connection.source_id,
                connection.source_port,
                connection.target_id,
                connection.target_port,
                existing.id
            )));
        }

        instance.connections.push(connection.clone());
        Ok(connection)
    }

    pub(crate) fn disconnect(
        instance: &mut Instance,
        connection_id: &str,
    ) -> EngineResult<Connection> {
        let index = instance
            .connections
            .iter()
            .position(|c| c.id == connection_id)
            .ok_or_else(|| EngineError::not_found("connection", connection_id))?;
        Ok(instance.connections.remove(index))
    }

    /// Every violation in the instance, without failing on any of them
    pub(crate) fn scan(instance: &Instance, definitions: &DefinitionSet) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();

        for block in &instance.blocks {
            match definitions.get(&block.definition_id) {
                Some(definition) => violations.extend(
                    SchemaValidator::validate(&definition.config_schema, &block.config)
                        .into_iter()
                        .map(|v| v.about(&block.id)),
                ),
                None => violations.push(ConfigViolation::on(
                    ViolationKind::UnknownDefinition,
                    &block.id,
                    format!(
                        "Block definition '{}' is not available",
                        block.definition_id
                    ),
                )),
            }
        }

        let mut seen: Vec<&Connection> = Vec::new();
        for connection in &instance.connections {
            let source = instance.block(&connection.source_id);
            let target = instance.block(&connection.target_id);
            match (source, target) {
                (Some(source), Some(target)) => {
                    let source_ports_ok = definitions
                        .get(&source.definition_id)
                        .map_or(true, |d| d.ports.accepts_output(&connection.source_port));
                    let target_ports_ok = definitions
                        .get(&target.definition_id)
                        .map_or(true, |d| d.ports.accepts_input(&connection.target_port));
                    if !source_ports_ok || !target_ports_ok {
                        violations.push(ConfigViolation::on(
                            ViolationKind::InvalidPort,
                            &connection.id,
                            format!(
                                "Connection uses undeclared port {}.{} -> {}.{}",
                                source.id,
                                connection.source_port,
                                target.id,
                                connection.target_port
                            ),
                        ));
                    }
                }
                _ => violations.push(ConfigViolation::on(
                    ViolationKind::OrphanedConnection,
                    &connection.id,
                    "Connection endpoint does not resolve to a block in this instance",
                )),
            }

            if seen.iter().any(|c| c.same_edge(connection)) {
                violations.push(ConfigViolation::on(
                    ViolationKind::DuplicateConnection,
                    &connection.id,
                    "Connection duplicates an earlier edge",
                ));
            }
            seen.push(connection);
        }

        violations
    }

    /// Apply edits in order; the first failure aborts the whole batch
    pub(crate) fn apply_batch(
        instance: &mut Instance,
        definitions: &DefinitionSet,
        edits: &[GraphEdit],
    ) -> EngineResult<(BTreeMap<String, Id>, Vec<Id>, Vec<Id>)> {
        let mut keys: BTreeMap<String, Id> = BTreeMap::new();
        let mut added = Vec::new();
        let mut removed = Vec::new();

        for (index, edit) in edits.iter().enumerate() {
            Self::apply_edit(instance, definitions, edit, &mut keys, &mut added, &mut removed)
                .map_err(|err| at_edit(err, index))?;
        }
        Ok((keys, added, removed))
    }

    fn apply_edit(
        instance: &mut Instance,
        definitions: &DefinitionSet,
        edit: &GraphEdit,
        keys: &mut BTreeMap<String, Id>,
        added: &mut Vec<Id>,
        removed: &mut Vec<Id>,
    ) -> EngineResult<()> {
        let resolve = |keys: &BTreeMap<String, Id>, block: &BlockRef| -> EngineResult<Id> {
            match block {
                BlockRef::Id(id) => Ok(id.clone()),
                BlockRef::Key(key) => keys.get(key).cloned().ok_or_else(|| {
                    EngineError::validation(format!("Unknown batch key '{}'", key))
                }),
            }
        };

        match edit {
            GraphEdit::AddBlock {
                key,
                definition_id,
                config,
                position,
                label,
            } => {
                if let Some(key) = key {
                    if keys.contains_key(key) {
                        return Err(EngineError::validation(format!(
                            "Batch key '{}' is used twice",
                            key
                        )));
                    }
                }
                let node = Self::add_block(
                    instance,
                    definitions,
                    definition_id,
                    config.clone(),
                    *position,
                    label.clone(),
                )?;
                if let Some(key) = key {
                    keys.insert(key.clone(), node.id);
                }
            }
            GraphEdit::RemoveBlock { block } => {
                let block_id = resolve(keys, block)?;
                for id in Self::remove_block(instance, &block_id)? {
                    // An edge both created and dropped in this batch never existed
                    if let Some(pos) = added.iter().position(|a| *a == id) {
                        added.remove(pos);
                    } else {
                        removed.push(id);
                    }
                }
            }
            GraphEdit::UpdateBlockConfig { block, patch } => {
                let block_id = resolve(keys, block)?;
                Self::update_block_config(instance, definitions, &block_id, patch.clone())?;
            }
            GraphEdit::MoveBlock { block, position } => {
                let block_id = resolve(keys, block)?;
                Self::move_block(instance, &block_id, *position)?;
            }
            GraphEdit::Connect {
                source,
                source_port,
                target,
                target_port,
                config,
            } => {
                let request = NewConnection {
                    source_id: resolve(keys, source)?,
                    source_port: source_port.clone(),
                    target_id: resolve(keys, target)?,
                    target_port: target_port.clone(),
                    config: config.clone(),
                };
                let connection = Self::connect(instance, definitions, request)?;
                added.push(connection.id);
            }
            GraphEdit::Disconnect { connection_id } => {
                Self::disconnect(instance, connection_id)?;
                if let Some(pos) = added.iter().position(|a| a == connection_id) {
                    added.remove(pos);
                } else {
                    removed.push(connection_id.clone());
                }
            }
        }
        Ok(())
    }
}

fn at_edit(err: EngineError, index: usize) -> EngineError {
    match err {
        EngineError::Validation {
            message,
            violations,
        } => EngineError::Validation {
            message: format!("edit #{}: {}", index, message),
            violations,
        },
        other => other,
    }
}

fn block_definition_ids(instance: &Instance) -> Vec<Id> {
    let mut seen = HashSet::new();
    instance
        .blocks
        .iter()
        .filter(|b| seen.insert(b.definition_id.clone()))
        .map(|b| b.definition_id.clone())
        .collect()
}

/// Invariant-preserving mutations of one instance's block graph
pub struct InstanceGraph<S> {
    store: Arc<S>,
    settings: EngineSettings,
}

impl<S: Store> InstanceGraph<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        Self { store, settings }
    }

    /// Place a new block; schema defaults are filled in before validation
    pub async fn add_block(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        definition_id: &Id,
        config: Map<String, Value>,
        position: Position,
    ) -> EngineResult<BlockNode> {
        let (_, node) = mutate_instance(
            self.store.as_ref(),
            &self.settings,
            actor,
            instance_id,
            |_| vec![definition_id.clone()],
            |instance, definitions, _| {
                GraphMutator::add_block(
                    instance,
                    definitions,
                    definition_id,
                    config.clone(),
                    position,
                    None,
                )
            },
        )
        .await?;

        info!("Added block {} to instance {}", node.id, instance_id);
        Ok(node)
    }

    /// Remove a block and every connection touching it; returns the ids of
    /// the removed connections
    pub async fn remove_block(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        block_id: &Id,
    ) -> EngineResult<Vec<Id>> {
        let (_, removed) = mutate_instance(
            self.store.as_ref(),
            &self.settings,
            actor,
            instance_id,
            |_| Vec::new(),
            |instance, _, _| GraphMutator::remove_block(instance, block_id),
        )
        .await?;

        info!(
            "Removed block {} from instance {} ({} connections)",
            block_id,
            instance_id,
            removed.len()
        );
        Ok(removed)
    }

    pub async fn update_block_config(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        block_id: &Id,
        patch: Map<String, Value>,
    ) -> EngineResult<BlockNode> {
        let (_, node) = mutate_instance(
            self.store.as_ref(),
            &self.settings,
            actor,
            instance_id,
            |instance| {
                instance
                    .block(block_id)
                    .map(|b| vec![b.definition_id.clone()])
                    .unwrap_or_default()
            },
            |instance, definitions, _| {
                GraphMutator::update_block_config(instance, definitions, block_id, patch.clone())
            },
        )
        .await?;
        Ok(node)
    }

    pub async fn move_block(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        block_id: &Id,
        position: Position,
    ) -> EngineResult<BlockNode> {
        let (_, node) = mutate_instance(
            self.store.as_ref(),
            &self.settings,
            actor,
            instance_id,
            |_| Vec::new(),
            |instance, _, _| GraphMutator::move_block(instance, block_id, position),
        )
        .await?;
        Ok(node)
    }

    pub async fn connect(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        request: NewConnection,
    ) -> EngineResult<Connection> {
        let (_, connection) = mutate_instance(
            self.store.as_ref(),
            &self.settings,
            actor,
            instance_id,
            |instance| {
                [&request.source_id, &request.target_id]
                    .into_iter()
                    .filter_map(|id| instance.block(id))
                    .map(|b| b.definition_id.clone())
                    .collect()
            },
            |instance, definitions, _| {
                GraphMutator::connect(instance, definitions, request.clone())
            },
        )
        .await?;

        info!(
            "Connected {}.{} -> {}.{} in instance {}",
            connection.source_id,
            connection.source_port,
            connection.target_id,
            connection.target_port,
            instance_id
        );
        Ok(connection)
    }

    /// Not idempotent: a missing connection is an error
    pub async fn disconnect(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        connection_id: &Id,
    ) -> EngineResult<Connection> {
        let (_, connection) = mutate_instance(
            self.store.as_ref(),
            &self.settings,
            actor,
            instance_id,
            |_| Vec::new(),
            |instance, _, _| GraphMutator::disconnect(instance, connection_id),
        )
        .await?;
        Ok(connection)
    }

    /// Report every integrity and schema problem without changing anything
    pub async fn validate(
        &self,
        actor: &UserContext,
        instance_id: &Id,
    ) -> EngineResult<GraphValidation> {
        let instance = load_owned_instance(self.store.as_ref(), actor, instance_id).await?;
        let definitions =
            visible_definitions(self.store.as_ref(), actor, &block_definition_ids(&instance))
                .await?;

        let violations = GraphMutator::scan(&instance, &definitions);
        Ok(GraphValidation {
            valid: violations.is_empty(),
            violations,
            block_count: instance.blocks.len(),
            connection_count: instance.connections.len(),
        })
    }

    /// Apply an ordered list of edits as one write. Either every edit lands
    /// or none does. Edits are re-validated against the current state on
    /// every attempt, so proposals computed from a stale read are safe.
    pub async fn apply_batch(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        edits: Vec<GraphEdit>,
    ) -> EngineResult<BatchOutcome> {
        if edits.is_empty() {
            return Err(EngineError::validation("Batch contains no edits"));
        }

        let added_definitions: Vec<Id> = edits
            .iter()
            .filter_map(|e| match e {
                GraphEdit::AddBlock { definition_id, .. } => Some(definition_id.clone()),
                _ => None,
            })
            .collect();

        let (instance, (keys, added_connections, removed_connections)) = mutate_instance(
            self.store.as_ref(),
            &self.settings,
            actor,
            instance_id,
            |instance| {
                let mut ids = block_definition_ids(instance);
                ids.extend(added_definitions.iter().cloned());
                ids
            },
            |instance, definitions, _| GraphMutator::apply_batch(instance, definitions, &edits),
        )
        .await?;

        info!(
            "Applied {} edits to instance {} (revision {})",
            edits.len(),
            instance_id,
            instance.revision
        );
        Ok(BatchOutcome {
            instance,
            keys,
            added_connections,
            removed_connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BlockDefinition, ConfigSchema, FieldSpec, FieldType, PortSpec, RatingAggregate,
        Visibility,
    };
    use chrono::Utc;
    use serde_json::json;

    fn definition(id: &str, ports: PortSpec, allows_self_loop: bool) -> BlockDefinition {
        BlockDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            category: "test".to_string(),
            config_schema: ConfigSchema::new()
                .field("label", FieldSpec::new(FieldType::String))
                .field(
                    "retries",
                    FieldSpec::new(FieldType::Integer)
                        .with_default(json!(1))
                        .with_range(Some(0.0), Some(5.0)),
                ),
            ports,
            allows_self_loop,
            version: "1".to_string(),
            author: "system".to_string(),
            visibility: Visibility::Public,
            builtin: true,
            rating: RatingAggregate::default(),
            install_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn definitions() -> DefinitionSet {
        let mut set = DefinitionSet::new();
        for def in [
            definition("trigger", PortSpec::new(&[], &["out"]), false),
            definition("action", PortSpec::new(&["in"], &["out"]), false),
            definition("loop", PortSpec::default(), true),
        ] {
            set.insert(def.id.clone(), def);
        }
        set
    }

    fn add(instance: &mut Instance, defs: &DefinitionSet, def: &str) -> BlockNode {
        GraphMutator::add_block(
            instance,
            defs,
            &def.to_string(),
            Map::new(),
            Position::new(0.0, 0.0),
            None,
        )
        .unwrap()
    }

    fn empty_instance() -> Instance {
        Instance::new("alice".to_string(), "Flow".to_string(), None)
    }

    #[test]
    fn test_add_block_applies_defaults_and_validates() {
        let defs = definitions();
        let mut instance = empty_instance();

        let node = add(&mut instance, &defs, "action");
        assert_eq!(node.config["retries"], json!(1));

        let mut bad = Map::new();
        bad.insert("retries".to_string(), json!(99));
        let err = GraphMutator::add_block(
            &mut instance,
            &defs,
            &"action".to_string(),
            bad,
            Position::new(1.0, 1.0),
            None,
        )
        .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(instance.blocks.len(), 1);

        let err = GraphMutator::add_block(
            &mut instance,
            &defs,
            &"nope".to_string(),
            Map::new(),
            Position::new(1.0, 1.0),
            None,
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_remove_block_cascades_only_incident_connections() {
        let defs = definitions();
        let mut instance = empty_instance();
        let a = add(&mut instance, &defs, "trigger");
        let b = add(&mut instance, &defs, "action");
        let c = add(&mut instance, &defs, "action");

        let ab = GraphMutator::connect(
            &mut instance,
            &defs,
            NewConnection::new(&a.id, "out", &b.id, "in"),
        )
        .unwrap();
        let bc = GraphMutator::connect(
            &mut instance,
            &defs,
            NewConnection::new(&b.id, "out", &c.id, "in"),
        )
        .unwrap();
        let ac = GraphMutator::connect(
            &mut instance,
            &defs,
            NewConnection::new(&a.id, "out", &c.id, "in"),
        )
        .unwrap();

        let removed = GraphMutator::remove_block(&mut instance, &b.id).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&ab.id) && removed.contains(&bc.id));
        assert_eq!(instance.connections.len(), 1);
        assert_eq!(instance.connections[0].id, ac.id);
        assert!(GraphMutator::scan(&instance, &defs).is_empty());
    }

    #[test]
    fn test_connect_rules() {
        let defs = definitions();
        let mut instance = empty_instance();
        let trigger = add(&mut instance, &defs, "trigger");
        let action = add(&mut instance, &defs, "action");
        let looping = add(&mut instance, &defs, "loop");

        // Self-loop only where the definition allows it
        let err = GraphMutator::connect(
            &mut instance,
            &defs,
            NewConnection::new(&action.id, "out", &action.id, "in"),
        )
        .unwrap_err();
        assert!(err.is_validation());
        GraphMutator::connect(
            &mut instance,
            &defs,
            NewConnection::new(&looping.id, "next", &looping.id, "body"),
        )
        .unwrap();

        // Undeclared port
        let err = GraphMutator::connect(
            &mut instance,
            &defs,
            NewConnection::new(&trigger.id, "error", &action.id, "in"),
        )
        .unwrap_err();
        assert!(err.is_validation());

        // Endpoint outside the instance
        let err = GraphMutator::connect(
            &mut instance,
            &defs,
            NewConnection::new(&trigger.id, "out", "elsewhere", "in"),
        )
        .unwrap_err();
        assert!(err.is_validation());

        // Exact duplicate
        let edge = NewConnection::new(&trigger.id, "out", &action.id, "in");
        GraphMutator::connect(&mut instance, &defs, edge.clone()).unwrap();
        let err = GraphMutator::connect(&mut instance, &defs, edge).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(instance.connections.len(), 2);
    }

    #[test]
    fn test_config_patch_merges_and_clears() {
        let defs = definitions();
        let mut instance = empty_instance();
        let node = add(&mut instance, &defs, "action");

        let patch = json!({"label": "first"}).as_object().cloned().unwrap();
        GraphMutator::update_block_config(&mut instance, &defs, &node.id, patch).unwrap();

        let patch = json!({"retries": 3}).as_object().cloned().unwrap();
        let updated =
            GraphMutator::update_block_config(&mut instance, &defs, &node.id, patch).unwrap();
        assert_eq!(updated.config["label"], json!("first"));
        assert_eq!(updated.config["retries"], json!(3));

        let patch = json!({"label": null}).as_object().cloned().unwrap();
        let updated =
            GraphMutator::update_block_config(&mut instance, &defs, &node.id, patch).unwrap();
        assert!(!updated.config.contains_key("label"));

        let mut without_action = defs.clone();
        without_action.remove("action");
        let err =
            GraphMutator::update_block_config(&mut instance, &without_action, &node.id, Map::new())
                .unwrap_err();
        assert!(matches!(err, EngineError::MissingBlockDefinition { .. }));
    }

    #[test]
    fn test_batch_resolves_keys_and_is_all_or_nothing() {
        let defs = definitions();
        let mut instance = empty_instance();

        let edits = vec![
            GraphEdit::AddBlock {
                key: Some("t".to_string()),
                definition_id: "trigger".to_string(),
                config: Map::new(),
                position: Position::new(0.0, 0.0),
                label: None,
            },
            GraphEdit::AddBlock {
                key: Some("a".to_string()),
                definition_id: "action".to_string(),
                config: Map::new(),
                position: Position::new(200.0, 0.0),
                label: Some("Notify".to_string()),
            },
            GraphEdit::Connect {
                source: BlockRef::Key("t".to_string()),
                source_port: "out".to_string(),
                target: BlockRef::Key("a".to_string()),
                target_port: "in".to_string(),
                config: None,
            },
        ];
        let mut working = instance.clone();
        let (keys, added, removed) =
            GraphMutator::apply_batch(&mut working, &defs, &edits).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(added.len(), 1);
        assert!(removed.is_empty());
        assert_eq!(working.connections[0].source_id, keys["t"]);

        let mut failing = edits.clone();
        failing.push(GraphEdit::RemoveBlock {
            block: BlockRef::Key("missing".to_string()),
        });
        let err = GraphMutator::apply_batch(&mut instance, &defs, &failing).unwrap_err();
        match err {
            EngineError::Validation { message, .. } => assert!(message.starts_with("edit #3")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_scan_reports_without_failing() {
        let defs = definitions();
        let mut instance = empty_instance();
        let trigger = add(&mut instance, &defs, "trigger");
        let action = add(&mut instance, &defs, "action");
        let edge = GraphMutator::connect(
            &mut instance,
            &defs,
            NewConnection::new(&trigger.id, "out", &action.id, "in"),
        )
        .unwrap();

        // Corrupt the stored graph directly
        let mut duplicate = edge.clone();
        duplicate.id = "dup".to_string();
        instance.connections.push(duplicate);
        instance.connections.push(Connection {
            id: "orphan".to_string(),
            source_id: "ghost".to_string(),
            source_port: "out".to_string(),
            target_id: action.id.clone(),
            target_port: "in".to_string(),
            config: None,
        });
        instance.blocks[1]
            .config
            .insert("retries".to_string(), json!("many"));

        let kinds: Vec<ViolationKind> = GraphMutator::scan(&instance, &defs)
            .into_iter()
            .map(|v| v.kind)
            .collect();
        assert!(kinds.contains(&ViolationKind::DuplicateConnection));
        assert!(kinds.contains(&ViolationKind::OrphanedConnection));
        assert!(kinds.contains(&ViolationKind::TypeMismatch));
    }
}
