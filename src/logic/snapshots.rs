use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::logic::commit::{load_owned_instance, mutate_instance};
use crate::model::{
    generate_id, Id, Instance, Snapshot, SnapshotData, SnapshotDiff, SnapshotSummary,
    UserContext,
};
use crate::store::traits::{Store, WriteBatch, WriteOp};

const MAX_NAME_LEN: usize = 255;

/// Swap the instance's live graph and canvas for a snapshot's copy.
///
/// Snapshot ids are kept so a capture/restore round trip is exact. An id is
/// only replaced when the live instance uses it for a different entity
/// (another definition, another edge, or the other kind of entity); edges
/// follow their endpoints' new ids. Returns how many ids were replaced.
pub(crate) fn restore_graph(instance: &mut Instance, data: SnapshotData) -> usize {
    let live_blocks: HashMap<&str, &str> = instance
        .blocks
        .iter()
        .map(|b| (b.id.as_str(), b.definition_id.as_str()))
        .collect();
    let live_connection_ids: HashSet<&str> =
        instance.connections.iter().map(|c| c.id.as_str()).collect();

    let mut block_ids: HashMap<Id, Id> = HashMap::new();
    let mut blocks = data.blocks;
    for block in &mut blocks {
        let collides = match live_blocks.get(block.id.as_str()) {
            Some(definition_id) => *definition_id != block.definition_id,
            None => live_connection_ids.contains(block.id.as_str()),
        };
        if collides {
            let fresh = generate_id();
            block_ids.insert(block.id.clone(), fresh.clone());
            block.id = fresh;
        }
    }

    let mut connections = data.connections;
    for connection in &mut connections {
        if let Some(id) = block_ids.get(&connection.source_id) {
            connection.source_id = id.clone();
        }
        if let Some(id) = block_ids.get(&connection.target_id) {
            connection.target_id = id.clone();
        }
    }

    let mut remapped = block_ids.len();
    for connection in &mut connections {
        let collides = match instance.connection(&connection.id) {
            Some(live) => !live.same_edge(connection),
            None => live_blocks.contains_key(connection.id.as_str()),
        };
        if collides {
            connection.id = generate_id();
            remapped += 1;
        }
    }

    instance.blocks = blocks;
    instance.connections = connections;
    instance.canvas = data.canvas;
    remapped
}

/// Immutable point-in-time copies of an instance's graph and canvas
pub struct SnapshotManager<S> {
    store: Arc<S>,
    settings: EngineSettings,
}

impl<S: Store> SnapshotManager<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        Self { store, settings }
    }

    pub async fn create(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        name: &str,
        description: Option<String>,
    ) -> EngineResult<SnapshotSummary> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(EngineError::validation(format!(
                "Snapshot name must be 1..={} characters",
                MAX_NAME_LEN
            )));
        }

        let instance = load_owned_instance(self.store.as_ref(), actor, instance_id).await?;
        let snapshot = Snapshot::capture(
            &instance,
            name.to_string(),
            description,
            actor.user_id.clone(),
        )?;

        self.store
            .apply(WriteBatch::single(WriteOp::InsertSnapshot(snapshot.clone())))
            .await?;

        info!(
            "Created snapshot '{}' ({}) of instance {} at revision {}",
            snapshot.name, snapshot.id, instance_id, snapshot.instance_revision
        );
        Ok(snapshot.summary())
    }

    /// Load a snapshot whose instance the actor owns
    pub async fn get(&self, actor: &UserContext, snapshot_id: &Id) -> EngineResult<Snapshot> {
        let snapshot = self
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| EngineError::not_found("snapshot", snapshot_id.clone()))?;

        match self.store.get_instance(&snapshot.instance_id).await? {
            Some(instance) if actor.owns(&instance.owner_id) => Ok(snapshot),
            _ => Err(EngineError::not_found("snapshot", snapshot_id.clone())),
        }
    }

    /// Replace the owning instance's live state with the snapshot's copy.
    /// A payload that fails to decode leaves the instance untouched.
    pub async fn restore(&self, actor: &UserContext, snapshot_id: &Id) -> EngineResult<Instance> {
        let snapshot = self.get(actor, snapshot_id).await?;
        let data = snapshot.get_data().map_err(|err| {
            warn!("Snapshot {} failed to decode: {}", snapshot_id, err);
            EngineError::corrupt(snapshot_id.clone(), err)
        })?;

        let (instance, remapped) = mutate_instance(
            self.store.as_ref(),
            &self.settings,
            actor,
            &snapshot.instance_id,
            |_| Vec::new(),
            |instance, _, _| Ok(restore_graph(instance, data.clone())),
        )
        .await?;

        info!(
            "Restored instance {} from snapshot {} ({} ids reassigned)",
            instance.id, snapshot_id, remapped
        );
        Ok(instance)
    }

    /// Newest first
    pub async fn list(
        &self,
        actor: &UserContext,
        instance_id: &Id,
    ) -> EngineResult<Vec<SnapshotSummary>> {
        load_owned_instance(self.store.as_ref(), actor, instance_id).await?;
        Ok(self
            .store
            .list_snapshots_for_instance(instance_id)
            .await?
            .iter()
            .map(Snapshot::summary)
            .collect())
    }

    pub async fn delete(&self, actor: &UserContext, snapshot_id: &Id) -> EngineResult<()> {
        self.get(actor, snapshot_id).await?;
        self.store
            .apply(WriteBatch::single(WriteOp::DeleteSnapshot {
                snapshot_id: snapshot_id.clone(),
            }))
            .await?;
        info!("Deleted snapshot {}", snapshot_id);
        Ok(())
    }

    /// What changed going from `base` to `other`; both must belong to the
    /// same instance
    pub async fn compare(
        &self,
        actor: &UserContext,
        base_id: &Id,
        other_id: &Id,
    ) -> EngineResult<SnapshotDiff> {
        let base = self.get(actor, base_id).await?;
        let other = self.get(actor, other_id).await?;
        if base.instance_id != other.instance_id {
            return Err(EngineError::validation(
                "Snapshots belong to different instances",
            ));
        }

        let base_data = base
            .get_data()
            .map_err(|err| EngineError::corrupt(base_id.clone(), err))?;
        let other_data = other
            .get_data()
            .map_err(|err| EngineError::corrupt(other_id.clone(), err))?;

        let mut diff = SnapshotData::diff(&base_data, &other_data);
        diff.base_snapshot_id = base.id;
        diff.other_snapshot_id = other.id;
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::traits::*;
    use crate::model::{BlockNode, Connection, Position};
    use crate::store::{Expect, MemoryStore};
    use serde_json::{json, Map};

    fn block(id: &str, definition_id: &str) -> BlockNode {
        BlockNode {
            id: id.to_string(),
            definition_id: definition_id.to_string(),
            config: Map::new(),
            position: Position::new(0.0, 0.0),
            label: None,
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> Connection {
        Connection {
            id: id.to_string(),
            source_id: source.to_string(),
            source_port: "out".to_string(),
            target_id: target.to_string(),
            target_port: "in".to_string(),
            config: None,
        }
    }

    fn flow() -> Instance {
        let mut instance = Instance::new("alice".to_string(), "Flow".to_string(), None);
        instance.blocks = vec![block("a", "trigger"), block("b", "action")];
        instance.connections = vec![edge("ab", "a", "b")];
        instance
    }

    async fn manager_with(instance: &Instance) -> SnapshotManager<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .apply(WriteBatch::single(WriteOp::PutInstance {
                instance: instance.clone(),
                expect: Expect::Absent,
            }))
            .await
            .unwrap();
        SnapshotManager::new(store, EngineSettings::default())
    }

    #[test]
    fn test_restore_keeps_ids_without_collisions() {
        let original = flow();
        let data = SnapshotData {
            format_version: 1,
            blocks: original.blocks.clone(),
            connections: original.connections.clone(),
            canvas: original.canvas.clone(),
        };

        let mut live = original.clone();
        live.blocks.pop();
        live.connections.clear();

        assert_eq!(restore_graph(&mut live, data), 0);
        assert_eq!(live.blocks, original.blocks);
        assert_eq!(live.connections, original.connections);
    }

    #[test]
    fn test_restore_reassigns_colliding_ids() {
        let original = flow();
        let data = SnapshotData {
            format_version: 1,
            blocks: original.blocks.clone(),
            connections: original.connections.clone(),
            canvas: original.canvas.clone(),
        };

        // Live graph reuses "b" for a different kind of block
        let mut live = original.clone();
        live.blocks[1] = block("b", "delay");
        live.connections.clear();

        assert_eq!(restore_graph(&mut live, data), 1);
        let restored_b = &live.blocks[1];
        assert_ne!(restored_b.id, "b");
        assert_eq!(restored_b.definition_id, "action");
        assert_eq!(live.connections[0].target_id, restored_b.id);
        assert_eq!(live.connections[0].id, "ab");
    }

    #[tokio::test]
    async fn test_create_validates_name() {
        let instance = flow();
        let manager = manager_with(&instance).await;
        let alice = UserContext::new("alice");

        let err = manager
            .create(&alice, &instance.id, "   ", None)
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let long = "x".repeat(256);
        assert!(manager
            .create(&alice, &instance.id, &long, None)
            .await
            .unwrap_err()
            .is_validation());

        let summary = manager
            .create(&alice, &instance.id, " v1 ", None)
            .await
            .unwrap();
        assert_eq!(summary.name, "v1");
        assert_eq!(summary.block_count, 2);
    }

    #[tokio::test]
    async fn test_snapshots_are_private_to_the_instance_owner() {
        let instance = flow();
        let manager = manager_with(&instance).await;
        let summary = manager
            .create(&UserContext::new("alice"), &instance.id, "v1", None)
            .await
            .unwrap();

        let bob = UserContext::new("bob");
        assert!(manager.get(&bob, &summary.id).await.unwrap_err().is_not_found());
        assert!(manager.restore(&bob, &summary.id).await.unwrap_err().is_not_found());
        assert!(manager.list(&bob, &instance.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_compare_reports_changes() {
        let instance = flow();
        let manager = manager_with(&instance).await;
        let alice = UserContext::new("alice");
        let v1 = manager.create(&alice, &instance.id, "v1", None).await.unwrap();

        let mut edited = manager.store.get_instance(&instance.id).await.unwrap().unwrap();
        edited.blocks.push(block("c", "action"));
        edited.connections.push(edge("bc", "b", "c"));
        edited.canvas = json!({"zoom": 2}).into();
        let revision = edited.revision;
        edited.revision += 1;
        manager
            .store
            .apply(WriteBatch::single(WriteOp::PutInstance {
                instance: edited,
                expect: Expect::Revision(revision),
            }))
            .await
            .unwrap();
        let v2 = manager.create(&alice, &instance.id, "v2", None).await.unwrap();

        let diff = manager.compare(&alice, &v1.id, &v2.id).await.unwrap();
        assert_eq!(diff.blocks_added, vec!["c".to_string()]);
        assert_eq!(diff.connections_added, vec!["bc".to_string()]);
        assert!(diff.blocks_removed.is_empty());
        assert!(diff.canvas_changed);

        let listed = manager.list(&alice, &instance.id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, v2.id);
    }
}
