use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::logic::commit::{
    is_revision_conflict, load_owned_instance, mutate_instance, retries_exhausted,
};
use crate::logic::templates::TemplateService;
use crate::model::{
    generate_id, Id, Instance, InstanceStatus, InstanceSummary, InstanceUpdate, NewInstance, Page,
    UserContext,
};
use crate::store::traits::{Expect, Store, WriteBatch, WriteOp};

const MIN_NAME_LEN: usize = 3;
const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    Start,
    Stop,
    Suspend,
    Reactivate,
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LifecycleAction::Start => write!(f, "start"),
            LifecycleAction::Stop => write!(f, "stop"),
            LifecycleAction::Suspend => write!(f, "suspend"),
            LifecycleAction::Reactivate => write!(f, "reactivate"),
        }
    }
}

/// Status an action leads to from `status`, if the move is allowed
pub fn next_status(status: InstanceStatus, action: LifecycleAction) -> Option<InstanceStatus> {
    use InstanceStatus::*;
    match (action, status) {
        (LifecycleAction::Start, Draft | Active | Inactive) => Some(Active),
        (LifecycleAction::Stop, Active) => Some(Inactive),
        (LifecycleAction::Suspend, _) => Some(Suspended),
        (LifecycleAction::Reactivate, Suspended) => Some(Active),
        _ => None,
    }
}

fn check_name(name: &str) -> EngineResult<String> {
    let name = name.trim();
    let length = name.chars().count();
    if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&length) {
        return Err(EngineError::validation(format!(
            "Instance name must be {}..={} characters",
            MIN_NAME_LEN, MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

/// Copy of `source` with fresh block and connection ids
fn copy_graph(source: &Instance, target: &mut Instance) {
    let ids: HashMap<&str, Id> = source
        .blocks
        .iter()
        .map(|b| (b.id.as_str(), generate_id()))
        .collect();

    target.blocks = source
        .blocks
        .iter()
        .map(|b| {
            let mut block = b.clone();
            block.id = ids[b.id.as_str()].clone();
            block
        })
        .collect();
    target.connections = source
        .connections
        .iter()
        .filter_map(|c| {
            let mut connection = c.clone();
            connection.id = generate_id();
            connection.source_id = ids.get(c.source_id.as_str())?.clone();
            connection.target_id = ids.get(c.target_id.as_str())?.clone();
            Some(connection)
        })
        .collect();
    target.canvas = source.canvas.clone();
}

/// Create, read, list, update, delete and duplicate instances, and move
/// them through their run states
pub struct InstanceLifecycleManager<S> {
    store: Arc<S>,
    settings: EngineSettings,
    templates: TemplateService<S>,
}

impl<S: Store> InstanceLifecycleManager<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        let templates = TemplateService::new(store.clone(), settings.clone());
        Self {
            store,
            settings,
            templates,
        }
    }

    /// New draft instance, empty or seeded from a template
    pub async fn create(
        &self,
        actor: &UserContext,
        new_instance: NewInstance,
    ) -> EngineResult<Instance> {
        let name = check_name(&new_instance.name)?;

        let (instance, batch) = match &new_instance.template_id {
            Some(template_id) => {
                self.templates
                    .prepare_instantiation(
                        actor,
                        template_id,
                        Some(name),
                        new_instance.description.clone(),
                    )
                    .await?
            }
            None => {
                let instance =
                    Instance::new(actor.user_id.clone(), name, new_instance.description.clone());
                let batch = WriteBatch::single(WriteOp::PutInstance {
                    instance: instance.clone(),
                    expect: Expect::Absent,
                });
                (instance, batch)
            }
        };

        self.store.apply(batch).await?;
        info!(
            "Created instance '{}' ({}) for {}",
            instance.name, instance.id, actor.user_id
        );
        Ok(instance)
    }

    pub async fn read(&self, actor: &UserContext, instance_id: &Id) -> EngineResult<Instance> {
        load_owned_instance(self.store.as_ref(), actor, instance_id).await
    }

    /// The actor's instances, most recently updated first
    pub async fn list(
        &self,
        actor: &UserContext,
        page: Option<usize>,
        per_page: Option<usize>,
    ) -> EngineResult<Page<InstanceSummary>> {
        let mut summaries: Vec<InstanceSummary> = self
            .store
            .list_instances_for_owner(&actor.user_id)
            .await?
            .iter()
            .map(Instance::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(Page::from_vec(
            summaries,
            page.unwrap_or(1),
            self.settings.per_page(per_page),
        ))
    }

    pub async fn update(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        update: InstanceUpdate,
    ) -> EngineResult<Instance> {
        let name = update.name.as_deref().map(check_name).transpose()?;

        let (instance, ()) = mutate_instance(
            self.store.as_ref(),
            &self.settings,
            actor,
            instance_id,
            |_| Vec::new(),
            |instance, _, _| {
                if let Some(name) = &name {
                    instance.name = name.clone();
                }
                if let Some(description) = &update.description {
                    instance.description = description.clone();
                }
                Ok(())
            },
        )
        .await?;
        Ok(instance)
    }

    /// Delete the instance together with its snapshots. Templates captured
    /// from it are independent copies and stay.
    pub async fn delete(&self, actor: &UserContext, instance_id: &Id) -> EngineResult<()> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let instance = load_owned_instance(self.store.as_ref(), actor, instance_id).await?;
            let batch = WriteBatch::single(WriteOp::DeleteInstance {
                instance_id: instance.id.clone(),
                expect: Expect::Revision(instance.revision),
            });

            match self.store.apply(batch).await {
                Ok(()) => break,
                Err(err) if is_revision_conflict(&err) => {
                    if attempts > self.settings.max_write_retries {
                        return Err(retries_exhausted(instance_id, attempts));
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!("Deleted instance {}", instance_id);
        Ok(())
    }

    /// Independent draft copy with fresh ids
    pub async fn duplicate(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        name: Option<String>,
    ) -> EngineResult<Instance> {
        let source = load_owned_instance(self.store.as_ref(), actor, instance_id).await?;
        let name = match name {
            Some(name) => check_name(&name)?,
            None => {
                let base: String = source.name.chars().take(MAX_NAME_LEN - 7).collect();
                format!("{} (copy)", base)
            }
        };

        let mut copy = Instance::new(actor.user_id.clone(), name, source.description.clone());
        copy_graph(&source, &mut copy);
        copy.source_template_id = source.source_template_id.clone();

        self.store
            .apply(WriteBatch::single(WriteOp::PutInstance {
                instance: copy.clone(),
                expect: Expect::Absent,
            }))
            .await?;

        info!("Duplicated instance {} as {}", instance_id, copy.id);
        Ok(copy)
    }

    async fn transition(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        action: LifecycleAction,
    ) -> EngineResult<Instance> {
        let (instance, previous) = mutate_instance(
            self.store.as_ref(),
            &self.settings,
            actor,
            instance_id,
            |_| Vec::new(),
            |instance, _, _| {
                let previous = instance.status;
                instance.status = next_status(previous, action).ok_or_else(|| {
                    EngineError::validation(format!(
                        "Cannot {} an instance that is {}",
                        action, previous
                    ))
                })?;
                Ok(previous)
            },
        )
        .await?;

        info!(
            "Instance {} {} -> {} ({})",
            instance_id, previous, instance.status, action
        );
        Ok(instance)
    }

    pub async fn start(&self, actor: &UserContext, instance_id: &Id) -> EngineResult<Instance> {
        self.transition(actor, instance_id, LifecycleAction::Start)
            .await
    }

    pub async fn stop(&self, actor: &UserContext, instance_id: &Id) -> EngineResult<Instance> {
        self.transition(actor, instance_id, LifecycleAction::Stop)
            .await
    }

    pub async fn suspend(&self, actor: &UserContext, instance_id: &Id) -> EngineResult<Instance> {
        self.transition(actor, instance_id, LifecycleAction::Suspend)
            .await
    }

    pub async fn reactivate(
        &self,
        actor: &UserContext,
        instance_id: &Id,
    ) -> EngineResult<Instance> {
        self.transition(actor, instance_id, LifecycleAction::Reactivate)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::traits::*;
    use crate::store::MemoryStore;
    use InstanceStatus::*;

    #[test]
    fn test_state_machine() {
        assert_eq!(next_status(Draft, LifecycleAction::Start), Some(Active));
        assert_eq!(next_status(Active, LifecycleAction::Start), Some(Active));
        assert_eq!(next_status(Inactive, LifecycleAction::Start), Some(Active));
        assert_eq!(next_status(Suspended, LifecycleAction::Start), None);

        assert_eq!(next_status(Active, LifecycleAction::Stop), Some(Inactive));
        assert_eq!(next_status(Draft, LifecycleAction::Stop), None);

        for status in [Draft, Active, Inactive, Suspended] {
            assert_eq!(next_status(status, LifecycleAction::Suspend), Some(Suspended));
        }

        assert_eq!(next_status(Suspended, LifecycleAction::Reactivate), Some(Active));
        assert_eq!(next_status(Inactive, LifecycleAction::Reactivate), None);
    }

    #[test]
    fn test_name_rules() {
        assert!(check_name("ab").is_err());
        assert!(check_name("   abc   ").is_ok());
        assert!(check_name(&"n".repeat(101)).is_err());
        assert_eq!(check_name(" My flow ").unwrap(), "My flow");
    }

    #[tokio::test]
    async fn test_list_past_the_last_page_is_empty() {
        let manager =
            InstanceLifecycleManager::new(Arc::new(MemoryStore::new()), EngineSettings::default());
        let alice = UserContext::new("alice");
        manager
            .create(
                &alice,
                NewInstance {
                    name: "Only flow".to_string(),
                    description: None,
                    template_id: None,
                },
            )
            .await
            .unwrap();

        let page = manager.list(&alice, Some(usize::MAX), None).await.unwrap();
        assert_eq!(page.total, 1);
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn test_create_update_and_transitions() {
        let manager =
            InstanceLifecycleManager::new(Arc::new(MemoryStore::new()), EngineSettings::default());
        let alice = UserContext::new("alice");

        let instance = manager
            .create(
                &alice,
                NewInstance {
                    name: "Onboarding".to_string(),
                    description: None,
                    template_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(instance.status, Draft);

        let updated = manager
            .update(
                &alice,
                &instance.id,
                InstanceUpdate {
                    name: None,
                    description: Some(Some("Welcome emails".to_string())),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Onboarding");
        assert_eq!(updated.description.as_deref(), Some("Welcome emails"));

        assert_eq!(manager.start(&alice, &instance.id).await.unwrap().status, Active);
        assert_eq!(manager.stop(&alice, &instance.id).await.unwrap().status, Inactive);
        assert!(manager
            .stop(&alice, &instance.id)
            .await
            .unwrap_err()
            .is_validation());
        assert_eq!(manager.suspend(&alice, &instance.id).await.unwrap().status, Suspended);
        assert!(manager
            .start(&alice, &instance.id)
            .await
            .unwrap_err()
            .is_validation());
        let reactivated = manager.reactivate(&alice, &instance.id).await.unwrap();
        assert_eq!(reactivated.status, Active);
        assert_eq!(reactivated.revision, 5);
    }

    #[tokio::test]
    async fn test_duplicate_is_independent() {
        let store = Arc::new(MemoryStore::new());
        let manager = InstanceLifecycleManager::new(store.clone(), EngineSettings::default());
        let alice = UserContext::new("alice");

        let mut source = Instance::new("alice".to_string(), "Source".to_string(), None);
        source.blocks = vec![crate::model::BlockNode {
            id: "a".to_string(),
            definition_id: "trigger".to_string(),
            config: serde_json::Map::new(),
            position: crate::model::Position::new(1.0, 2.0),
            label: None,
        }];
        store
            .apply(WriteBatch::single(WriteOp::PutInstance {
                instance: source.clone(),
                expect: Expect::Absent,
            }))
            .await
            .unwrap();

        let copy = manager.duplicate(&alice, &source.id, None).await.unwrap();
        assert_eq!(copy.name, "Source (copy)");
        assert_ne!(copy.id, source.id);
        assert_ne!(copy.blocks[0].id, "a");
        assert_eq!(copy.blocks[0].position, source.blocks[0].position);
        assert_eq!(copy.status, Draft);

        assert!(manager
            .duplicate(&UserContext::new("bob"), &source.id, None)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
