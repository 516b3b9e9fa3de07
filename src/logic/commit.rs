use log::{debug, warn};

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::logic::registry::{visible_definitions, DefinitionSet};
use crate::model::{Id, Instance, UserContext};
use crate::store::traits::{Expect, RevisionConflict, Store, WriteBatch, WriteOp};

/// Load an instance the actor owns; anything else is reported as missing
pub(crate) async fn load_owned_instance<S: Store>(
    store: &S,
    actor: &UserContext,
    instance_id: &Id,
) -> EngineResult<Instance> {
    match store.get_instance(instance_id).await? {
        Some(instance) if actor.owns(&instance.owner_id) => Ok(instance),
        _ => Err(EngineError::not_found("instance", instance_id.clone())),
    }
}

pub(crate) fn is_revision_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RevisionConflict>().is_some()
}

pub(crate) fn retries_exhausted(instance_id: &Id, attempts: u32) -> EngineError {
    warn!(
        "Giving up on instance {} after {} conflicting writes",
        instance_id, attempts
    );
    EngineError::Conflict(format!(
        "instance '{}' kept changing concurrently; gave up after {} attempts",
        instance_id, attempts
    ))
}

/// Read-modify-write of one instance under optimistic concurrency.
///
/// Each attempt loads the current instance, resolves the definitions named by
/// `needs` (only those visible to the actor), and runs `edit` on a copy. The
/// edited copy is written with its revision bumped, guarded on the revision
/// that was read, together with any extra ops `edit` pushed. Losing the race
/// reloads and re-runs `edit`, up to `max_write_retries` times. Errors from
/// `edit` abort immediately and nothing is written.
pub(crate) async fn mutate_instance<S, N, F, T>(
    store: &S,
    settings: &EngineSettings,
    actor: &UserContext,
    instance_id: &Id,
    needs: N,
    mut edit: F,
) -> EngineResult<(Instance, T)>
where
    S: Store,
    N: Fn(&Instance) -> Vec<Id> + Send,
    F: FnMut(&mut Instance, &DefinitionSet, &mut WriteBatch) -> EngineResult<T> + Send,
    T: Send,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let current = load_owned_instance(store, actor, instance_id).await?;
        let definitions = visible_definitions(store, actor, &needs(&current)).await?;

        let mut next = current.clone();
        let mut extra = WriteBatch::new();
        let output = edit(&mut next, &definitions, &mut extra)?;

        next.revision = current.revision + 1;
        next.touch();

        let mut batch = WriteBatch::single(WriteOp::PutInstance {
            instance: next.clone(),
            expect: Expect::Revision(current.revision),
        });
        batch.ops.extend(extra.ops);

        match store.apply(batch).await {
            Ok(()) => return Ok((next, output)),
            Err(err) if is_revision_conflict(&err) => {
                if attempts > settings.max_write_retries {
                    return Err(retries_exhausted(instance_id, attempts));
                }
                debug!(
                    "Revision conflict on instance {} (attempt {}), retrying",
                    instance_id, attempts
                );
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::traits::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn seeded(owner: &str) -> (Arc<MemoryStore>, Instance) {
        let store = Arc::new(MemoryStore::new());
        let instance = Instance::new(owner.to_string(), "Flow".to_string(), None);
        store
            .apply(WriteBatch::single(WriteOp::PutInstance {
                instance: instance.clone(),
                expect: Expect::Absent,
            }))
            .await
            .unwrap();
        (store, instance)
    }

    #[tokio::test]
    async fn test_mutation_bumps_revision() {
        let (store, instance) = seeded("alice").await;
        let actor = UserContext::new("alice");

        let (updated, ()) = mutate_instance(
            store.as_ref(),
            &EngineSettings::default(),
            &actor,
            &instance.id,
            |_| Vec::new(),
            |i, _, _| {
                i.name = "Renamed".to_string();
                Ok(())
            },
        )
        .await
        .unwrap();

        assert_eq!(updated.revision, 1);
        let stored = store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn test_other_owners_see_not_found() {
        let (store, instance) = seeded("alice").await;
        let err = mutate_instance(
            store.as_ref(),
            &EngineSettings::default(),
            &UserContext::new("mallory"),
            &instance.id,
            |_| Vec::new(),
            |_, _, _| Ok(()),
        )
        .await
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_failed_edit_writes_nothing() {
        let (store, instance) = seeded("alice").await;
        let err = mutate_instance(
            store.as_ref(),
            &EngineSettings::default(),
            &UserContext::new("alice"),
            &instance.id,
            |_| Vec::new(),
            |i, _, _| -> EngineResult<()> {
                i.name = "half-done".to_string();
                Err(EngineError::validation("nope"))
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_validation());
        let stored = store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Flow");
        assert_eq!(stored.revision, 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_configured_retries() {
        let (store, instance) = seeded("alice").await;
        let settings = EngineSettings {
            max_write_retries: 2,
            ..EngineSettings::default()
        };
        let calls = AtomicU32::new(0);

        // A competing writer sneaks in between every read and write
        let competitor = store.clone();
        let err = mutate_instance(
            store.as_ref(),
            &settings,
            &UserContext::new("alice"),
            &instance.id,
            |_| Vec::new(),
            |i, _, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut sneaky = i.clone();
                sneaky.revision += 1;
                let racing = WriteBatch::single(WriteOp::PutInstance {
                    instance: sneaky,
                    expect: Expect::Revision(i.revision),
                });
                competitor.apply_now(racing).unwrap();
                Ok(())
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
