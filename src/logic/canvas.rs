use log::debug;
use serde_json::Value;
use std::sync::Arc;

use crate::config::EngineSettings;
use crate::error::EngineResult;
use crate::logic::commit::{load_owned_instance, mutate_instance};
use crate::model::{CanvasState, Id, UserContext};
use crate::store::traits::Store;

/// Opaque per-instance view state (zoom, viewport, selection). Stored and
/// returned verbatim; concurrent saves resolve last-write-wins.
pub struct CanvasStateStore<S> {
    store: Arc<S>,
    settings: EngineSettings,
}

impl<S: Store> CanvasStateStore<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        Self { store, settings }
    }

    /// Replace the saved state wholesale; returns the new instance revision
    pub async fn save(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        state: Value,
    ) -> EngineResult<u64> {
        let canvas = CanvasState::from(state);
        let (instance, ()) = mutate_instance(
            self.store.as_ref(),
            &self.settings,
            actor,
            instance_id,
            |_| Vec::new(),
            |instance, _, _| {
                instance.canvas = canvas.clone();
                Ok(())
            },
        )
        .await?;

        debug!(
            "Saved canvas for instance {} at revision {}",
            instance_id, instance.revision
        );
        Ok(instance.revision)
    }

    /// The last saved state, or an empty object if none was ever saved
    pub async fn load(&self, actor: &UserContext, instance_id: &Id) -> EngineResult<CanvasState> {
        let instance = load_owned_instance(self.store.as_ref(), actor, instance_id).await?;
        Ok(instance.canvas)
    }
}
