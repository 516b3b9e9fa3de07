use std::sync::Arc;

use crate::config::EngineSettings;
use crate::logic::canvas::CanvasStateStore;
use crate::logic::graph::InstanceGraph;
use crate::logic::lifecycle::InstanceLifecycleManager;
use crate::logic::marketplace::MarketplaceService;
use crate::logic::registry::BlockRegistry;
use crate::logic::snapshots::SnapshotManager;
use crate::logic::templates::TemplateService;
use crate::store::traits::Store;

/// Every service wired to one shared store
pub struct Engine<S> {
    store: Arc<S>,
    pub registry: BlockRegistry<S>,
    pub lifecycle: InstanceLifecycleManager<S>,
    pub graph: InstanceGraph<S>,
    pub canvas: CanvasStateStore<S>,
    pub snapshots: SnapshotManager<S>,
    pub templates: TemplateService<S>,
    pub marketplace: MarketplaceService<S>,
}

impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        Self {
            registry: BlockRegistry::new(store.clone()),
            lifecycle: InstanceLifecycleManager::new(store.clone(), settings.clone()),
            graph: InstanceGraph::new(store.clone(), settings.clone()),
            canvas: CanvasStateStore::new(store.clone(), settings.clone()),
            snapshots: SnapshotManager::new(store.clone(), settings.clone()),
            templates: TemplateService::new(store.clone(), settings.clone()),
            marketplace: MarketplaceService::new(store.clone(), settings),
            store,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}
