use super::Watcher;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Live idle watchers keyed by container id.
///
/// Handed to route providers and watchers explicitly; there is one per
/// process, created next to the root task.
#[derive(Default)]
pub struct WatcherRegistry {
    watchers: RwLock<HashMap<String, Arc<Watcher>>>,
    registering: Mutex<()>,
}

impl WatcherRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serialises registrations so two routes for the same container end up
    /// sharing one watcher.
    pub(crate) async fn lock_registration(&self) -> MutexGuard<'_, ()> {
        self.registering.lock().await
    }

    pub fn get(&self, container_id: &str) -> Option<Arc<Watcher>> {
        self.watchers.read().get(container_id).cloned()
    }

    pub(crate) fn insert(&self, container_id: String, watcher: Arc<Watcher>) {
        self.watchers.write().insert(container_id, watcher);
    }

    /// Remove `container_id` only while it still maps to `watcher`
    pub(crate) fn remove_if_same(&self, container_id: &str, watcher: &Arc<Watcher>) -> bool {
        let mut watchers = self.watchers.write();
        match watchers.get(container_id) {
            Some(current) if Arc::ptr_eq(current, watcher) => {
                watchers.remove(container_id);
                true
            }
            _ => false,
        }
    }

    /// Move `watcher` from `old` to `new` after the container's id changed
    pub(crate) fn rekey(&self, old: &str, new: &str, watcher: &Arc<Watcher>) {
        let mut watchers = self.watchers.write();
        if watchers
            .get(old)
            .is_some_and(|current| Arc::ptr_eq(current, watcher))
        {
            watchers.remove(old);
        }
        watchers.insert(new.to_string(), Arc::clone(watcher));
    }

    pub fn list(&self) -> Vec<Arc<Watcher>> {
        let mut list: Vec<_> = self.watchers.read().values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(&b.name()));
        list
    }

    pub fn len(&self) -> usize {
        self.watchers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.read().is_empty()
    }
}
