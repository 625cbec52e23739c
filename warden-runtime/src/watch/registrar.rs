use std::sync::Arc;

use kube::core::GroupVersionKind;

use super::{EventSink, WatchError, WatchManager};

/// Handle through which one upstream controller declares which kinds
/// it wants watched.
///
/// Created by [`WatchManager::new_registrar`]; names are unique per
/// manager. Events for every watched kind are delivered to the sink
/// bound at creation, in informer order per kind. A late-joining
/// registrar receives the cache's current contents as synthetic
/// events; because replay and live fan-out share the sink, the two
/// streams may interleave and an object may be seen twice — consumers
/// must be duplicate-tolerant.
pub struct Registrar {
    name: String,
    sink: EventSink,
    manager: Arc<WatchManager>,
}

impl Registrar {
    pub(super) fn new(name: String, sink: EventSink, manager: Arc<WatchManager>) -> Self {
        Self {
            name,
            sink,
            manager,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Declare intent to watch `gvk` and realize the watch.
    ///
    /// Idempotent within and across registrars: the kind's informer
    /// is started at most once, and a repeated call by the same
    /// registrar is a no-op. Joining a kind that is already watched
    /// schedules a replay of its cached objects to this registrar.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::KindNotInstalled`] while the kind is
    /// not served by the cluster; callers are expected to retry after
    /// installing it.
    ///
    /// [`CacheError::KindNotInstalled`]: crate::cache::CacheError
    pub async fn add_watch(&self, gvk: &GroupVersionKind) -> Result<(), WatchError> {
        self.manager.add_watch(self, gvk).await
    }

    /// Withdraw this registrar's intent for `gvk`, stopping the
    /// informer if no other registrar still wants it. Removing a kind
    /// this registrar does not watch is a no-op. Any replay in flight
    /// for this registrar is cancelled.
    pub async fn remove_watch(&self, gvk: &GroupVersionKind) -> Result<(), WatchError> {
        self.manager.remove_watch(self, gvk).await
    }

    /// Atomically replace this registrar's watch set with `roster`,
    /// removing dropped kinds first and then adding new ones. Other
    /// registrars' watches are unaffected.
    pub async fn replace_watch(&self, roster: &[GroupVersionKind]) -> Result<(), WatchError> {
        self.manager.replace_watch(self, roster).await
    }

    /// Request a fresh replay of the cached objects of `gvk` to this
    /// registrar, as if it had just joined the watch.
    pub fn replay(&self, gvk: &GroupVersionKind) -> Result<(), WatchError> {
        self.manager.request_replay(self, gvk)
    }
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar").field("name", &self.name).finish()
    }
}
