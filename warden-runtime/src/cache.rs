use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use futures::{pin_mut, TryStreamExt};
use kube::{
    api::{Api, DynamicObject},
    core::GroupVersionKind,
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Failures from the informer cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The requested kind is not served by the cluster yet. Expected
    /// while a generated CRD is still being installed; callers retry.
    #[error("kind {kind} is not installed (group {group}, version {version})")]
    KindNotInstalled {
        group: String,
        version: String,
        kind: String,
    },
    /// Discovery failed for a reason other than the kind being
    /// unknown.
    #[error("discovery failed")]
    Discovery(#[source] kube::Error),
    /// A list was requested for a kind with no informer.
    #[error("kind {kind} is not watched")]
    NotWatched { kind: String },
    /// An informer accepts exactly one event handler.
    #[error("informer already has an event handler attached")]
    HandlerAlreadySet,
    /// The cache is shutting down; not worth retrying.
    #[error("cache stopped")]
    Stopped,
    /// Implementation-specific failure.
    #[error("cache failure: {0}")]
    Internal(String),
}

impl CacheError {
    pub(crate) fn kind_not_installed(gvk: &GroupVersionKind) -> Self {
        CacheError::KindNotInstalled {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
        }
    }
}

/// The polymorphic contract an informer delivers events through.
///
/// Registered exactly once per informer; fan-out to multiple
/// consumers happens behind the handler, not in the informer.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_add(&self, obj: Arc<DynamicObject>);
    async fn on_update(&self, old: Arc<DynamicObject>, new: Arc<DynamicObject>);
    async fn on_delete(&self, obj: Arc<DynamicObject>);
}

/// A long-lived cache+watch of a single kind.
pub trait Informer: Send + Sync {
    /// Attach the sole event handler. A second call fails with
    /// [`CacheError::HandlerAlreadySet`].
    fn set_handler(&self, handler: Arc<dyn EventHandler>) -> Result<(), CacheError>;
}

/// An informer cache supporting non-blocking informer acquisition,
/// listing, and removal.
#[async_trait]
pub trait RemovableCache: Send + Sync {
    /// Get or start the informer for a kind without waiting for its
    /// initial sync. Fails with [`CacheError::KindNotInstalled`] when
    /// the cluster does not serve the kind yet.
    async fn get_informer(&self, gvk: &GroupVersionKind) -> Result<Arc<dyn Informer>, CacheError>;

    /// Snapshot the cached objects of a kind.
    async fn list(&self, gvk: &GroupVersionKind) -> Result<Vec<Arc<DynamicObject>>, CacheError>;

    /// Stop and drop the informer for a kind. Removing an unknown
    /// kind is a no-op.
    async fn remove(&self, gvk: &GroupVersionKind) -> Result<(), CacheError>;
}

/// Production cache: one watch task per kind over the dynamic API.
pub struct KubeCache {
    client: Client,
    informers: tokio::sync::Mutex<AHashMap<GroupVersionKind, InformerEntry>>,
}

struct InformerEntry {
    informer: Arc<KubeInformer>,
    cancel: CancellationToken,
    // Held so the watch task is tied to the entry's lifetime; the
    // task itself exits through `cancel`.
    _task: JoinHandle<()>,
}

impl KubeCache {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            informers: tokio::sync::Mutex::new(AHashMap::new()),
        }
    }
}

#[async_trait]
impl RemovableCache for KubeCache {
    async fn get_informer(&self, gvk: &GroupVersionKind) -> Result<Arc<dyn Informer>, CacheError> {
        let mut informers = self.informers.lock().await;
        if let Some(entry) = informers.get(gvk) {
            return Ok(entry.informer.clone());
        }

        let (resource, _caps) = kube::discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|err| match err {
                kube::Error::Api(ref response) if response.code == 404 => {
                    CacheError::kind_not_installed(gvk)
                }
                other => CacheError::Discovery(other),
            })?;

        let informer = Arc::new(KubeInformer::new(gvk.clone()));
        let cancel = CancellationToken::new();
        let api = Api::<DynamicObject>::all_with(self.client.clone(), &resource);
        let task = tokio::spawn(run_informer(api, informer.clone(), cancel.clone()));
        debug!(kind = %gvk.kind, group = %gvk.group, "started informer");

        informers.insert(gvk.clone(), InformerEntry {
            informer: informer.clone(),
            cancel,
            _task: task,
        });
        Ok(informer)
    }

    async fn list(&self, gvk: &GroupVersionKind) -> Result<Vec<Arc<DynamicObject>>, CacheError> {
        let informers = self.informers.lock().await;
        informers
            .get(gvk)
            .map(|entry| entry.informer.snapshot())
            .ok_or_else(|| CacheError::NotWatched {
                kind: gvk.kind.clone(),
            })
    }

    async fn remove(&self, gvk: &GroupVersionKind) -> Result<(), CacheError> {
        let mut informers = self.informers.lock().await;
        if let Some(entry) = informers.remove(gvk) {
            entry.cancel.cancel();
            debug!(kind = %gvk.kind, group = %gvk.group, "removed informer");
        }
        Ok(())
    }
}

/// One kind's cache and handler slot.
pub struct KubeInformer {
    gvk: GroupVersionKind,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
    store: RwLock<AHashMap<String, Arc<DynamicObject>>>,
}

impl KubeInformer {
    fn new(gvk: GroupVersionKind) -> Self {
        Self {
            gvk,
            handler: RwLock::new(None),
            store: RwLock::new(AHashMap::new()),
        }
    }

    fn snapshot(&self) -> Vec<Arc<DynamicObject>> {
        self.store.read().values().cloned().collect()
    }

    fn handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.handler.read().clone()
    }

    async fn apply(&self, obj: Arc<DynamicObject>) {
        let old = self.store.write().insert(object_key(&obj), obj.clone());
        if let Some(handler) = self.handler() {
            match old {
                Some(old) => handler.on_update(old, obj).await,
                None => handler.on_add(obj).await,
            }
        }
    }

    async fn delete(&self, obj: Arc<DynamicObject>) {
        self.store.write().remove(&object_key(&obj));
        if let Some(handler) = self.handler() {
            handler.on_delete(obj).await;
        }
    }

    /// After a relist, drop objects that disappeared while the watch
    /// was down and deliver their deletions.
    async fn sweep(&self, seen: AHashMap<String, Arc<DynamicObject>>) {
        let stale: Vec<Arc<DynamicObject>> = {
            let mut store = self.store.write();
            let stale = store
                .iter()
                .filter(|(key, _)| !seen.contains_key(*key))
                .map(|(_, obj)| obj.clone())
                .collect::<Vec<_>>();
            store.retain(|key, _| seen.contains_key(key));
            stale
        };
        if let Some(handler) = self.handler() {
            for obj in stale {
                handler.on_delete(obj).await;
            }
        }
    }
}

impl Informer for KubeInformer {
    fn set_handler(&self, handler: Arc<dyn EventHandler>) -> Result<(), CacheError> {
        let mut slot = self.handler.write();
        if slot.is_some() {
            return Err(CacheError::HandlerAlreadySet);
        }
        *slot = Some(handler);
        Ok(())
    }
}

fn object_key(obj: &DynamicObject) -> String {
    match obj.namespace() {
        Some(namespace) => format!("{namespace}/{}", obj.name_any()),
        None => obj.name_any(),
    }
}

async fn run_informer(
    api: Api<DynamicObject>,
    informer: Arc<KubeInformer>,
    cancel: CancellationToken,
) {
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    pin_mut!(stream);
    // Buffer of objects seen during a relist, compared against the
    // store when the relist completes.
    let mut relist: Option<AHashMap<String, Arc<DynamicObject>>> = None;
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = stream.try_next() => match event {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    warn!(kind = %informer.gvk.kind, error = %err, "watch stream error");
                    continue;
                }
            },
        };
        match event {
            watcher::Event::Init => relist = Some(AHashMap::new()),
            watcher::Event::InitApply(obj) => {
                let obj = Arc::new(obj);
                if let Some(seen) = &mut relist {
                    seen.insert(object_key(&obj), obj.clone());
                }
                informer.apply(obj).await;
            }
            watcher::Event::InitDone => {
                if let Some(seen) = relist.take() {
                    informer.sweep(seen).await;
                }
            }
            watcher::Event::Apply(obj) => informer.apply(Arc::new(obj)).await,
            watcher::Event::Delete(obj) => informer.delete(Arc::new(obj)).await,
        }
    }
    debug!(kind = %informer.gvk.kind, "informer stopped");
}
