//! Dynamic, multi-tenant watches over kinds discovered at runtime.
//!
//! The [`WatchManager`] runs at most one informer per kind and fans
//! its events out to every [`Registrar`] that declared intent for the
//! kind. Late joiners are caught up by replaying the informer cache's
//! contents to them. Event delivery holds no manager lock, so a slow
//! consumer can never block watch mutation; backpressure is the
//! consumer's own sink capacity.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use kube::{api::DynamicObject, core::GroupVersionKind};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cache::{CacheError, EventHandler, RemovableCache},
    gvk_set::GvkSet,
    metrics::WatchMetrics,
    vitals::{VitalsRegistry, WatchVitals},
};

mod registrar;
mod replay;

pub use registrar::Registrar;
pub use replay::ReplayTracker;

use replay::{replay_worker, ReplayRequest};

/// Channel on which a registrar receives watched objects, both live
/// and replayed.
pub type EventSink = mpsc::Sender<Arc<DynamicObject>>;

/// Capacity of the manager's internal event queue. Kept minimal so
/// informer handlers rendezvous with the fan-out loop rather than
/// buffering behind it.
const EVENT_QUEUE_CAPACITY: usize = 1;

/// Failures from the watch manager.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch manager already started")]
    AlreadyStarted,
    #[error("registrar {0} already registered")]
    DuplicateRegistrar(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("watch manager stopped")]
    Stopped,
    /// One or more add/remove operations inside a watch replacement
    /// failed; the rest were still applied.
    #[error("{}", join_failures(.0))]
    Aggregate(Vec<WatchError>),
}

fn join_failures(failures: &[WatchError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// An object queued from an informer, tagged with its kind.
struct ManagerEvent {
    gvk: GroupVersionKind,
    object: Arc<DynamicObject>,
}

/// Owner of all kind-scoped informers and their fan-out.
pub struct WatchManager {
    cache: Arc<dyn RemovableCache>,
    /// Realized watches, distinct from the intent map. Guarded by an
    /// async lock because informer acquisition happens under it.
    watched: tokio::sync::RwLock<AHashMap<GroupVersionKind, WatchVitals>>,
    intents: VitalsRegistry,
    registrar_names: Mutex<AHashSet<String>>,
    events_tx: mpsc::Sender<ManagerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ManagerEvent>>>,
    replay_tx: mpsc::UnboundedSender<ReplayRequest>,
    replay_rx: Mutex<Option<mpsc::UnboundedReceiver<ReplayRequest>>>,
    tracker: Arc<ReplayTracker>,
    next_worker: AtomicU64,
    stopped: CancellationToken,
    started: AtomicBool,
    metrics: Arc<WatchMetrics>,
}

impl WatchManager {
    #[must_use]
    pub fn new(cache: Arc<dyn RemovableCache>, metrics: Arc<WatchMetrics>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (replay_tx, replay_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            cache,
            watched: tokio::sync::RwLock::new(AHashMap::new()),
            intents: VitalsRegistry::new(),
            registrar_names: Mutex::new(AHashSet::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            replay_tx,
            replay_rx: Mutex::new(Some(replay_rx)),
            tracker: Arc::new(ReplayTracker::default()),
            next_worker: AtomicU64::new(0),
            stopped: CancellationToken::new(),
            started: AtomicBool::new(false),
            metrics,
        })
    }

    /// Create a handle for an upstream controller, bound to the sink
    /// its events will be delivered on. Registrar names are unique
    /// per manager.
    pub fn new_registrar(
        self: &Arc<Self>,
        name: &str,
        sink: EventSink,
    ) -> Result<Arc<Registrar>, WatchError> {
        let mut names = self.registrar_names.lock();
        if !names.insert(name.to_string()) {
            return Err(WatchError::DuplicateRegistrar(name.to_string()));
        }
        Ok(Arc::new(Registrar::new(
            name.to_string(),
            sink,
            self.clone(),
        )))
    }

    /// Run the manager until `done` is cancelled.
    ///
    /// Single-shot; a second call fails. Spawns the termination
    /// watcher and drives the event and replay loops, returning once
    /// all three have exited. Cancellation is cooperative: cancelling
    /// `done` unblocks informer handlers and aborts in-flight
    /// replays.
    pub async fn start(self: Arc<Self>, done: CancellationToken) -> Result<(), WatchError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WatchError::AlreadyStarted);
        }
        let events_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or(WatchError::AlreadyStarted)?;
        let replay_rx = self
            .replay_rx
            .lock()
            .take()
            .ok_or(WatchError::AlreadyStarted)?;

        let stopped = self.stopped.clone();
        let termination = tokio::spawn(async move {
            tokio::select! {
                () = done.cancelled() => stopped.cancel(),
                () = stopped.cancelled() => {}
            }
        });

        tokio::join!(self.event_loop(events_rx), self.replay_loop(replay_rx));
        let _ = termination.await;
        debug!("watch manager stopped");
        Ok(())
    }

    /// The kinds currently realized as informers.
    pub async fn watched_kinds(&self) -> GvkSet {
        self.watched.read().await.keys().cloned().collect()
    }

    /// Tracker for waiting on in-flight replays.
    #[must_use]
    pub fn replays(&self) -> Arc<ReplayTracker> {
        self.tracker.clone()
    }

    pub(super) async fn add_watch(
        &self,
        registrar: &Registrar,
        gvk: &GroupVersionKind,
    ) -> Result<(), WatchError> {
        // Intent is recorded first so desired state survives an
        // informer acquisition failure and the caller can retry.
        self.intents.intend(registrar.name(), gvk, registrar.sink());
        self.metrics.set_intended(self.intents.get_gvks().size());

        let mut watched = self.watched.write().await;
        let result = self.add_watch_locked(&mut watched, registrar, gvk).await;
        self.metrics.set_watched(watched.len());
        result
    }

    async fn add_watch_locked(
        &self,
        watched: &mut AHashMap<GroupVersionKind, WatchVitals>,
        registrar: &Registrar,
        gvk: &GroupVersionKind,
    ) -> Result<(), WatchError> {
        if let Some(vitals) = watched.get_mut(gvk) {
            if !vitals.has_registrar(registrar.name()) {
                // Late joiner: the informer's initial events are long
                // gone, so deliver the cache's contents instead.
                self.schedule_replay(registrar.name(), registrar.sink(), gvk);
                vitals.insert(registrar.name(), registrar.sink());
            }
            return Ok(());
        }

        let informer = self.cache.get_informer(gvk).await?;
        informer.set_handler(Arc::new(ManagerSink {
            gvk: gvk.clone(),
            events: self.events_tx.clone(),
            stopped: self.stopped.clone(),
        }))?;
        watched.insert(
            gvk.clone(),
            WatchVitals::with(registrar.name(), registrar.sink()),
        );
        debug!(kind = %gvk.kind, registrar = %registrar.name(), "watch added");
        Ok(())
    }

    pub(super) async fn remove_watch(
        &self,
        registrar: &Registrar,
        gvk: &GroupVersionKind,
    ) -> Result<(), WatchError> {
        self.cancel_replay(registrar.name(), gvk);
        self.intents.remove(registrar.name(), gvk);
        self.metrics.set_intended(self.intents.get_gvks().size());

        let mut watched = self.watched.write().await;
        let result = self.remove_watch_locked(&mut watched, registrar.name(), gvk).await;
        self.metrics.set_watched(watched.len());
        result
    }

    async fn remove_watch_locked(
        &self,
        watched: &mut AHashMap<GroupVersionKind, WatchVitals>,
        registrar: &str,
        gvk: &GroupVersionKind,
    ) -> Result<(), WatchError> {
        let Some(vitals) = watched.get_mut(gvk) else {
            return Ok(());
        };
        vitals.remove(registrar);
        if vitals.registrar_count() > 0 {
            return Ok(());
        }
        // The cache call happens before the map delete so a failure
        // leaves the entry in place and the state consistent.
        self.cache.remove(gvk).await?;
        watched.remove(gvk);
        debug!(kind = %gvk.kind, registrar = %registrar, "watch removed");
        Ok(())
    }

    pub(super) async fn replace_watch(
        &self,
        registrar: &Registrar,
        roster: &[GroupVersionKind],
    ) -> Result<(), WatchError> {
        let desired: GvkSet = roster.iter().cloned().collect();
        let current = self.intents.roster(registrar.name());

        let mut intents = AHashMap::new();
        for gvk in roster {
            intents.insert(
                gvk.clone(),
                WatchVitals::with(registrar.name(), registrar.sink()),
            );
        }
        self.intents.replace_roster(registrar.name(), &intents);
        self.metrics.set_intended(self.intents.get_gvks().size());

        let mut watched = self.watched.write().await;
        let mut failures = Vec::new();
        for gvk in current.difference(&desired).items() {
            self.cancel_replay(registrar.name(), &gvk);
            if let Err(err) = self
                .remove_watch_locked(&mut watched, registrar.name(), &gvk)
                .await
            {
                failures.push(err);
            }
        }
        for gvk in desired.difference(&current).items() {
            if let Err(err) = self.add_watch_locked(&mut watched, registrar, &gvk).await {
                failures.push(err);
            }
        }
        self.metrics.set_watched(watched.len());

        if failures.is_empty() {
            Ok(())
        } else {
            Err(WatchError::Aggregate(failures))
        }
    }

    pub(super) fn request_replay(
        &self,
        registrar: &Registrar,
        gvk: &GroupVersionKind,
    ) -> Result<(), WatchError> {
        if self.stopped.is_cancelled() {
            return Err(WatchError::Stopped);
        }
        self.schedule_replay(registrar.name(), registrar.sink(), gvk);
        Ok(())
    }

    fn schedule_replay(&self, registrar: &str, sink: EventSink, gvk: &GroupVersionKind) {
        self.tracker.set_intent(registrar, gvk, true);
        let _ = self.replay_tx.send(ReplayRequest::Start {
            registrar: registrar.to_string(),
            gvk: gvk.clone(),
            sink,
        });
    }

    fn cancel_replay(&self, registrar: &str, gvk: &GroupVersionKind) {
        self.tracker.set_intent(registrar, gvk, false);
        let _ = self.replay_tx.send(ReplayRequest::Cancel {
            registrar: registrar.to_string(),
            gvk: gvk.clone(),
        });
    }

    async fn event_loop(&self, mut events: mpsc::Receiver<ManagerEvent>) {
        loop {
            let event = tokio::select! {
                () = self.stopped.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.distribute(event).await;
        }
    }

    /// Fan one event out to every registrar of its kind. The sink
    /// snapshot is taken under a read guard which is released before
    /// any send, so a slow consumer cannot block watch mutation.
    async fn distribute(&self, event: ManagerEvent) {
        let sinks = {
            let watched = self.watched.read().await;
            watched
                .get(&event.gvk)
                .map(WatchVitals::sinks)
                .unwrap_or_default()
        };
        for (registrar, sink) in sinks {
            tokio::select! {
                () = self.stopped.cancelled() => return,
                sent = sink.send(event.object.clone()) => {
                    if sent.is_err() {
                        debug!(registrar = %registrar, kind = %event.gvk.kind, "dropping event for closed sink");
                    }
                }
            }
        }
    }

    async fn replay_loop(&self, mut requests: mpsc::UnboundedReceiver<ReplayRequest>) {
        let mut in_flight: AHashMap<GroupVersionKind, AHashMap<String, (u64, CancellationToken)>> =
            AHashMap::new();
        loop {
            let request = tokio::select! {
                () = self.stopped.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            match request {
                ReplayRequest::Start {
                    registrar,
                    gvk,
                    sink,
                } => {
                    // A cancel can overtake its start request; the
                    // intent map is authoritative.
                    if !self.tracker.wants_replay(&registrar, &gvk) {
                        continue;
                    }
                    if in_flight
                        .get(&gvk)
                        .is_some_and(|workers| workers.contains_key(&registrar))
                    {
                        continue;
                    }
                    let cancel = self.stopped.child_token();
                    let worker = self.next_worker.fetch_add(1, Ordering::Relaxed);
                    in_flight
                        .entry(gvk.clone())
                        .or_default()
                        .insert(registrar.clone(), (worker, cancel.clone()));
                    self.tracker.begin(&gvk);
                    tokio::spawn(replay_worker(
                        self.cache.clone(),
                        registrar,
                        gvk,
                        sink,
                        cancel,
                        self.tracker.clone(),
                        self.replay_tx.clone(),
                        worker,
                    ));
                }
                ReplayRequest::Cancel { registrar, gvk } => {
                    if let Some(workers) = in_flight.get_mut(&gvk) {
                        if let Some((_, cancel)) = workers.remove(&registrar) {
                            cancel.cancel();
                        }
                        if workers.is_empty() {
                            in_flight.remove(&gvk);
                        }
                    }
                }
                ReplayRequest::Done {
                    registrar,
                    gvk,
                    worker,
                } => {
                    if let Some(workers) = in_flight.get_mut(&gvk) {
                        // Only clear the entry if it still belongs to
                        // this worker; a cancel-and-rejoin may have
                        // installed a newer one under the same name.
                        if workers.get(&registrar).is_some_and(|(id, _)| *id == worker) {
                            workers.remove(&registrar);
                        }
                        if workers.is_empty() {
                            in_flight.remove(&gvk);
                        }
                    }
                }
            }
        }
        for workers in in_flight.values() {
            for (_, cancel) in workers.values() {
                cancel.cancel();
            }
        }
    }
}

/// The single event handler attached to each informer. Funnels every
/// event into the manager's queue, or drops it once the manager is
/// stopped.
struct ManagerSink {
    gvk: GroupVersionKind,
    events: mpsc::Sender<ManagerEvent>,
    stopped: CancellationToken,
}

impl ManagerSink {
    async fn forward(&self, object: Arc<DynamicObject>) {
        let event = ManagerEvent {
            gvk: self.gvk.clone(),
            object,
        };
        tokio::select! {
            () = self.stopped.cancelled() => {
                warn!(kind = %self.gvk.kind, "manager stopped, dropping informer event");
            }
            sent = self.events.send(event) => {
                if sent.is_err() {
                    warn!(kind = %self.gvk.kind, "event queue closed, dropping informer event");
                }
            }
        }
    }
}

#[async_trait]
impl EventHandler for ManagerSink {
    async fn on_add(&self, obj: Arc<DynamicObject>) {
        self.forward(obj).await;
    }

    async fn on_update(&self, old: Arc<DynamicObject>, new: Arc<DynamicObject>) {
        self.forward(old).await;
        self.forward(new).await;
    }

    async fn on_delete(&self, obj: Arc<DynamicObject>) {
        self.forward(obj).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{dynamic_object, FakeCache};
    use std::time::Duration;
    use tokio::time::timeout;

    fn gvk(kind: &str) -> GroupVersionKind {
        GroupVersionKind::gvk("constraints.warden.dev", "v1beta1", kind)
    }

    fn manager_with(cache: Arc<FakeCache>) -> Arc<WatchManager> {
        WatchManager::new(cache, Arc::new(WatchMetrics::default()))
    }

    async fn started(
        cache: Arc<FakeCache>,
    ) -> (Arc<WatchManager>, CancellationToken, tokio::task::JoinHandle<Result<(), WatchError>>) {
        let manager = manager_with(cache);
        let done = CancellationToken::new();
        let handle = tokio::spawn(manager.clone().start(done.clone()));
        tokio::task::yield_now().await;
        (manager, done, handle)
    }

    async fn recv_n(
        rx: &mut mpsc::Receiver<Arc<DynamicObject>>,
        n: usize,
    ) -> Vec<Arc<DynamicObject>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let obj = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("sink closed");
            out.push(obj);
        }
        out
    }

    #[tokio::test]
    async fn one_informer_per_kind_regardless_of_registrars() {
        let cache = FakeCache::with_kinds([gvk("K")]);
        let (manager, done, handle) = started(cache.clone()).await;

        let a = manager.new_registrar("a", mpsc::channel(16).0).unwrap();
        let b = manager.new_registrar("b", mpsc::channel(16).0).unwrap();
        a.add_watch(&gvk("K")).await.unwrap();
        b.add_watch(&gvk("K")).await.unwrap();

        assert_eq!(cache.acquisitions(&gvk("K")), 1);
        assert!(manager.watched_kinds().await.contains(&gvk("K")));

        done.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn add_watch_is_idempotent_within_a_registrar() {
        let cache = FakeCache::with_kinds([gvk("K")]);
        cache.seed(&gvk("K"), vec![dynamic_object("c1", &gvk("K"))]);
        let (manager, done, handle) = started(cache.clone()).await;

        let (tx, mut rx) = mpsc::channel(16);
        let a = manager.new_registrar("a", tx).unwrap();
        a.add_watch(&gvk("K")).await.unwrap();
        a.add_watch(&gvk("K")).await.unwrap();

        assert_eq!(cache.acquisitions(&gvk("K")), 1);
        // no replay was scheduled for the original registrar
        manager.replays().wait(&gvk("K")).await;
        assert!(rx.try_recv().is_err());

        done.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_kind_fails_without_mutating_watched() {
        let cache = FakeCache::with_kinds([]);
        let manager = manager_with(cache.clone());
        let a = manager.new_registrar("a", mpsc::channel(1).0).unwrap();

        let err = a.add_watch(&gvk("K")).await.unwrap_err();
        assert!(matches!(
            err,
            WatchError::Cache(CacheError::KindNotInstalled { .. })
        ));
        assert!(manager.watched_kinds().await.is_empty());

        // once the kind is installed the same call succeeds
        cache.install(&gvk("K"));
        a.add_watch(&gvk("K")).await.unwrap();
        assert!(manager.watched_kinds().await.contains(&gvk("K")));
    }

    #[tokio::test]
    async fn remove_watch_reference_counts_registrars() {
        let cache = FakeCache::with_kinds([gvk("K")]);
        let metrics = Arc::new(WatchMetrics::default());
        let manager = WatchManager::new(cache.clone(), metrics.clone());
        let a = manager.new_registrar("a", mpsc::channel(1).0).unwrap();
        let b = manager.new_registrar("b", mpsc::channel(1).0).unwrap();

        a.add_watch(&gvk("K")).await.unwrap();
        b.add_watch(&gvk("K")).await.unwrap();
        assert_eq!(metrics.watched_value(), 1);

        a.remove_watch(&gvk("K")).await.unwrap();
        assert_eq!(cache.removals(&gvk("K")), 0);
        assert!(manager.watched_kinds().await.contains(&gvk("K")));

        b.remove_watch(&gvk("K")).await.unwrap();
        assert_eq!(cache.removals(&gvk("K")), 1);
        assert!(manager.watched_kinds().await.is_empty());
        assert_eq!(metrics.watched_value(), 0);

        // removing a kind we do not watch is a no-op
        b.remove_watch(&gvk("K")).await.unwrap();
        assert_eq!(cache.removals(&gvk("K")), 1);
    }

    #[tokio::test]
    async fn replace_watch_applies_the_set_difference() {
        let cache = FakeCache::with_kinds([gvk("K"), gvk("L"), gvk("M")]);
        let manager = manager_with(cache.clone());
        let a = manager.new_registrar("a", mpsc::channel(1).0).unwrap();

        a.add_watch(&gvk("K")).await.unwrap();
        a.add_watch(&gvk("L")).await.unwrap();

        a.replace_watch(&[gvk("L"), gvk("M")]).await.unwrap();

        let watched = manager.watched_kinds().await;
        assert!(!watched.contains(&gvk("K")));
        assert!(watched.contains(&gvk("L")));
        assert!(watched.contains(&gvk("M")));
        assert_eq!(cache.removals(&gvk("K")), 1);
        // L was kept, not re-acquired
        assert_eq!(cache.acquisitions(&gvk("L")), 1);
    }

    #[tokio::test]
    async fn replace_watch_does_not_disturb_other_registrars() {
        let cache = FakeCache::with_kinds([gvk("K"), gvk("L")]);
        let manager = manager_with(cache.clone());
        let a = manager.new_registrar("a", mpsc::channel(1).0).unwrap();
        let b = manager.new_registrar("b", mpsc::channel(1).0).unwrap();

        a.add_watch(&gvk("K")).await.unwrap();
        b.add_watch(&gvk("K")).await.unwrap();

        a.replace_watch(&[gvk("L")]).await.unwrap();

        // K is still watched on behalf of b
        assert!(manager.watched_kinds().await.contains(&gvk("K")));
        assert_eq!(cache.removals(&gvk("K")), 0);
    }

    #[tokio::test]
    async fn replace_watch_aggregates_failures_but_applies_the_rest() {
        let cache = FakeCache::with_kinds([gvk("K"), gvk("L")]);
        let manager = manager_with(cache.clone());
        let a = manager.new_registrar("a", mpsc::channel(1).0).unwrap();
        a.add_watch(&gvk("K")).await.unwrap();

        // M is not installed, so its add fails; L still goes through
        let err = a
            .replace_watch(&[gvk("L"), gvk("M")])
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Aggregate(ref errs) if errs.len() == 1));

        let watched = manager.watched_kinds().await;
        assert!(watched.contains(&gvk("L")));
        assert!(!watched.contains(&gvk("K")));
        assert!(!watched.contains(&gvk("M")));
    }

    #[tokio::test]
    async fn events_fan_out_to_every_registrar_in_order() {
        let cache = FakeCache::with_kinds([gvk("K")]);
        let (manager, done, handle) = started(cache.clone()).await;

        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let a = manager.new_registrar("a", tx_a).unwrap();
        let b = manager.new_registrar("b", tx_b).unwrap();
        a.add_watch(&gvk("K")).await.unwrap();
        b.add_watch(&gvk("K")).await.unwrap();

        let informer = cache.informer(&gvk("K"));
        let c1 = Arc::new(dynamic_object("c1", &gvk("K")));
        let c2 = Arc::new(dynamic_object("c2", &gvk("K")));
        informer.fire_add(c1.clone()).await;
        informer.fire_update(c1.clone(), c2.clone()).await;

        // on_update enqueues both old and new
        for rx in [&mut rx_a, &mut rx_b] {
            let events = recv_n(rx, 3).await;
            let names: Vec<_> = events.iter().map(|o| o.metadata.name.clone().unwrap()).collect();
            assert_eq!(names, ["c1", "c1", "c2"]);
        }

        done.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn late_joiner_receives_replay_without_duplicating_to_others() {
        let k = gvk("K");
        let cache = FakeCache::with_kinds([k.clone()]);
        let objects: Vec<_> = (0..10).map(|i| dynamic_object(&format!("c{i}"), &k)).collect();
        cache.seed(&k, objects.clone());
        let (manager, done, handle) = started(cache.clone()).await;

        let (tx_a, mut rx_a) = mpsc::channel(32);
        let a = manager.new_registrar("a", tx_a).unwrap();
        a.add_watch(&k).await.unwrap();
        // the informer delivers its initial contents to the manager
        let informer = cache.informer(&k);
        for obj in &objects {
            informer.fire_add(Arc::new(obj.clone())).await;
        }
        assert_eq!(recv_n(&mut rx_a, 10).await.len(), 10);

        let (tx_b, mut rx_b) = mpsc::channel(32);
        let b = manager.new_registrar("b", tx_b).unwrap();
        b.add_watch(&k).await.unwrap();

        let replayed = recv_n(&mut rx_b, 10).await;
        assert_eq!(replayed.len(), 10);
        manager.replays().wait(&k).await;

        // neither side saw duplicates
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        done.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn removing_a_watch_cancels_its_replay() {
        let k = gvk("K");
        let cache = FakeCache::with_kinds([k.clone()]);
        cache.seed(
            &k,
            (0..10).map(|i| dynamic_object(&format!("c{i}"), &k)).collect(),
        );
        let (manager, done, handle) = started(cache.clone()).await;

        let a = manager.new_registrar("a", mpsc::channel(32).0).unwrap();
        a.add_watch(&k).await.unwrap();

        // b's sink only has room for two events, so the replay worker
        // blocks on the third send until cancelled
        let (tx_b, mut rx_b) = mpsc::channel(2);
        let b = manager.new_registrar("b", tx_b).unwrap();
        b.add_watch(&k).await.unwrap();

        let first = timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .expect("replay never started");
        assert!(first.is_some());

        b.remove_watch(&k).await.unwrap();
        manager.replays().wait(&k).await;

        // at most the buffered prefix is left; nothing arrives after
        let mut leftovers = 0;
        while rx_b.try_recv().is_ok() {
            leftovers += 1;
        }
        assert!(leftovers <= 2);
        assert!(rx_b.try_recv().is_err());

        done.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn replace_watch_cancels_replays_of_dropped_kinds() {
        let k = gvk("K");
        let l = gvk("L");
        let cache = FakeCache::with_kinds([k.clone(), l.clone()]);
        cache.seed(
            &k,
            (0..10).map(|i| dynamic_object(&format!("c{i}"), &k)).collect(),
        );
        let (manager, done, handle) = started(cache.clone()).await;

        let a = manager.new_registrar("a", mpsc::channel(32).0).unwrap();
        a.add_watch(&k).await.unwrap();

        // b's replay of K wedges on a tiny sink, then b swaps its
        // roster to L; the worker must observe the cancel and exit
        let (tx_b, mut rx_b) = mpsc::channel(1);
        let b = manager.new_registrar("b", tx_b).unwrap();
        b.add_watch(&k).await.unwrap();
        assert!(timeout(Duration::from_secs(5), rx_b.recv()).await.unwrap().is_some());

        b.replace_watch(&[l.clone()]).await.unwrap();
        manager.replays().wait(&k).await;

        let watched = manager.watched_kinds().await;
        assert!(watched.contains(&k), "a still watches K");
        assert!(watched.contains(&l));

        done.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_that_overtakes_its_start_request_wins() {
        let k = gvk("K");
        let cache = FakeCache::with_kinds([k.clone()]);
        cache.seed(&k, vec![dynamic_object("c1", &k)]);

        // join and leave again before the replay loop ever runs; the
        // queued start request must find its intent withdrawn
        let manager = manager_with(cache.clone());
        let a = manager.new_registrar("a", mpsc::channel(8).0).unwrap();
        a.add_watch(&k).await.unwrap();
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let b = manager.new_registrar("b", tx_b).unwrap();
        b.add_watch(&k).await.unwrap();
        b.remove_watch(&k).await.unwrap();

        let done = CancellationToken::new();
        let handle = tokio::spawn(manager.clone().start(done.clone()));
        tokio::task::yield_now().await;

        manager.replays().wait(&k).await;
        assert!(rx_b.try_recv().is_err());

        done.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn replay_retries_transient_list_failures() {
        let k = gvk("K");
        let cache = FakeCache::with_kinds([k.clone()]);
        cache.seed(&k, vec![dynamic_object("c1", &k)]);
        cache.fail_lists(&k, 2);
        let (manager, done, handle) = started(cache.clone()).await;

        let a = manager.new_registrar("a", mpsc::channel(4).0).unwrap();
        a.add_watch(&k).await.unwrap();
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let b = manager.new_registrar("b", tx_b).unwrap();
        b.add_watch(&k).await.unwrap();

        let replayed = recv_n(&mut rx_b, 1).await;
        assert_eq!(replayed[0].metadata.name.as_deref(), Some("c1"));

        done.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stopping_the_manager_terminates_replays_and_start_returns() {
        let k = gvk("K");
        let cache = FakeCache::with_kinds([k.clone()]);
        cache.seed(
            &k,
            (0..10).map(|i| dynamic_object(&format!("c{i}"), &k)).collect(),
        );
        let (manager, done, handle) = started(cache.clone()).await;

        let a = manager.new_registrar("a", mpsc::channel(32).0).unwrap();
        a.add_watch(&k).await.unwrap();
        // blocked replay for a late joiner
        let (tx_b, mut rx_b) = mpsc::channel(1);
        let b = manager.new_registrar("b", tx_b).unwrap();
        b.add_watch(&k).await.unwrap();
        assert!(timeout(Duration::from_secs(5), rx_b.recv()).await.unwrap().is_some());

        done.cancel();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("start did not return after stop")
            .unwrap()
            .unwrap();
        manager.replays().wait(&k).await;
    }

    #[tokio::test]
    async fn start_is_single_shot() {
        let cache = FakeCache::with_kinds([]);
        let manager = manager_with(cache);
        let done = CancellationToken::new();
        let first = tokio::spawn(manager.clone().start(done.clone()));
        tokio::task::yield_now().await;

        let second = manager.clone().start(CancellationToken::new()).await;
        assert!(matches!(second, Err(WatchError::AlreadyStarted)));

        done.cancel();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn registrar_names_are_unique() {
        let cache = FakeCache::with_kinds([]);
        let manager = manager_with(cache);
        manager.new_registrar("a", mpsc::channel(1).0).unwrap();
        let err = manager.new_registrar("a", mpsc::channel(1).0).unwrap_err();
        assert!(matches!(err, WatchError::DuplicateRegistrar(name) if name == "a"));
    }
}
