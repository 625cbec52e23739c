use std::{sync::Arc, time::Duration};

use ahash::{AHashMap, AHashSet};
use backoff::backoff::Backoff;
use kube::core::GroupVersionKind;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheError, RemovableCache};

use super::EventSink;

/// Requests handled by the watch manager's replay loop.
#[derive(Debug)]
pub(crate) enum ReplayRequest {
    /// Begin streaming the cache's contents for `gvk` to `sink`.
    Start {
        registrar: String,
        gvk: GroupVersionKind,
        sink: EventSink,
    },
    /// Abort the in-flight replay for `(registrar, gvk)`.
    Cancel {
        registrar: String,
        gvk: GroupVersionKind,
    },
    /// A worker exited; clear its bookkeeping if it is still current.
    Done {
        registrar: String,
        gvk: GroupVersionKind,
        worker: u64,
    },
}

/// Bookkeeping shared between the replay loop and its workers.
///
/// Tracks (i) how many replays are in flight per kind, with a
/// waitable zero signal, and (ii) whether a `(registrar, kind)` pair
/// still *wants* a replay. Intent is flipped before the corresponding
/// request is queued, so a cancel that overtakes its start request is
/// honored: the loop consults intent before spawning work.
#[derive(Debug, Default)]
pub struct ReplayTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    intents: AHashSet<(String, GroupVersionKind)>,
    counts: AHashMap<GroupVersionKind, watch::Sender<usize>>,
}

impl ReplayTracker {
    pub(crate) fn set_intent(&self, registrar: &str, gvk: &GroupVersionKind, want: bool) {
        let mut inner = self.inner.lock();
        let key = (registrar.to_string(), gvk.clone());
        if want {
            inner.intents.insert(key);
        } else {
            inner.intents.remove(&key);
        }
    }

    pub(crate) fn wants_replay(&self, registrar: &str, gvk: &GroupVersionKind) -> bool {
        self.inner
            .lock()
            .intents
            .contains(&(registrar.to_string(), gvk.clone()))
    }

    pub(crate) fn begin(&self, gvk: &GroupVersionKind) {
        let mut inner = self.inner.lock();
        inner
            .counts
            .entry(gvk.clone())
            .or_insert_with(|| watch::channel(0).0)
            .send_modify(|count| *count += 1);
    }

    pub(crate) fn finish(&self, gvk: &GroupVersionKind) {
        let mut inner = self.inner.lock();
        if let Some(counter) = inner.counts.get_mut(gvk) {
            counter.send_modify(|count| *count = count.saturating_sub(1));
        }
    }

    /// Number of replays currently in flight for a kind.
    #[must_use]
    pub fn in_flight(&self, gvk: &GroupVersionKind) -> usize {
        self.inner
            .lock()
            .counts
            .get(gvk)
            .map(|counter| *counter.borrow())
            .unwrap_or(0)
    }

    /// Wait until no replay is in flight for a kind.
    pub async fn wait(&self, gvk: &GroupVersionKind) {
        let mut receiver = {
            let inner = self.inner.lock();
            match inner.counts.get(gvk) {
                Some(counter) => counter.subscribe(),
                None => return,
            }
        };
        while *receiver.borrow_and_update() > 0 {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Backoff policy for transient list failures: capped exponential,
/// retried until cancelled.
fn replay_backoff() -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoff {
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_secs(10),
        max_elapsed_time: None,
        ..backoff::ExponentialBackoff::default()
    }
}

/// Stream the cache's current objects of `gvk` to `sink`, one by one.
///
/// Retries listing on transient errors; exits without retry on
/// cancellation, manager stop, or a closed sink. Always reports
/// completion through `done` and the tracker.
pub(crate) async fn replay_worker(
    cache: Arc<dyn RemovableCache>,
    registrar: String,
    gvk: GroupVersionKind,
    sink: EventSink,
    cancel: CancellationToken,
    tracker: Arc<ReplayTracker>,
    done: mpsc::UnboundedSender<ReplayRequest>,
    worker: u64,
) {
    let mut backoff = replay_backoff();
    'outer: while !cancel.is_cancelled() {
        match cache.list(&gvk).await {
            Ok(objects) => {
                debug!(registrar = %registrar, kind = %gvk.kind, count = objects.len(), "replaying cached objects");
                for object in objects {
                    tokio::select! {
                        () = cancel.cancelled() => break 'outer,
                        sent = sink.send(object) => {
                            if sent.is_err() {
                                debug!(registrar = %registrar, kind = %gvk.kind, "replay sink closed");
                                break 'outer;
                            }
                        }
                    }
                }
                break;
            }
            Err(CacheError::Stopped) => break,
            Err(err) => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(10));
                warn!(
                    registrar = %registrar,
                    kind = %gvk.kind,
                    error = %err,
                    "replay list failed, retrying in {delay:?}"
                );
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    tracker.finish(&gvk);
    let _ = done.send(ReplayRequest::Done {
        registrar,
        gvk,
        worker,
    });
}
