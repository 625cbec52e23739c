//! Per-key serialized dispatch for reconcilers.
//!
//! Keys arrive on an unbounded request channel, are deduplicated and
//! (optionally) delayed in a [`DelayQueue`], and are then run through
//! the reconciler with the guarantee that two reconciliations of the
//! same key never execute concurrently. A key that becomes due while
//! it is already running is held pending and re-dispatched as soon as
//! the running attempt finishes.

use std::{collections::HashSet, sync::Arc, time::Duration};

use ahash::AHashMap;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use futures::{
    future::{poll_fn, BoxFuture},
    stream::FuturesUnordered,
    FutureExt, StreamExt,
};
use hashbrown::HashMap;
use tokio::{
    sync::mpsc,
    time::Instant,
};
use tokio_util::{sync::CancellationToken, time::delay_queue, time::DelayQueue};
use tracing::{debug, warn};

/// What to do after a reconciliation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Run the key again after `duration` even if nothing changes.
    #[must_use]
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Do nothing until a change re-enqueues the key.
    #[must_use]
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    #[must_use]
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// A keyed reconciler driven by [`run`].
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Error: std::error::Error + Send + 'static;

    async fn reconcile(&self, key: &str) -> Result<Action, Self::Error>;
}

/// Enqueue side of a runner's request channel.
#[derive(Clone, Debug)]
pub struct RunnerHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl RunnerHandle {
    /// Request reconciliation of `key`. Requests for a key that is
    /// already queued or running coalesce.
    pub fn enqueue(&self, key: impl Into<String>) {
        let _ = self.tx.send(key.into());
    }
}

/// Create the request channel for a runner.
#[must_use]
pub fn channel() -> (RunnerHandle, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RunnerHandle { tx }, rx)
}

/// Retry policy for failed reconciliations, reset on success.
fn error_backoff() -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None,
        ..backoff::ExponentialBackoff::default()
    }
}

/// Drive `reconciler` from `requests` until `stop` is cancelled or
/// the request channel closes. In-flight reconciliations are awaited
/// before returning; they are never aborted mid-step.
pub async fn run<R: Reconciler>(
    name: &'static str,
    reconciler: Arc<R>,
    requests: mpsc::UnboundedReceiver<String>,
    stop: CancellationToken,
) {
    Runner {
        name,
        reconciler,
        requests,
        stop,
        delay: DelayQueue::new(),
        scheduled: HashMap::new(),
        running: HashSet::new(),
        pending: HashSet::new(),
        in_flight: FuturesUnordered::new(),
        backoffs: AHashMap::new(),
    }
    .run()
    .await;
}

struct Runner<R: Reconciler> {
    name: &'static str,
    reconciler: Arc<R>,
    requests: mpsc::UnboundedReceiver<String>,
    stop: CancellationToken,
    delay: DelayQueue<String>,
    /// Deduplication metadata for queued keys; the earlier deadline
    /// wins when a key is scheduled twice.
    scheduled: HashMap<String, (Instant, delay_queue::Key)>,
    running: HashSet<String>,
    /// Keys that came due while running; re-dispatched on completion.
    pending: HashSet<String>,
    in_flight: FuturesUnordered<BoxFuture<'static, (String, Result<Action, R::Error>)>>,
    backoffs: AHashMap<String, backoff::ExponentialBackoff>,
}

impl<R: Reconciler> Runner<R> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(key) => self.schedule(key, Instant::now()),
                    None => break,
                },
                expired = poll_fn(|cx| self.delay.poll_expired(cx)), if !self.delay.is_empty() => {
                    if let Some(expired) = expired {
                        let key = expired.into_inner();
                        self.scheduled.remove(&key);
                        if self.running.contains(&key) {
                            self.pending.insert(key);
                        } else {
                            self.dispatch(key);
                        }
                    }
                }
                Some((key, result)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.complete(key, result);
                }
            }
        }
        // graceful shutdown: let running reconciliations finish
        while self.in_flight.next().await.is_some() {}
        debug!(controller = self.name, "runner stopped");
    }

    fn schedule(&mut self, key: String, run_at: Instant) {
        if self.running.contains(&key) {
            self.pending.insert(key);
            return;
        }
        match self.scheduled.entry(key) {
            hashbrown::hash_map::Entry::Occupied(mut entry) => {
                let (scheduled_at, queue_key) = entry.get_mut();
                if run_at < *scheduled_at {
                    self.delay.reset_at(queue_key, run_at);
                    *scheduled_at = run_at;
                }
            }
            hashbrown::hash_map::Entry::Vacant(entry) => {
                let queue_key = self.delay.insert_at(entry.key().clone(), run_at);
                entry.insert((run_at, queue_key));
            }
        }
    }

    fn dispatch(&mut self, key: String) {
        self.running.insert(key.clone());
        let reconciler = self.reconciler.clone();
        self.in_flight.push(
            async move {
                let result = reconciler.reconcile(&key).await;
                (key, result)
            }
            .boxed(),
        );
    }

    fn complete(&mut self, key: String, result: Result<Action, R::Error>) {
        self.running.remove(&key);
        match result {
            Ok(action) => {
                self.backoffs.remove(&key);
                if let Some(delay) = action.requeue_after() {
                    self.schedule(key.clone(), Instant::now() + delay);
                }
            }
            Err(err) => {
                warn!(controller = self.name, key = %key, error = %err, "reconciliation failed");
                let backoff = self.backoffs.entry(key.clone()).or_insert_with(error_backoff);
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                self.schedule(key.clone(), Instant::now() + delay);
            }
        }
        if self.pending.remove(&key) {
            self.schedule(key, Instant::now());
        }
    }
}
