//! Controller core for the warden policy controller.
//!
//! Two tightly coupled halves live here:
//!
//! - The **watch manager** ([`watch`]): a multi-tenant registrar of
//!   kind-scoped informers. Upstream controllers hold a
//!   [`watch::Registrar`] and declare which kinds they want watched;
//!   the manager runs at most one informer per kind, fans events out
//!   to every interested registrar, and replays cached state to late
//!   joiners.
//! - The **reconcilers** ([`controller`]): the template reconciler
//!   (engine ingestion, CRD lifecycle, watch registration, teardown)
//!   and the per-replica status aggregator, both dispatched by a
//!   per-key serialized [`controller::runner`].
//!
//! Everything talks to the cluster through seam traits
//! ([`cache::RemovableCache`], [`cluster::Cluster`]) with production
//! implementations backed by [`kube`]; the policy engine and the
//! readiness tracker are injected contracts from `warden-core`.

/// Configuration and assembly of the controller core.
pub mod bootstrap;
/// Informer cache with non-blocking acquisition and removal.
pub mod cache;
/// Platform API surface used by the reconcilers.
pub mod cluster;
/// Reconcilers and the per-key dispatch runner.
pub mod controller;
/// Concurrent group/version/kind set.
pub mod gvk_set;
/// Observable gauges, counters and histograms.
pub mod metrics;
/// Per-registrar watch-intent bookkeeping.
pub mod vitals;
/// The dynamic watch manager.
pub mod watch;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bootstrap::{assemble, Runtime, RuntimeConfig};
pub use cache::{CacheError, EventHandler, Informer, KubeCache, RemovableCache};
pub use cluster::{Cluster, ClusterError, KubeCluster};
pub use controller::{
    runner::{Action, Reconciler, RunnerHandle},
    status::StatusAggregator,
    template::{TemplateController, VapConfig},
};
pub use gvk_set::GvkSet;
pub use metrics::{ControllerMetrics, TemplateStatus, WatchMetrics};
pub use watch::{EventSink, Registrar, WatchError, WatchManager};
