//! Assembly of the controller core: configuration, channel wiring,
//! and the long-running task set.
//!
//! The embedding binary supplies the collaborators (cluster seam,
//! engine, cache, readiness tracker) and receives back the runner
//! handles to feed with watch triggers plus the constraint event
//! stream to hand to its constraint reconciler. Everything else —
//! registrars, metrics, the aggregator trigger forwarding — is wired
//! here.

use std::{sync::Arc, time::Duration};

use kube::api::DynamicObject;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use warden_core::{Engine, ReadinessTracker};

use crate::{
    cache::RemovableCache,
    cluster::Cluster,
    controller::{
        forward_triggers, runner,
        runner::RunnerHandle,
        status::StatusAggregator,
        template::{TemplateController, VapConfig},
        template_label_key,
    },
    metrics::{ControllerMetrics, WatchMetrics},
    watch::{WatchError, WatchManager},
};

/// Registrar names are fixed and part of the observable surface.
pub const CONSTRAINT_REGISTRAR: &str = "constraint-controller";
pub const STATUS_REGISTRAR: &str = "constraint-status-controller";

/// Tunables for the controller core.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuntimeConfig {
    /// This replica's identity; status rows are named
    /// `<pod-name>-<template>`.
    pub pod_name: String,
    /// Namespace holding the per-replica status rows.
    pub namespace: String,
    /// Capacity of the constraint event sink handed to the
    /// constraint reconciler. Replay blocks when it is full.
    pub constraint_events_capacity: usize,
    /// Capacity of the status trigger sink.
    pub status_events_capacity: usize,
    /// Admission-policy generation; absent disables the surface.
    pub vap: Option<VapSettings>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pod_name: "warden-controller".to_string(),
            namespace: "warden-system".to_string(),
            constraint_events_capacity: 1024,
            status_events_capacity: 1024,
            vap: None,
        }
    }
}

/// Serde-friendly shape of [`VapConfig`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VapSettings {
    pub default_generate: bool,
    pub binding_delay_seconds: u64,
    pub excluded_namespaces: Vec<String>,
}

impl VapSettings {
    fn to_config(&self) -> VapConfig {
        VapConfig {
            default_generate: self.default_generate,
            binding_delay: Duration::from_secs(self.binding_delay_seconds),
            excluded_namespaces: self.excluded_namespaces.clone(),
            match_conditions: Vec::new(),
        }
    }
}

/// The assembled core, ready to [`Runtime::run`].
pub struct Runtime {
    /// The watch manager; also useful for waiting on replays.
    pub manager: Arc<WatchManager>,
    /// Enqueue side of the template reconciler. Feed it template
    /// names from a template watch.
    pub templates: RunnerHandle,
    /// Enqueue side of the status aggregator. Fed automatically from
    /// status-row events; template-change triggers are the caller's.
    pub aggregator: RunnerHandle,
    template_controller: Arc<TemplateController>,
    status_aggregator: Arc<StatusAggregator>,
    template_requests: mpsc::UnboundedReceiver<String>,
    aggregator_requests: mpsc::UnboundedReceiver<String>,
    status_events: mpsc::Receiver<Arc<DynamicObject>>,
    constraint_events: Option<mpsc::Receiver<Arc<DynamicObject>>>,
}

impl Runtime {
    /// The event stream for the constraint reconciler. Yields each
    /// watched constraint on changes and on replay; consumers must be
    /// duplicate-tolerant. Can only be taken once.
    pub fn take_constraint_events(&mut self) -> Option<mpsc::Receiver<Arc<DynamicObject>>> {
        self.constraint_events.take()
    }

    /// Drive the core until `done` is cancelled: the watch manager's
    /// loops, both runners, and the status trigger forwarder.
    pub async fn run(self, done: CancellationToken) -> Result<(), WatchError> {
        let forwarder = tokio::spawn(forward_triggers(
            self.status_events,
            self.aggregator.clone(),
            template_label_key,
        ));
        let templates = tokio::spawn(runner::run(
            "templates",
            self.template_controller,
            self.template_requests,
            done.child_token(),
        ));
        let aggregator = tokio::spawn(runner::run(
            "status-aggregator",
            self.status_aggregator,
            self.aggregator_requests,
            done.child_token(),
        ));

        info!("controller core running");
        let result = self.manager.start(done).await;

        let _ = tokio::join!(templates, aggregator);
        // the forwarder blocks on a sink the manager still owns
        forwarder.abort();
        result
    }
}

/// Wire up the core against the supplied collaborators.
///
/// # Errors
///
/// Fails only if the fixed registrar names collide, which means two
/// cores were assembled against one watch manager.
pub fn assemble(
    cluster: Arc<dyn Cluster>,
    engine: Arc<dyn Engine>,
    cache: Arc<dyn RemovableCache>,
    readiness: Arc<dyn ReadinessTracker>,
    registry: &mut Registry,
    config: &RuntimeConfig,
) -> Result<Runtime, WatchError> {
    let watch_metrics = WatchMetrics::register(registry);
    let controller_metrics = ControllerMetrics::register(registry);
    let manager = WatchManager::new(cache, watch_metrics);

    let (constraint_tx, constraint_rx) = mpsc::channel(config.constraint_events_capacity);
    let (status_tx, status_rx) = mpsc::channel(config.status_events_capacity);
    let registrar = manager.new_registrar(CONSTRAINT_REGISTRAR, constraint_tx)?;
    let status_registrar = manager.new_registrar(STATUS_REGISTRAR, status_tx)?;

    let template_controller = Arc::new(TemplateController::new(
        cluster.clone(),
        engine,
        registrar,
        status_registrar,
        readiness,
        controller_metrics,
        config.pod_name.clone(),
        config.namespace.clone(),
        config.vap.as_ref().map(VapSettings::to_config),
    ));
    let status_aggregator = Arc::new(StatusAggregator::new(cluster));

    let (templates, template_requests) = runner::channel();
    let (aggregator, aggregator_requests) = runner::channel();

    Ok(Runtime {
        manager,
        templates,
        aggregator,
        template_controller,
        status_aggregator,
        template_requests,
        aggregator_requests,
        status_events: status_rx,
        constraint_events: Some(constraint_rx),
    })
}
