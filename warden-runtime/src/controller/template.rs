//! The template reconciler: keeps the engine, the generated CRD, the
//! dynamic watches and the per-replica status row in step with each
//! template.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Resource, ResourceExt};
use thiserror::Error;
use tracing::{debug, info};

use warden_core::{
    pod_status_name,
    template::LEGACY_FINALIZER,
    ConstraintTemplate, ConstraintTemplatePodStatus, Engine, EngineError, ErrorCode,
    ReadinessTracker, StatusError, TemplatePodStatus, VapStatus, TEMPLATE_LABEL,
};

use crate::{
    cluster::{Cluster, ClusterError},
    controller::{
        runner::{Action, Reconciler},
        vap,
    },
    metrics::{ControllerMetrics, IngestOutcome, TemplateStatus},
    watch::{Registrar, WatchError},
};

pub use crate::controller::vap::VapConfig;

/// Failures that abort a reconciliation and send the key back to the
/// runner for a retried attempt.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("engine operation failed: {0}")]
    Engine(#[from] EngineError),
}

/// Reconciler over [`ConstraintTemplate`] keys.
///
/// The ordering contract inside one attempt: the engine ingests the
/// template before the watch is added (the engine is the source of
/// truth for live templates), and the watch is added only after the
/// generated CRD is installed (so the informer can discover the
/// kind). Teardown mirrors this: watches are removed by consulting
/// the engine's copy, and the engine entry goes away last so a failed
/// teardown re-enters cleanly. No finalizer is involved; deletion
/// converges through reconcile re-entry.
pub struct TemplateController {
    cluster: Arc<dyn Cluster>,
    engine: Arc<dyn Engine>,
    registrar: Arc<Registrar>,
    status_registrar: Arc<Registrar>,
    readiness: Arc<dyn ReadinessTracker>,
    metrics: Arc<ControllerMetrics>,
    pod_name: String,
    namespace: String,
    vap: Option<VapConfig>,
}

impl TemplateController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: Arc<dyn Cluster>,
        engine: Arc<dyn Engine>,
        registrar: Arc<Registrar>,
        status_registrar: Arc<Registrar>,
        readiness: Arc<dyn ReadinessTracker>,
        metrics: Arc<ControllerMetrics>,
        pod_name: impl Into<String>,
        namespace: impl Into<String>,
        vap: Option<VapConfig>,
    ) -> Self {
        Self {
            cluster,
            engine,
            registrar,
            status_registrar,
            readiness,
            metrics,
            pod_name: pod_name.into(),
            namespace: namespace.into(),
            vap,
        }
    }

    /// Tear down everything the controller holds for a template that
    /// is gone or going.
    async fn finalize(&self, name: &str) -> Result<Action, ReconcileError> {
        let Some(known) = self.engine.get_template(name).await? else {
            // nothing ingested, so nothing to unwind
            self.metrics.remove_template(name);
            debug!(template = name, "delete observed for unknown template");
            return Ok(Action::await_change());
        };

        let gvk = known.constraint_gvk();
        self.registrar.remove_watch(&gvk).await?;
        self.status_registrar.remove_watch(&gvk).await?;
        self.readiness.cancel_template(&known);
        // the engine entry is the teardown's source of truth; it goes
        // away last so any failure above re-enters with it intact
        self.engine.remove_template(name).await?;

        self.cluster
            .delete_pod_status(&pod_status_name(&self.pod_name, name))
            .await?;
        self.cluster
            .delete_pod_statuses_matching(&format!("{TEMPLATE_LABEL}={name}"))
            .await?;

        self.metrics.remove_template(name);
        info!(template = name, "template torn down");
        Ok(Action::await_change())
    }

    async fn reconcile_live(
        &self,
        mut template: ConstraintTemplate,
    ) -> Result<Action, ReconcileError> {
        let name = template.name_any();

        // earlier revisions coordinated deletion through a finalizer;
        // strip it so those templates delete cleanly now
        if template.finalizers().iter().any(|f| f == LEGACY_FINALIZER) {
            template
                .finalizers_mut()
                .retain(|f| f != LEGACY_FINALIZER);
            template = self.cluster.update_template(&template).await?;
            debug!(template = %name, "removed legacy finalizer");
        }

        let mut row = self.get_or_create_pod_status(&template).await?;
        let mut payload = row.status.take().unwrap_or_default();
        payload.id = self.pod_name.clone();
        payload.template_uid = template.uid_or_default();
        payload.observed_generation = template.metadata.generation.unwrap_or_default();
        payload.errors.clear();

        let outcome = self.sync(&template, &mut payload).await;

        let healthy = payload.errors.is_empty();
        row.status = Some(payload);
        self.publish_pod_status(&mut row).await?;

        let status = if healthy && outcome.is_ok() {
            TemplateStatus::Active
        } else {
            TemplateStatus::Error
        };
        self.metrics.set_template_status(&name, status);
        outcome
    }

    /// Steps 2–7 of the live path. Failures that the next template
    /// mutation should retry are recorded on `payload` and reported
    /// as success to the runner; failures worth an immediate retry
    /// propagate.
    async fn sync(
        &self,
        template: &ConstraintTemplate,
        payload: &mut TemplatePodStatus,
    ) -> Result<Action, ReconcileError> {
        if template.kind_name().is_empty() {
            self.readiness.try_cancel_template(template);
            payload.errors.push(StatusError::new(
                ErrorCode::ConversionError,
                "template does not name a constraint kind",
            ));
            return Ok(Action::await_change());
        }

        let proposed = match self.engine.create_schema(template).await {
            Ok(schema) => schema,
            Err(err) => {
                // a template that does not compile is not tracked for
                // readiness
                self.readiness.try_cancel_template(template);
                payload
                    .errors
                    .push(StatusError::new(err.status_code(), &err));
                debug!(template = %template.name_any(), error = %err, "schema derivation failed");
                return Ok(Action::await_change());
            }
        };

        // ingest before watching: the engine must know the template
        // before events for its kind start flowing
        let started = Instant::now();
        let ingested = self.engine.add_template(template).await;
        let seconds = started.elapsed().as_secs_f64();
        match ingested {
            Ok(()) => self.metrics.report_ingest(IngestOutcome::Success, seconds),
            Err(err) => {
                self.metrics.report_ingest(IngestOutcome::Error, seconds);
                self.readiness.try_cancel_template(template);
                payload
                    .errors
                    .push(StatusError::new(ErrorCode::IngestError, &err));
                return Ok(Action::await_change());
            }
        }

        self.readiness.observe_template(template);

        self.install_schema(template, proposed, payload).await?;

        // only now can the informer discover the generated kind
        let gvk = template.constraint_gvk();
        self.registrar.add_watch(&gvk).await?;
        self.status_registrar.add_watch(&gvk).await?;

        if let Some(config) = self.vap.clone() {
            return self.reconcile_vap(template, payload, &config).await;
        }
        Ok(Action::await_change())
    }

    /// Install or converge the generated CRD. An unchanged schema
    /// produces no API mutation.
    async fn install_schema(
        &self,
        template: &ConstraintTemplate,
        mut proposed: CustomResourceDefinition,
        payload: &mut TemplatePodStatus,
    ) -> Result<(), ReconcileError> {
        let crd_name = template.crd_name();
        proposed.metadata.name = Some(crd_name.clone());
        if let Some(owner) = template.controller_owner_ref(&()) {
            proposed.metadata.owner_references = Some(vec![owner]);
        }

        match self.cluster.get_crd(&crd_name).await? {
            None => {
                if let Err(err) = self.cluster.create_crd(&proposed).await {
                    payload
                        .errors
                        .push(StatusError::new(ErrorCode::CreateError, &err));
                    return Err(err.into());
                }
                info!(template = %template.name_any(), crd = %crd_name, "installed constraint schema");
            }
            Some(current) if schema_differs(&current, &proposed) => {
                proposed.metadata.resource_version = current.metadata.resource_version.clone();
                if let Err(err) = self.cluster.update_crd(&proposed).await {
                    payload
                        .errors
                        .push(StatusError::new(ErrorCode::UpdateError, &err));
                    return Err(err.into());
                }
                info!(template = %template.name_any(), crd = %crd_name, "restored constraint schema");
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn get_or_create_pod_status(
        &self,
        template: &ConstraintTemplate,
    ) -> Result<ConstraintTemplatePodStatus, ReconcileError> {
        let row_name = pod_status_name(&self.pod_name, &template.name_any());
        if let Some(existing) = self.cluster.get_pod_status(&row_name).await? {
            return Ok(existing);
        }
        let fresh =
            ConstraintTemplatePodStatus::for_template(&self.pod_name, &self.namespace, template);
        match self.cluster.create_pod_status(&fresh).await {
            Ok(created) => Ok(created),
            Err(err) if err.is_conflict() => {
                // lost a race with ourselves on a previous attempt
                match self.cluster.get_pod_status(&row_name).await? {
                    Some(row) => Ok(row),
                    None => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Publish the row, recovering locally from a vanished row or a
    /// stale resource version before giving up to the runner.
    async fn publish_pod_status(
        &self,
        row: &mut ConstraintTemplatePodStatus,
    ) -> Result<(), ReconcileError> {
        match self.cluster.update_pod_status(row).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                row.metadata.resource_version = None;
                *row = self.cluster.create_pod_status(row).await?;
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                match self.cluster.get_pod_status(&row.name_any()).await? {
                    Some(current) => {
                        row.metadata.resource_version = current.metadata.resource_version.clone();
                        self.cluster.update_pod_status(row).await?;
                        Ok(())
                    }
                    None => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn reconcile_vap(
        &self,
        template: &ConstraintTemplate,
        payload: &mut TemplatePodStatus,
        config: &VapConfig,
    ) -> Result<Action, ReconcileError> {
        let policy_name = vap::policy_name(&template.name_any());
        let current = self.cluster.get_vap(&policy_name).await?;

        if !template.should_generate_vap(config.default_generate) {
            if current.is_some() {
                self.cluster.delete_vap(&policy_name).await?;
                // refresh downstream constraint state so bindings
                // derived from this policy go away too
                let _ = self.status_registrar.replay(&template.constraint_gvk());
                info!(template = %template.name_any(), "removed admission policy");
            }
            payload.vap_state = None;
            return Ok(Action::await_change());
        }

        // Binding generation is delayed until the generated kind has
        // had time to become visible to the API server; the deadline
        // rides on the template as annotations.
        let now = Utc::now();
        let mut requeue = None;
        match vap::binding_state(template, now) {
            vap::BindingState::Unstamped => {
                let mut stamped = template.clone();
                vap::stamp_binding_annotations(&mut stamped, now, config.binding_delay);
                self.cluster.update_template(&stamped).await?;
                requeue = Some(config.binding_delay);
            }
            vap::BindingState::Blocked { remaining } => {
                requeue = Some(remaining);
            }
            vap::BindingState::Expired => {
                let mut unblocked = template.clone();
                vap::mark_unblocked(&mut unblocked);
                self.cluster.update_template(&unblocked).await?;
            }
            vap::BindingState::Unblocked => {}
        }

        match vap::policy_from_template(template, config) {
            Err(err) => {
                payload.vap_state = Some(VapStatus::error(&err));
            }
            Ok(desired) => {
                let changed = match &current {
                    None => {
                        self.cluster.create_vap(&desired).await?;
                        true
                    }
                    Some(current) if vap::policy_differs(current, &desired) => {
                        let mut desired = desired;
                        desired.metadata.resource_version =
                            current.metadata.resource_version.clone();
                        self.cluster.update_vap(&desired).await?;
                        true
                    }
                    Some(_) => false,
                };
                if changed {
                    // synthetic events nudge the constraint
                    // reconciler into refreshing derived bindings
                    let _ = self.status_registrar.replay(&template.constraint_gvk());
                }
                payload.vap_state = Some(if requeue.is_some() {
                    VapStatus::pending()
                } else {
                    VapStatus::generated()
                });
            }
        }

        Ok(requeue.map_or_else(Action::await_change, Action::requeue))
    }
}

#[async_trait]
impl Reconciler for TemplateController {
    type Error = ReconcileError;

    async fn reconcile(&self, key: &str) -> Result<Action, ReconcileError> {
        match self.cluster.get_template(key).await? {
            None => self.finalize(key).await,
            Some(template) if template.metadata.deletion_timestamp.is_some() => {
                self.finalize(key).await
            }
            Some(template) => self.reconcile_live(template).await,
        }
    }
}

fn schema_differs(current: &CustomResourceDefinition, desired: &CustomResourceDefinition) -> bool {
    serde_json::to_value(&current.spec).ok() != serde_json::to_value(&desired.spec).ok()
}
