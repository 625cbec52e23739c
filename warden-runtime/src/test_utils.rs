//! In-memory fakes injected through the crate's seam traits, shared
//! by the unit tests.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use k8s_openapi::{
    api::admissionregistration::v1::ValidatingAdmissionPolicy,
    apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
        CustomResourceDefinitionVersion,
    },
};
use kube::{
    api::{ApiResource, DynamicObject},
    core::{ErrorResponse, GroupVersionKind},
    ResourceExt,
};
use parking_lot::{Mutex, RwLock};

use warden_core::{
    status::ConstraintTemplatePodStatusSpec,
    template::{ConstraintTemplateSpec, TemplateCrd, TemplateNames, TemplateTarget},
    ConstraintTemplate, ConstraintTemplatePodStatus, Engine, EngineError, ReadinessTracker,
    TemplatePodStatus, CONSTRAINT_GROUP, CONSTRAINT_VERSION, POD_LABEL, TEMPLATE_LABEL,
};

use crate::{
    cache::{CacheError, EventHandler, Informer, RemovableCache},
    cluster::{Cluster, ClusterError},
};

pub(crate) fn dynamic_object(name: &str, gvk: &GroupVersionKind) -> DynamicObject {
    DynamicObject::new(name, &ApiResource::from_gvk(gvk))
}

pub(crate) fn template(name: &str, kind: &str, source: &str) -> ConstraintTemplate {
    let mut t = ConstraintTemplate::new(name, ConstraintTemplateSpec {
        crd: TemplateCrd {
            names: TemplateNames { kind: kind.into() },
        },
        target: TemplateTarget {
            target: "admission.warden.dev".into(),
            source: source.into(),
        },
        generate_vap: None,
    });
    t.metadata.uid = Some(format!("uid-{name}"));
    t.metadata.generation = Some(1);
    t
}

fn api_error(code: u16, reason: &str) -> ClusterError {
    ClusterError::Api(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (induced by test)"),
        reason: reason.to_string(),
        code,
    }))
}

/// Event handler that only counts invocations.
#[derive(Default)]
pub(crate) struct CountingHandler {
    adds: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

impl CountingHandler {
    pub(crate) fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub(crate) fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub(crate) fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn on_add(&self, _obj: Arc<DynamicObject>) {
        self.adds.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_update(&self, _old: Arc<DynamicObject>, _new: Arc<DynamicObject>) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_delete(&self, _obj: Arc<DynamicObject>) {
        self.deletes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Informer whose events are fired by the test itself.
#[derive(Default)]
pub(crate) struct FakeInformer {
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
}

impl FakeInformer {
    fn handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.handler.read().clone()
    }

    pub(crate) async fn fire_add(&self, obj: Arc<DynamicObject>) {
        if let Some(handler) = self.handler() {
            handler.on_add(obj).await;
        }
    }

    pub(crate) async fn fire_update(&self, old: Arc<DynamicObject>, new: Arc<DynamicObject>) {
        if let Some(handler) = self.handler() {
            handler.on_update(old, new).await;
        }
    }

    #[allow(dead_code)]
    pub(crate) async fn fire_delete(&self, obj: Arc<DynamicObject>) {
        if let Some(handler) = self.handler() {
            handler.on_delete(obj).await;
        }
    }
}

impl Informer for FakeInformer {
    fn set_handler(&self, handler: Arc<dyn EventHandler>) -> Result<(), CacheError> {
        let mut slot = self.handler.write();
        if slot.is_some() {
            return Err(CacheError::HandlerAlreadySet);
        }
        *slot = Some(handler);
        Ok(())
    }
}

/// Removable cache with test-controlled contents and failures.
#[derive(Default)]
pub(crate) struct FakeCache {
    known: Mutex<AHashSet<GroupVersionKind>>,
    informers: Mutex<AHashMap<GroupVersionKind, Arc<FakeInformer>>>,
    stores: Mutex<AHashMap<GroupVersionKind, Vec<Arc<DynamicObject>>>>,
    acquisitions: Mutex<AHashMap<GroupVersionKind, usize>>,
    removals: Mutex<AHashMap<GroupVersionKind, usize>>,
    list_failures: Mutex<AHashMap<GroupVersionKind, usize>>,
}

impl FakeCache {
    pub(crate) fn with_kinds(kinds: impl IntoIterator<Item = GroupVersionKind>) -> Arc<Self> {
        let cache = Self::default();
        *cache.known.lock() = kinds.into_iter().collect();
        Arc::new(cache)
    }

    /// Make a kind discoverable, as if its CRD had been installed.
    pub(crate) fn install(&self, gvk: &GroupVersionKind) {
        self.known.lock().insert(gvk.clone());
    }

    pub(crate) fn seed(&self, gvk: &GroupVersionKind, objects: Vec<DynamicObject>) {
        self.stores
            .lock()
            .insert(gvk.clone(), objects.into_iter().map(Arc::new).collect());
    }

    /// Fail the next `count` lists for a kind with a transient error.
    pub(crate) fn fail_lists(&self, gvk: &GroupVersionKind, count: usize) {
        self.list_failures.lock().insert(gvk.clone(), count);
    }

    pub(crate) fn acquisitions(&self, gvk: &GroupVersionKind) -> usize {
        self.acquisitions.lock().get(gvk).copied().unwrap_or(0)
    }

    pub(crate) fn removals(&self, gvk: &GroupVersionKind) -> usize {
        self.removals.lock().get(gvk).copied().unwrap_or(0)
    }

    pub(crate) fn informer(&self, gvk: &GroupVersionKind) -> Arc<FakeInformer> {
        self.informers
            .lock()
            .get(gvk)
            .expect("informer was never acquired")
            .clone()
    }
}

#[async_trait]
impl RemovableCache for FakeCache {
    async fn get_informer(&self, gvk: &GroupVersionKind) -> Result<Arc<dyn Informer>, CacheError> {
        if !self.known.lock().contains(gvk) {
            return Err(CacheError::kind_not_installed(gvk));
        }
        *self.acquisitions.lock().entry(gvk.clone()).or_default() += 1;
        let informer = self
            .informers
            .lock()
            .entry(gvk.clone())
            .or_default()
            .clone();
        Ok(informer)
    }

    async fn list(&self, gvk: &GroupVersionKind) -> Result<Vec<Arc<DynamicObject>>, CacheError> {
        {
            let mut failures = self.list_failures.lock();
            if let Some(remaining) = failures.get_mut(gvk) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(CacheError::Internal("induced list failure".to_string()));
                }
            }
        }
        Ok(self.stores.lock().get(gvk).cloned().unwrap_or_default())
    }

    async fn remove(&self, gvk: &GroupVersionKind) -> Result<(), CacheError> {
        self.informers.lock().remove(gvk);
        *self.removals.lock().entry(gvk.clone()).or_default() += 1;
        Ok(())
    }
}

/// Engine with scripted failures and a map of ingested templates.
#[derive(Default)]
pub(crate) struct FakeEngine {
    templates: Mutex<AHashMap<String, ConstraintTemplate>>,
    schema_failure: Mutex<Option<EngineError>>,
    ingest_failure: Mutex<Option<EngineError>>,
    removal_failures: Mutex<usize>,
}

impl FakeEngine {
    pub(crate) async fn fail_schema(&self, err: EngineError) {
        *self.schema_failure.lock() = Some(err);
    }

    pub(crate) async fn fail_ingest(&self, err: EngineError) {
        *self.ingest_failure.lock() = Some(err);
    }

    pub(crate) async fn fail_removals(&self, count: usize) {
        *self.removal_failures.lock() = count;
    }

    pub(crate) async fn contains(&self, name: &str) -> bool {
        self.templates.lock().contains_key(name)
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn create_schema(
        &self,
        template: &ConstraintTemplate,
    ) -> Result<CustomResourceDefinition, EngineError> {
        if let Some(err) = self.schema_failure.lock().clone() {
            return Err(err);
        }
        let plural = template.constraint_plural();
        Ok(CustomResourceDefinition {
            metadata: Default::default(),
            spec: CustomResourceDefinitionSpec {
                group: CONSTRAINT_GROUP.to_string(),
                names: CustomResourceDefinitionNames {
                    kind: template.kind_name().to_string(),
                    plural,
                    ..Default::default()
                },
                scope: "Cluster".to_string(),
                versions: vec![CustomResourceDefinitionVersion {
                    name: CONSTRAINT_VERSION.to_string(),
                    served: true,
                    storage: true,
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: None,
        })
    }

    async fn add_template(&self, template: &ConstraintTemplate) -> Result<(), EngineError> {
        if let Some(err) = self.ingest_failure.lock().clone() {
            return Err(err);
        }
        self.templates
            .lock()
            .insert(template.name_any(), template.clone());
        Ok(())
    }

    async fn remove_template(&self, name: &str) -> Result<(), EngineError> {
        {
            let mut failures = self.removal_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(EngineError::Internal("induced removal failure".to_string()));
            }
        }
        self.templates.lock().remove(name);
        Ok(())
    }

    async fn get_template(&self, name: &str) -> Result<Option<ConstraintTemplate>, EngineError> {
        Ok(self.templates.lock().get(name).cloned())
    }
}

/// Readiness tracker that only counts notifications.
#[derive(Default)]
pub(crate) struct RecordingTracker {
    observed: AtomicUsize,
    try_cancelled: AtomicUsize,
    cancelled: AtomicUsize,
}

impl RecordingTracker {
    pub(crate) fn observed(&self) -> usize {
        self.observed.load(Ordering::SeqCst)
    }

    pub(crate) fn try_cancelled(&self) -> usize {
        self.try_cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl ReadinessTracker for RecordingTracker {
    fn observe_template(&self, _template: &ConstraintTemplate) {
        self.observed.fetch_add(1, Ordering::SeqCst);
    }

    fn try_cancel_template(&self, _template: &ConstraintTemplate) {
        self.try_cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel_template(&self, _template: &ConstraintTemplate) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory stand-in for the platform API.
#[derive(Default)]
pub(crate) struct FakeCluster {
    templates: Mutex<AHashMap<String, ConstraintTemplate>>,
    pod_statuses: Mutex<AHashMap<String, ConstraintTemplatePodStatus>>,
    crds: Mutex<AHashMap<String, CustomResourceDefinition>>,
    vaps: Mutex<AHashMap<String, ValidatingAdmissionPolicy>>,
    crd_writes: AtomicUsize,
    template_status_writes: AtomicUsize,
    pod_status_update_failure: Mutex<Option<u16>>,
}

impl FakeCluster {
    pub(crate) fn put_template(&self, template: ConstraintTemplate) {
        self.templates.lock().insert(template.name_any(), template);
    }

    pub(crate) fn remove_template(&self, name: &str) {
        self.templates.lock().remove(name);
    }

    pub(crate) fn template(&self, name: &str) -> Option<ConstraintTemplate> {
        self.templates.lock().get(name).cloned()
    }

    pub(crate) fn crd(&self, name: &str) -> Option<CustomResourceDefinition> {
        self.crds.lock().get(name).cloned()
    }

    pub(crate) fn put_crd(&self, crd: CustomResourceDefinition) {
        self.crds.lock().insert(crd.name_any(), crd);
    }

    pub(crate) fn crd_writes(&self) -> usize {
        self.crd_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn template_status_writes(&self) -> usize {
        self.template_status_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn pod_status(&self, name: &str) -> Option<ConstraintTemplatePodStatus> {
        self.pod_statuses.lock().get(name).cloned()
    }

    pub(crate) fn pod_status_count(&self) -> usize {
        self.pod_statuses.lock().len()
    }

    /// Insert a labelled status row, deriving the replica id from the
    /// object name.
    pub(crate) fn put_pod_status(&self, name: &str, template: &str, uid: &str) {
        let id = name
            .strip_suffix(&format!("-{template}"))
            .unwrap_or(name)
            .to_string();
        let mut row =
            ConstraintTemplatePodStatus::new(name, ConstraintTemplatePodStatusSpec {});
        row.metadata.namespace = Some("warden-system".to_string());
        row.metadata.labels = Some(BTreeMap::from([
            (POD_LABEL.to_string(), id.clone()),
            (TEMPLATE_LABEL.to_string(), template.to_string()),
        ]));
        row.status = Some(TemplatePodStatus {
            id,
            template_uid: uid.to_string(),
            observed_generation: 1,
            errors: Vec::new(),
            vap_state: None,
        });
        self.put_pod_status_raw(row);
    }

    pub(crate) fn put_pod_status_raw(&self, row: ConstraintTemplatePodStatus) {
        self.pod_statuses.lock().insert(row.name_any(), row);
    }

    /// Fail the next pod-status update with the given HTTP code; a
    /// 404 also drops the row, simulating a deletion racing the
    /// update.
    pub(crate) fn fail_next_pod_status_update(&self, code: u16) {
        *self.pod_status_update_failure.lock() = Some(code);
    }

    pub(crate) fn vap(&self, name: &str) -> Option<ValidatingAdmissionPolicy> {
        self.vaps.lock().get(name).cloned()
    }

    fn selector_matches(selector: &str, row: &ConstraintTemplatePodStatus) -> bool {
        let Some((key, value)) = selector.split_once('=') else {
            return false;
        };
        row.labels().get(key).map(String::as_str) == Some(value)
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get_template(&self, name: &str) -> Result<Option<ConstraintTemplate>, ClusterError> {
        Ok(self.templates.lock().get(name).cloned())
    }

    async fn update_template(
        &self,
        template: &ConstraintTemplate,
    ) -> Result<ConstraintTemplate, ClusterError> {
        let name = template.name_any();
        let mut templates = self.templates.lock();
        if !templates.contains_key(&name) {
            return Err(api_error(404, "NotFound"));
        }
        templates.insert(name, template.clone());
        Ok(template.clone())
    }

    async fn update_template_status(
        &self,
        template: &ConstraintTemplate,
    ) -> Result<(), ClusterError> {
        let name = template.name_any();
        let mut templates = self.templates.lock();
        let Some(stored) = templates.get_mut(&name) else {
            return Err(api_error(404, "NotFound"));
        };
        stored.status = template.status.clone();
        self.template_status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_pod_status(
        &self,
        name: &str,
    ) -> Result<Option<ConstraintTemplatePodStatus>, ClusterError> {
        Ok(self.pod_statuses.lock().get(name).cloned())
    }

    async fn create_pod_status(
        &self,
        status: &ConstraintTemplatePodStatus,
    ) -> Result<ConstraintTemplatePodStatus, ClusterError> {
        let name = status.name_any();
        let mut rows = self.pod_statuses.lock();
        if rows.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists"));
        }
        rows.insert(name, status.clone());
        Ok(status.clone())
    }

    async fn update_pod_status(
        &self,
        status: &ConstraintTemplatePodStatus,
    ) -> Result<(), ClusterError> {
        let name = status.name_any();
        if let Some(code) = self.pod_status_update_failure.lock().take() {
            if code == 404 {
                self.pod_statuses.lock().remove(&name);
                return Err(api_error(404, "NotFound"));
            }
            return Err(api_error(code, "Conflict"));
        }
        let mut rows = self.pod_statuses.lock();
        if !rows.contains_key(&name) {
            return Err(api_error(404, "NotFound"));
        }
        rows.insert(name, status.clone());
        Ok(())
    }

    async fn delete_pod_status(&self, name: &str) -> Result<(), ClusterError> {
        self.pod_statuses.lock().remove(name);
        Ok(())
    }

    async fn list_pod_statuses(
        &self,
        selector: &str,
    ) -> Result<Vec<ConstraintTemplatePodStatus>, ClusterError> {
        Ok(self
            .pod_statuses
            .lock()
            .values()
            .filter(|row| Self::selector_matches(selector, row))
            .cloned()
            .collect())
    }

    async fn delete_pod_statuses_matching(&self, selector: &str) -> Result<(), ClusterError> {
        self.pod_statuses
            .lock()
            .retain(|_, row| !Self::selector_matches(selector, row));
        Ok(())
    }

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, ClusterError> {
        Ok(self.crds.lock().get(name).cloned())
    }

    async fn create_crd(&self, crd: &CustomResourceDefinition) -> Result<(), ClusterError> {
        let name = crd.name_any();
        let mut crds = self.crds.lock();
        if crds.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists"));
        }
        crds.insert(name, crd.clone());
        self.crd_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_crd(&self, crd: &CustomResourceDefinition) -> Result<(), ClusterError> {
        self.crds.lock().insert(crd.name_any(), crd.clone());
        self.crd_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_vap(
        &self,
        name: &str,
    ) -> Result<Option<ValidatingAdmissionPolicy>, ClusterError> {
        Ok(self.vaps.lock().get(name).cloned())
    }

    async fn create_vap(&self, policy: &ValidatingAdmissionPolicy) -> Result<(), ClusterError> {
        self.vaps.lock().insert(policy.name_any(), policy.clone());
        Ok(())
    }

    async fn update_vap(&self, policy: &ValidatingAdmissionPolicy) -> Result<(), ClusterError> {
        self.vaps.lock().insert(policy.name_any(), policy.clone());
        Ok(())
    }

    async fn delete_vap(&self, name: &str) -> Result<(), ClusterError> {
        self.vaps.lock().remove(name);
        Ok(())
    }
}
