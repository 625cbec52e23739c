use async_trait::async_trait;
use k8s_openapi::{
    api::admissionregistration::v1::ValidatingAdmissionPolicy,
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client, ResourceExt,
};
use thiserror::Error;

use warden_core::{ConstraintTemplate, ConstraintTemplatePodStatus};

/// Failures from the platform API.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("api error: {0}")]
    Api(#[from] kube::Error),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Implementation-specific failure.
    #[error("cluster failure: {0}")]
    Internal(String),
}

impl ClusterError {
    /// True for optimistic-concurrency conflicts (retry after
    /// re-reading).
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Api(kube::Error::Api(response)) if response.code == 409)
    }

    /// True when the referenced object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::Api(kube::Error::Api(response)) if response.code == 404)
    }
}

/// The exact platform operations the reconcilers perform.
///
/// Kept narrow on purpose: the production implementation is a thin
/// wrapper over typed [`kube::Api`] handles, and tests inject an
/// in-memory fake through the same seam.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get_template(&self, name: &str) -> Result<Option<ConstraintTemplate>, ClusterError>;

    /// Replace a template's main document (metadata changes such as
    /// annotations or finalizer removal).
    async fn update_template(
        &self,
        template: &ConstraintTemplate,
    ) -> Result<ConstraintTemplate, ClusterError>;

    /// Write a template's status through the status subresource.
    async fn update_template_status(&self, template: &ConstraintTemplate)
        -> Result<(), ClusterError>;

    async fn get_pod_status(
        &self,
        name: &str,
    ) -> Result<Option<ConstraintTemplatePodStatus>, ClusterError>;

    async fn create_pod_status(
        &self,
        status: &ConstraintTemplatePodStatus,
    ) -> Result<ConstraintTemplatePodStatus, ClusterError>;

    async fn update_pod_status(
        &self,
        status: &ConstraintTemplatePodStatus,
    ) -> Result<(), ClusterError>;

    /// Delete one status row; deleting an absent row is a no-op.
    async fn delete_pod_status(&self, name: &str) -> Result<(), ClusterError>;

    /// List status rows matching a `key=value` label selector.
    async fn list_pod_statuses(
        &self,
        selector: &str,
    ) -> Result<Vec<ConstraintTemplatePodStatus>, ClusterError>;

    /// Delete every status row matching a `key=value` label selector.
    async fn delete_pod_statuses_matching(&self, selector: &str) -> Result<(), ClusterError>;

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, ClusterError>;

    async fn create_crd(&self, crd: &CustomResourceDefinition) -> Result<(), ClusterError>;

    async fn update_crd(&self, crd: &CustomResourceDefinition) -> Result<(), ClusterError>;

    async fn get_vap(&self, name: &str)
        -> Result<Option<ValidatingAdmissionPolicy>, ClusterError>;

    async fn create_vap(&self, policy: &ValidatingAdmissionPolicy) -> Result<(), ClusterError>;

    async fn update_vap(&self, policy: &ValidatingAdmissionPolicy) -> Result<(), ClusterError>;

    /// Delete a policy; deleting an absent policy is a no-op.
    async fn delete_vap(&self, name: &str) -> Result<(), ClusterError>;
}

/// Production implementation over typed API handles.
///
/// Per-replica status rows live in the controller's own namespace;
/// everything else is cluster-scoped.
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn templates(&self) -> Api<ConstraintTemplate> {
        Api::all(self.client.clone())
    }

    fn pod_statuses(&self) -> Api<ConstraintTemplatePodStatus> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn crds(&self) -> Api<CustomResourceDefinition> {
        Api::all(self.client.clone())
    }

    fn vaps(&self) -> Api<ValidatingAdmissionPolicy> {
        Api::all(self.client.clone())
    }
}

/// Treat 404 on delete as success so teardown is re-entrant.
fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), ClusterError> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_template(&self, name: &str) -> Result<Option<ConstraintTemplate>, ClusterError> {
        Ok(self.templates().get_opt(name).await?)
    }

    async fn update_template(
        &self,
        template: &ConstraintTemplate,
    ) -> Result<ConstraintTemplate, ClusterError> {
        Ok(self
            .templates()
            .replace(&template.name_any(), &PostParams::default(), template)
            .await?)
    }

    async fn update_template_status(
        &self,
        template: &ConstraintTemplate,
    ) -> Result<(), ClusterError> {
        self.templates()
            .replace_status(
                &template.name_any(),
                &PostParams::default(),
                serde_json::to_vec(template)?,
            )
            .await?;
        Ok(())
    }

    async fn get_pod_status(
        &self,
        name: &str,
    ) -> Result<Option<ConstraintTemplatePodStatus>, ClusterError> {
        Ok(self.pod_statuses().get_opt(name).await?)
    }

    async fn create_pod_status(
        &self,
        status: &ConstraintTemplatePodStatus,
    ) -> Result<ConstraintTemplatePodStatus, ClusterError> {
        Ok(self
            .pod_statuses()
            .create(&PostParams::default(), status)
            .await?)
    }

    async fn update_pod_status(
        &self,
        status: &ConstraintTemplatePodStatus,
    ) -> Result<(), ClusterError> {
        self.pod_statuses()
            .replace(&status.name_any(), &PostParams::default(), status)
            .await?;
        Ok(())
    }

    async fn delete_pod_status(&self, name: &str) -> Result<(), ClusterError> {
        ignore_not_found(
            self.pod_statuses()
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn list_pod_statuses(
        &self,
        selector: &str,
    ) -> Result<Vec<ConstraintTemplatePodStatus>, ClusterError> {
        let list = self
            .pod_statuses()
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn delete_pod_statuses_matching(&self, selector: &str) -> Result<(), ClusterError> {
        self.pod_statuses()
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(selector),
            )
            .await?;
        Ok(())
    }

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, ClusterError> {
        Ok(self.crds().get_opt(name).await?)
    }

    async fn create_crd(&self, crd: &CustomResourceDefinition) -> Result<(), ClusterError> {
        self.crds().create(&PostParams::default(), crd).await?;
        Ok(())
    }

    async fn update_crd(&self, crd: &CustomResourceDefinition) -> Result<(), ClusterError> {
        self.crds()
            .replace(&crd.name_any(), &PostParams::default(), crd)
            .await?;
        Ok(())
    }

    async fn get_vap(
        &self,
        name: &str,
    ) -> Result<Option<ValidatingAdmissionPolicy>, ClusterError> {
        Ok(self.vaps().get_opt(name).await?)
    }

    async fn create_vap(&self, policy: &ValidatingAdmissionPolicy) -> Result<(), ClusterError> {
        self.vaps().create(&PostParams::default(), policy).await?;
        Ok(())
    }

    async fn update_vap(&self, policy: &ValidatingAdmissionPolicy) -> Result<(), ClusterError> {
        self.vaps()
            .replace(&policy.name_any(), &PostParams::default(), policy)
            .await?;
        Ok(())
    }

    async fn delete_vap(&self, name: &str) -> Result<(), ClusterError> {
        ignore_not_found(self.vaps().delete(name, &DeleteParams::default()).await)
    }
}
