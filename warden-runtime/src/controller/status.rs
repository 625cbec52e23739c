//! Aggregation of per-replica status rows onto the template.
//!
//! Kept apart from the template reconciler so each status field has a
//! single writer: replicas own their rows, this aggregator owns the
//! template's `by_pod` array and `created` flag.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use warden_core::{
    template::ConstraintTemplateStatus, TemplatePodStatus, TEMPLATE_LABEL,
};

use crate::{
    cluster::{Cluster, ClusterError},
    controller::runner::{Action, Reconciler},
};

/// Reconciler keyed by template name, triggered by template changes
/// and by changes to any status row labelled with the template.
pub struct StatusAggregator {
    cluster: Arc<dyn Cluster>,
}

impl StatusAggregator {
    #[must_use]
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Reconciler for StatusAggregator {
    type Error = ClusterError;

    async fn reconcile(&self, key: &str) -> Result<Action, ClusterError> {
        let Some(mut template) = self.cluster.get_template(key).await? else {
            // the aggregate dies with the template
            return Ok(Action::await_change());
        };
        if template.metadata.deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        let rows = self
            .cluster
            .list_pod_statuses(&format!("{TEMPLATE_LABEL}={key}"))
            .await?;

        // only rows written against this incarnation of the template
        // count; orphans from a deleted-recreated template are
        // skipped until they are garbage-collected
        let uid = template.uid_or_default();
        let mut by_pod: Vec<TemplatePodStatus> = rows
            .into_iter()
            .filter_map(|row| row.status)
            .filter(|payload| payload.template_uid == uid)
            .collect();
        by_pod.sort_by(|a, b| a.id.cmp(&b.id));

        let next = ConstraintTemplateStatus {
            created: Some(!by_pod.is_empty()),
            by_pod,
        };
        if template.status.as_ref() == Some(&next) {
            return Ok(Action::await_change());
        }

        debug!(template = %template.name_any(), replicas = next.by_pod.len(), "aggregating status");
        template.status = Some(next);
        self.cluster.update_template_status(&template).await?;
        Ok(Action::await_change())
    }
}
