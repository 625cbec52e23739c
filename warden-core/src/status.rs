use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{errors::StatusError, template::ConstraintTemplate};

/// API group of the per-replica status resources.
pub const STATUS_GROUP: &str = "status.warden.dev";

/// Label naming the controller replica that owns a status row.
pub const POD_LABEL: &str = "internal.warden.dev/pod";

/// Label naming the template (or constraint) a status row belongs to.
pub const TEMPLATE_LABEL: &str = "internal.warden.dev/template-name";

/// Empty spec of the per-replica template status resource; the
/// payload lives entirely on `status`.
///
/// One object exists per (controller replica, template), named
/// `<replica>-<template>` so replicas never contend on each other's
/// rows. Rows from a deleted-and-recreated template are recognized
/// by a stale `templateUid` and ignored by the aggregator.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "status.warden.dev",
    version = "v1",
    kind = "ConstraintTemplatePodStatus",
    namespaced,
    status = "TemplatePodStatus"
)]
pub struct ConstraintTemplatePodStatusSpec {}

/// The payload of a per-replica status row, also embedded verbatim in
/// the template's aggregate `status.by_pod`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePodStatus {
    /// Replica id; the aggregate array is sorted on this.
    #[serde(default)]
    pub id: String,
    /// UID of the template observed when this row was written.
    #[serde(default)]
    pub template_uid: String,
    /// Template generation observed when this row was written.
    #[serde(default)]
    pub observed_generation: i64,
    /// Active failures on this replica; empty means healthy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StatusError>,
    /// State of the optional admission-policy generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vap_state: Option<VapStatus>,
}

/// Outcome of generating the optional `ValidatingAdmissionPolicy`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VapStatus {
    /// `pending`, `generated` or `error`.
    pub state: String,
    /// Detail accompanying the `error` state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl VapStatus {
    /// Policy generation failed.
    pub const ERROR: &'static str = "error";
    /// The policy is installed and current.
    pub const GENERATED: &'static str = "generated";
    /// Generation is underway or waiting out the binding delay.
    pub const PENDING: &'static str = "pending";

    /// State for an installed, current policy.
    #[must_use]
    pub fn generated() -> Self {
        Self {
            state: Self::GENERATED.into(),
            warning: None,
        }
    }

    /// State while generation is still settling.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            state: Self::PENDING.into(),
            warning: None,
        }
    }

    /// State for a failed generation, carrying the failure detail.
    pub fn error(warning: impl std::fmt::Display) -> Self {
        Self {
            state: Self::ERROR.into(),
            warning: Some(warning.to_string()),
        }
    }
}

/// Name of the status row owned by `pod` for `template`.
#[must_use]
pub fn pod_status_name(pod: &str, template: &str) -> String {
    format!("{pod}-{template}")
}

impl ConstraintTemplatePodStatus {
    /// Build the row a replica owns for a template, labelled so the
    /// aggregator and the delete cascade can find it.
    #[must_use]
    pub fn for_template(pod: &str, namespace: &str, template: &ConstraintTemplate) -> Self {
        let mut obj = Self::new(
            &pod_status_name(pod, &template.name_any()),
            ConstraintTemplatePodStatusSpec {},
        );
        obj.metadata.namespace = Some(namespace.to_string());
        obj.metadata.labels = Some(BTreeMap::from([
            (POD_LABEL.to_string(), pod.to_string()),
            (TEMPLATE_LABEL.to_string(), template.name_any()),
        ]));
        obj.status = Some(TemplatePodStatus {
            id: pod.to_string(),
            template_uid: template.uid_or_default(),
            observed_generation: template.metadata.generation.unwrap_or_default(),
            errors: Vec::new(),
            vap_state: None,
        });
        obj
    }

    /// The template this row belongs to, read back from its label.
    #[must_use]
    pub fn template_name(&self) -> Option<&str> {
        self.labels().get(TEMPLATE_LABEL).map(String::as_str)
    }
}
