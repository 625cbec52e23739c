use kube::{core::GroupVersionKind, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::TemplatePodStatus;

/// Root of every fixed name, group and label owned by this system.
pub const APP_ROOT: &str = "warden.dev";

/// API group of the [`ConstraintTemplate`] resource itself.
pub const TEMPLATE_GROUP: &str = "templates.warden.dev";

/// API group carrying the constraint kinds generated from templates.
pub const CONSTRAINT_GROUP: &str = "constraints.warden.dev";

/// Version served for every generated constraint kind.
pub const CONSTRAINT_VERSION: &str = "v1beta1";

/// Finalizer written by earlier revisions of the controller.
///
/// Deletion is coordinated through reconcile re-entry now; the
/// reconciler strips this from any template still carrying it.
pub const LEGACY_FINALIZER: &str = "finalizers.warden.dev/cleanup";

/// A user-authored policy template.
///
/// Each template names the constraint kind its instances will carry
/// and holds the policy program the engine compiles for that kind.
/// The controller derives a CRD from the template, installs it, and
/// watches the resulting kind; the template's `status` is written by
/// two separate owners: each replica's reconciler owns its own row in
/// a `ConstraintTemplatePodStatus` object, and the aggregator owns
/// `status.by_pod` here.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "templates.warden.dev",
    version = "v1",
    kind = "ConstraintTemplate",
    status = "ConstraintTemplateStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintTemplateSpec {
    /// Names for the generated constraint kind.
    pub crd: TemplateCrd,
    /// The policy program and the cluster surface it applies to.
    pub target: TemplateTarget,
    /// Whether a `ValidatingAdmissionPolicy` should be generated in
    /// parallel to the constraint mechanism. Absent means "use the
    /// controller default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_vap: Option<bool>,
}

/// Naming block for the generated constraint kind.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateCrd {
    /// Names of the generated constraint kind.
    pub names: TemplateNames,
}

/// Names derived for the generated schema.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateNames {
    /// Kind carried by instances of the generated schema.
    pub kind: String,
}

/// The policy program attached to a template.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateTarget {
    /// Which cluster surface the policy applies to.
    pub target: String,
    /// The program, in the engine's language.
    pub source: String,
}

/// Aggregate status written onto the template.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintTemplateStatus {
    /// True while at least one replica reports a successfully
    /// installed schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
    /// Per-replica status rows, sorted by replica id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub by_pod: Vec<TemplatePodStatus>,
}

impl ConstraintTemplate {
    /// Kind carried by this template's generated schema.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        &self.spec.crd.names.kind
    }

    /// Lowercased plural of the generated kind, used as the CRD's
    /// `names.plural` and in its canonical name.
    #[must_use]
    pub fn constraint_plural(&self) -> String {
        to_plural(&self.spec.crd.names.kind.to_ascii_lowercase())
    }

    /// Group/version/kind of the generated constraint kind.
    #[must_use]
    pub fn constraint_gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(CONSTRAINT_GROUP, CONSTRAINT_VERSION, self.kind_name())
    }

    /// Canonical name of the generated CRD: `<plural>.<group>`.
    #[must_use]
    pub fn crd_name(&self) -> String {
        format!("{}.{CONSTRAINT_GROUP}", self.constraint_plural())
    }

    /// Whether a VAP should be generated for this template.
    #[must_use]
    pub fn should_generate_vap(&self, default_generate: bool) -> bool {
        self.spec.generate_vap.unwrap_or(default_generate)
    }

    /// Stable identity of this template, empty until persisted.
    #[must_use]
    pub fn uid_or_default(&self) -> String {
        self.uid().unwrap_or_default()
    }
}

/// Simple English pluralization, matching how the platform derives
/// resource plurals from kinds.
fn to_plural(word: &str) -> String {
    if word.ends_with('s') || word.ends_with('x') {
        format!("{word}es")
    } else if let Some(stem) = word.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{word}s")
    }
}
