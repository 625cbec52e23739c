//! Transformation of templates into `ValidatingAdmissionPolicy`
//! objects, plus the annotation protocol that delays binding
//! generation until the generated kind is visible to the API server.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::admissionregistration::v1::{
        MatchCondition, MatchResources, NamedRuleWithOperations, ParamKind,
        ValidatingAdmissionPolicy, ValidatingAdmissionPolicySpec, Validation,
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement, ObjectMeta},
};
use kube::{Resource, ResourceExt};
use thiserror::Error;

use warden_core::{ConstraintTemplate, APP_ROOT, CONSTRAINT_GROUP, CONSTRAINT_VERSION};

/// When the current wait on binding generation started.
pub const GENERATION_TIME_ANNOTATION: &str = "warden.dev/binding-generation-time";

/// RFC3339 deadline before which bindings must not be generated;
/// flipped to [`UNBLOCKED`] once it elapses.
pub const BLOCK_UNTIL_ANNOTATION: &str = "warden.dev/block-binding-until";

/// Terminal value of [`BLOCK_UNTIL_ANNOTATION`].
pub const UNBLOCKED: &str = "unblocked";

/// Settings for the optional admission-policy surface.
#[derive(Clone, Debug)]
pub struct VapConfig {
    /// Generate policies for templates that do not say either way.
    pub default_generate: bool,
    /// How long to hold off binding generation after a template
    /// change, giving the API server time to serve the generated
    /// kind.
    pub binding_delay: Duration,
    /// Namespaces the generated policy must never match.
    pub excluded_namespaces: Vec<String>,
    /// Extra match conditions copied onto every generated policy.
    pub match_conditions: Vec<MatchCondition>,
}

impl Default for VapConfig {
    fn default() -> Self {
        Self {
            default_generate: false,
            binding_delay: Duration::from_secs(30),
            excluded_namespaces: Vec::new(),
            match_conditions: Vec::new(),
        }
    }
}

/// Failures turning a template into a policy; reported on the status
/// row as VAP state `error`.
#[derive(Debug, Error)]
pub enum VapError {
    #[error("template has no policy source to derive validations from")]
    EmptySource,
}

/// Name of the policy generated for a template.
#[must_use]
pub fn policy_name(template: &str) -> String {
    format!("{}-{template}", APP_ROOT.split('.').next().unwrap_or(APP_ROOT))
}

/// Where a template stands in the binding-delay protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindingState {
    /// No deadline stamped yet (or the stamp is unreadable).
    Unstamped,
    /// The deadline is stamped and still in the future.
    Blocked { remaining: Duration },
    /// The deadline has passed but the annotation has not been
    /// flipped yet.
    Expired,
    /// Bindings may be generated.
    Unblocked,
}

/// Read the delay protocol state off a template's annotations.
#[must_use]
pub fn binding_state(template: &ConstraintTemplate, now: DateTime<Utc>) -> BindingState {
    match template.annotations().get(BLOCK_UNTIL_ANNOTATION) {
        None => BindingState::Unstamped,
        Some(value) if value == UNBLOCKED => BindingState::Unblocked,
        Some(value) => match DateTime::parse_from_rfc3339(value) {
            Ok(deadline) => {
                let deadline = deadline.with_timezone(&Utc);
                if now >= deadline {
                    BindingState::Expired
                } else {
                    let remaining = (deadline - now).to_std().unwrap_or_default();
                    BindingState::Blocked { remaining }
                }
            }
            // a corrupt stamp is rewritten rather than trusted
            Err(_) => BindingState::Unstamped,
        },
    }
}

/// Stamp both delay annotations, starting a fresh wait.
pub fn stamp_binding_annotations(
    template: &mut ConstraintTemplate,
    now: DateTime<Utc>,
    delay: Duration,
) {
    let deadline = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
    let annotations = template.annotations_mut();
    annotations.insert(GENERATION_TIME_ANNOTATION.to_string(), now.to_rfc3339());
    annotations.insert(BLOCK_UNTIL_ANNOTATION.to_string(), deadline.to_rfc3339());
}

/// Flip the deadline annotation once the wait has elapsed.
pub fn mark_unblocked(template: &mut ConstraintTemplate) {
    template
        .annotations_mut()
        .insert(BLOCK_UNTIL_ANNOTATION.to_string(), UNBLOCKED.to_string());
}

/// Derive the admission policy for a template: fail-closed, matching
/// everything except the excluded namespaces, parameterized by the
/// template's constraint kind, validating with the template's policy
/// program.
pub fn policy_from_template(
    template: &ConstraintTemplate,
    config: &VapConfig,
) -> Result<ValidatingAdmissionPolicy, VapError> {
    let source = template.spec.target.source.trim();
    if source.is_empty() {
        return Err(VapError::EmptySource);
    }

    let mut metadata = ObjectMeta {
        name: Some(policy_name(&template.name_any())),
        ..ObjectMeta::default()
    };
    if let Some(owner) = template.controller_owner_ref(&()) {
        metadata.owner_references = Some(vec![owner]);
    }

    Ok(ValidatingAdmissionPolicy {
        metadata,
        spec: Some(ValidatingAdmissionPolicySpec {
            failure_policy: Some("Fail".to_string()),
            param_kind: Some(ParamKind {
                api_version: Some(format!("{CONSTRAINT_GROUP}/{CONSTRAINT_VERSION}")),
                kind: Some(template.kind_name().to_string()),
            }),
            match_constraints: Some(match_constraints(&config.excluded_namespaces)),
            match_conditions: (!config.match_conditions.is_empty())
                .then(|| config.match_conditions.clone()),
            validations: Some(vec![Validation {
                expression: source.to_string(),
                message: Some(format!("denied by {}", template.name_any())),
                message_expression: None,
                reason: None,
            }]),
            ..ValidatingAdmissionPolicySpec::default()
        }),
        status: None,
    })
}

fn match_constraints(excluded_namespaces: &[String]) -> MatchResources {
    MatchResources {
        namespace_selector: (!excluded_namespaces.is_empty()).then(|| LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "kubernetes.io/metadata.name".to_string(),
                operator: "NotIn".to_string(),
                values: Some(excluded_namespaces.to_vec()),
            }]),
            match_labels: None,
        }),
        resource_rules: Some(vec![NamedRuleWithOperations {
            api_groups: Some(vec!["*".to_string()]),
            api_versions: Some(vec!["*".to_string()]),
            operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
            resources: Some(vec!["*".to_string()]),
            resource_names: None,
            scope: None,
        }]),
        ..MatchResources::default()
    }
}

/// True when the installed policy's spec no longer matches the
/// derived one.
#[must_use]
pub fn policy_differs(
    current: &ValidatingAdmissionPolicy,
    desired: &ValidatingAdmissionPolicy,
) -> bool {
    serde_json::to_value(&current.spec).ok() != serde_json::to_value(&desired.spec).ok()
}
