//! Shared types and contracts for the warden policy controller.
//!
//! This crate carries the resource model (the user-authored
//! [`ConstraintTemplate`] and the per-replica
//! [`ConstraintTemplatePodStatus`]), the error taxonomy reported on
//! status objects, and the traits through which the controller core
//! talks to its collaborators: the policy [`Engine`] and the
//! [`ReadinessTracker`].
//!
//! Nothing in here performs I/O; the controller machinery lives in
//! `warden-runtime`.

/// The policy engine contract and its error kinds.
pub mod engine;
/// Error codes and messages carried on status objects.
pub mod errors;
/// Readiness tracking contract.
pub mod readiness;
/// The per-replica pod status resource.
pub mod status;
/// The constraint template resource and derived names.
pub mod template;

pub use engine::{Engine, EngineError};
pub use errors::{ErrorCode, StatusError};
pub use readiness::{NoopTracker, ReadinessTracker};
pub use status::{
    pod_status_name, ConstraintTemplatePodStatus, TemplatePodStatus, VapStatus, POD_LABEL,
    STATUS_GROUP, TEMPLATE_LABEL,
};
pub use template::{
    ConstraintTemplate, ConstraintTemplateStatus, TemplateTarget, APP_ROOT, CONSTRAINT_GROUP,
    CONSTRAINT_VERSION, TEMPLATE_GROUP,
};
