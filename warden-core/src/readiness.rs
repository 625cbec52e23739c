use crate::template::ConstraintTemplate;

/// Observation hooks a downstream readiness system may implement so
/// it can wait for the controller to reach a steady state.
///
/// The controller only ever notifies; it never waits on the tracker,
/// and every method must return promptly.
pub trait ReadinessTracker: Send + Sync {
    /// A template was (re-)observed and is expected to converge.
    fn observe_template(&self, template: &ConstraintTemplate);

    /// Stop expecting a template that failed to compile. Idempotent;
    /// may be called for templates that were never observed.
    fn try_cancel_template(&self, template: &ConstraintTemplate);

    /// Stop expecting a deleted template.
    fn cancel_template(&self, template: &ConstraintTemplate);
}

/// Tracker used when no readiness system is wired in.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracker;

impl ReadinessTracker for NoopTracker {
    fn observe_template(&self, _template: &ConstraintTemplate) {}

    fn try_cancel_template(&self, _template: &ConstraintTemplate) {}

    fn cancel_template(&self, _template: &ConstraintTemplate) {}
}
