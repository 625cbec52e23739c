//! Reconcilers over the template resource and their dispatch.

use std::sync::Arc;

use kube::{api::DynamicObject, ResourceExt};
use tokio::sync::mpsc;

use warden_core::TEMPLATE_LABEL;

pub mod runner;
pub mod status;
pub mod template;
pub mod vap;

use runner::RunnerHandle;

/// Forward watch events into a runner, mapping each object to a
/// reconciliation key. Runs until the event channel closes.
pub async fn forward_triggers(
    mut events: mpsc::Receiver<Arc<DynamicObject>>,
    handle: RunnerHandle,
    map: impl Fn(&DynamicObject) -> Option<String> + Send + 'static,
) {
    while let Some(object) = events.recv().await {
        if let Some(key) = map(&object) {
            handle.enqueue(key);
        }
    }
}

/// Key mapper: the object's own name.
#[must_use]
pub fn name_key(object: &DynamicObject) -> Option<String> {
    object.metadata.name.clone()
}

/// Key mapper: the owning template's name, read from the status
/// label carried by per-replica status rows and constraints.
#[must_use]
pub fn template_label_key(object: &DynamicObject) -> Option<String> {
    object.labels().get(TEMPLATE_LABEL).cloned()
}
