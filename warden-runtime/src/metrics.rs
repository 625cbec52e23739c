//! Observable instruments for the template reconciler and the watch
//! manager, built on `prometheus-client` families.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

/// Fixed buckets for `template_ingestion_duration_seconds`.
pub const INGESTION_BUCKETS: [f64; 19] = [
    0.01, 0.02, 0.03, 0.04, 0.05, 0.06, 0.07, 0.08, 0.09, 0.1, 0.2, 0.3, 0.4, 0.5, 1.0, 2.0, 3.0,
    4.0, 5.0,
];

/// Steady-state classification of a template, used as the `status`
/// label on the `templates` gauge.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum TemplateStatus {
    Active,
    Error,
}

impl TemplateStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateStatus::Active => "active",
            TemplateStatus::Error => "error",
        }
    }
}

impl EncodeLabelValue for TemplateStatus {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        use std::fmt::Write;
        encoder.write_str(self.as_str())
    }
}

/// Outcome of one engine ingestion attempt.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum IngestOutcome {
    Success,
    Error,
}

impl IngestOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Success => "success",
            IngestOutcome::Error => "error",
        }
    }
}

impl EncodeLabelValue for IngestOutcome {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        use std::fmt::Write;
        encoder.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StatusLabels {
    status: TemplateStatus,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    status: IngestOutcome,
}

#[derive(Debug, Default)]
struct TemplateGaugeState {
    statuses: AHashMap<String, TemplateStatus>,
    dirty: bool,
}

/// Instruments owned by the template reconciler.
///
/// The `templates` gauge is served from an in-memory registry keyed
/// by template name; a dirty flag keeps reports to actual changes.
#[derive(Debug)]
pub struct ControllerMetrics {
    templates: Family<StatusLabels, Gauge>,
    ingestions: Family<OutcomeLabels, Counter>,
    ingest_duration: Family<OutcomeLabels, Histogram>,
    state: Mutex<TemplateGaugeState>,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self {
            templates: Family::default(),
            ingestions: Family::default(),
            ingest_duration: Family::new_with_constructor(|| {
                Histogram::new(INGESTION_BUCKETS.iter().copied())
            }),
            state: Mutex::new(TemplateGaugeState::default()),
        }
    }
}

impl ControllerMetrics {
    /// Create the instruments and register them.
    pub fn register(registry: &mut Registry) -> Arc<Self> {
        let metrics = Arc::new(Self::default());
        registry.register(
            "templates",
            "Number of templates grouped by status",
            metrics.templates.clone(),
        );
        registry.register(
            "template_ingestions",
            "Count of template ingestion attempts",
            metrics.ingestions.clone(),
        );
        registry.register(
            "template_ingestion_duration_seconds",
            "Distribution of template ingestion durations",
            metrics.ingest_duration.clone(),
        );
        metrics
    }

    /// Record one ingestion attempt and its duration.
    pub fn report_ingest(&self, outcome: IngestOutcome, seconds: f64) {
        let labels = OutcomeLabels { status: outcome };
        self.ingestions.get_or_create(&labels).inc();
        self.ingest_duration.get_or_create(&labels).observe(seconds);
    }

    /// Record a template's current status in the gauge registry.
    pub fn set_template_status(&self, name: &str, status: TemplateStatus) {
        let mut state = self.state.lock();
        if state.statuses.get(name) != Some(&status) {
            state.statuses.insert(name.to_string(), status);
            state.dirty = true;
        }
        self.flush(&mut state);
    }

    /// Drop a deleted template from the gauge registry.
    pub fn remove_template(&self, name: &str) {
        let mut state = self.state.lock();
        if state.statuses.remove(name).is_some() {
            state.dirty = true;
        }
        self.flush(&mut state);
    }

    fn flush(&self, state: &mut TemplateGaugeState) {
        if !state.dirty {
            return;
        }
        let mut active = 0;
        let mut error = 0;
        for status in state.statuses.values() {
            match status {
                TemplateStatus::Active => active += 1,
                TemplateStatus::Error => error += 1,
            }
        }
        self.templates
            .get_or_create(&StatusLabels {
                status: TemplateStatus::Active,
            })
            .set(active);
        self.templates
            .get_or_create(&StatusLabels {
                status: TemplateStatus::Error,
            })
            .set(error);
        state.dirty = false;
    }

    #[cfg(test)]
    pub(crate) fn template_status(&self, name: &str) -> Option<TemplateStatus> {
        self.state.lock().statuses.get(name).copied()
    }

    #[cfg(test)]
    fn gauge_value(&self, status: TemplateStatus) -> i64 {
        self.templates.get_or_create(&StatusLabels { status }).get()
    }

    #[cfg(test)]
    fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }
}

/// Gauges owned by the watch manager.
#[derive(Debug, Default)]
pub struct WatchMetrics {
    watched: Gauge,
    intended: Gauge,
}

impl WatchMetrics {
    pub fn register(registry: &mut Registry) -> Arc<Self> {
        let metrics = Arc::new(Self::default());
        registry.register(
            "watched_kinds",
            "Number of kinds with a realized watch",
            metrics.watched.clone(),
        );
        registry.register(
            "intended_kinds",
            "Number of kinds some registrar intends to watch",
            metrics.intended.clone(),
        );
        metrics
    }

    pub fn set_watched(&self, count: usize) {
        self.watched.set(count as i64);
    }

    pub fn set_intended(&self, count: usize) {
        self.intended.set(count as i64);
    }

    #[cfg(test)]
    pub(crate) fn watched_value(&self) -> i64 {
        self.watched.get()
    }
}
