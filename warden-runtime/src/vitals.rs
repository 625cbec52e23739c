use ahash::AHashMap;
use kube::core::GroupVersionKind;
use parking_lot::RwLock;

use crate::{gvk_set::GvkSet, watch::EventSink};

/// Per-kind bookkeeping: which registrars intend to watch a kind,
/// and the sink each one wants events delivered to.
#[derive(Clone, Debug, Default)]
pub struct WatchVitals {
    registrars: AHashMap<String, EventSink>,
}

impl WatchVitals {
    #[must_use]
    pub fn with(registrar: &str, sink: EventSink) -> Self {
        let mut vitals = Self::default();
        vitals.registrars.insert(registrar.to_string(), sink);
        vitals
    }

    #[must_use]
    pub fn registrar_count(&self) -> usize {
        self.registrars.len()
    }

    #[must_use]
    pub fn has_registrar(&self, name: &str) -> bool {
        self.registrars.contains_key(name)
    }

    pub fn insert(&mut self, registrar: &str, sink: EventSink) {
        self.registrars.insert(registrar.to_string(), sink);
    }

    pub fn remove(&mut self, registrar: &str) {
        self.registrars.remove(registrar);
    }

    /// Snapshot of `(registrar, sink)` pairs for fan-out.
    #[must_use]
    pub fn sinks(&self) -> Vec<(String, EventSink)> {
        self.registrars
            .iter()
            .map(|(name, sink)| (name.clone(), sink.clone()))
            .collect()
    }

    fn merge(&mut self, other: &WatchVitals) {
        for (name, sink) in &other.registrars {
            self.registrars.insert(name.clone(), sink.clone());
        }
    }
}

/// Intent map over all registrars: `registrar → {kind → vitals}`.
///
/// This records what registrars *want*; the watch manager separately
/// tracks what is realized. Mutators clone their inputs, so callers
/// are free to reuse the maps they pass in.
#[derive(Debug, Default)]
pub struct VitalsRegistry {
    inner: RwLock<AHashMap<String, AHashMap<GroupVersionKind, WatchVitals>>>,
}

impl VitalsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a partial intent map into `parent`'s intents.
    pub fn update(&self, parent: &str, partial: &AHashMap<GroupVersionKind, WatchVitals>) {
        let mut inner = self.inner.write();
        let intents = inner.entry(parent.to_string()).or_default();
        for (gvk, vitals) in partial {
            intents
                .entry(gvk.clone())
                .or_default()
                .merge(vitals);
        }
    }

    /// Record a single `(parent, kind)` intent.
    pub fn intend(&self, parent: &str, gvk: &GroupVersionKind, sink: EventSink) {
        let partial = AHashMap::from_iter([(gvk.clone(), WatchVitals::with(parent, sink))]);
        self.update(parent, &partial);
    }

    /// Replace all of `parent`'s intents with `roster`.
    pub fn replace_roster(&self, parent: &str, roster: &AHashMap<GroupVersionKind, WatchVitals>) {
        let mut inner = self.inner.write();
        inner.insert(parent.to_string(), roster.clone());
    }

    /// Drop one `(parent, kind)` intent.
    pub fn remove(&self, parent: &str, gvk: &GroupVersionKind) {
        let mut inner = self.inner.write();
        if let Some(intents) = inner.get_mut(parent) {
            intents.remove(gvk);
            if intents.is_empty() {
                inner.remove(parent);
            }
        }
    }

    /// Merged view across registrars: for each kind, the union of
    /// every registrar that intends to watch it.
    #[must_use]
    pub fn get(&self) -> AHashMap<GroupVersionKind, WatchVitals> {
        let inner = self.inner.read();
        let mut merged: AHashMap<GroupVersionKind, WatchVitals> = AHashMap::new();
        for intents in inner.values() {
            for (gvk, vitals) in intents {
                merged.entry(gvk.clone()).or_default().merge(vitals);
            }
        }
        merged
    }

    /// The merged key set of [`VitalsRegistry::get`].
    #[must_use]
    pub fn get_gvks(&self) -> GvkSet {
        let inner = self.inner.read();
        inner
            .values()
            .flat_map(|intents| intents.keys().cloned())
            .collect()
    }

    /// The kinds a single registrar currently intends to watch.
    #[must_use]
    pub fn roster(&self, parent: &str) -> GvkSet {
        let inner = self.inner.read();
        inner
            .get(parent)
            .map(|intents| intents.keys().cloned().collect())
            .unwrap_or_default()
    }
}
