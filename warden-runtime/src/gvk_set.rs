use ahash::AHashSet;
use kube::core::GroupVersionKind;
use parking_lot::RwLock;

/// A concurrent set of group/version/kinds.
///
/// Single-owner mutable, many-reader safe. Iteration order is
/// unspecified; callers needing determinism should sort
/// [`GvkSet::items`] themselves.
#[derive(Debug, Default)]
pub struct GvkSet {
    inner: RwLock<AHashSet<GroupVersionKind>>,
}

impl GvkSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, gvk: &GroupVersionKind) -> bool {
        self.inner.read().contains(gvk)
    }

    pub fn add(&self, gvks: impl IntoIterator<Item = GroupVersionKind>) {
        let mut inner = self.inner.write();
        inner.extend(gvks);
    }

    pub fn remove<'a>(&self, gvks: impl IntoIterator<Item = &'a GroupVersionKind>) {
        let mut inner = self.inner.write();
        for gvk in gvks {
            inner.remove(gvk);
        }
    }

    /// Union `other` into this set.
    pub fn add_set(&self, other: &GvkSet) {
        self.add(other.items());
    }

    /// Remove every element of `other` from this set.
    pub fn remove_set(&self, other: &GvkSet) {
        let items = other.items();
        self.remove(items.iter());
    }

    /// Elements of `self` not present in `other`.
    #[must_use]
    pub fn difference(&self, other: &GvkSet) -> GvkSet {
        let other = other.inner.read();
        self.inner
            .read()
            .iter()
            .filter(|gvk| !other.contains(*gvk))
            .cloned()
            .collect()
    }

    /// Elements present in both sets.
    #[must_use]
    pub fn intersection(&self, other: &GvkSet) -> GvkSet {
        let other = other.inner.read();
        self.inner
            .read()
            .iter()
            .filter(|gvk| other.contains(*gvk))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn items(&self) -> Vec<GroupVersionKind> {
        self.inner.read().iter().cloned().collect()
    }

    /// Replace the contents with `other`'s, then invoke `callbacks`
    /// in order while still holding the write guard.
    ///
    /// Observers that depend on the post-replace contents can publish
    /// their signal from a callback and be certain no reader saw the
    /// old contents in between.
    pub fn replace(&self, other: &GvkSet, callbacks: &[&dyn Fn()]) {
        if std::ptr::eq(self, other) {
            let _guard = self.inner.write();
            for callback in callbacks {
                callback();
            }
            return;
        }
        let next = other.inner.read().clone();
        let mut inner = self.inner.write();
        *inner = next;
        for callback in callbacks {
            callback();
        }
    }
}

impl PartialEq for GvkSet {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        *self.inner.read() == *other.inner.read()
    }
}

impl Eq for GvkSet {}

impl Clone for GvkSet {
    fn clone(&self) -> Self {
        Self {
            inner: RwLock::new(self.inner.read().clone()),
        }
    }
}

impl FromIterator<GroupVersionKind> for GvkSet {
    fn from_iter<I: IntoIterator<Item = GroupVersionKind>>(iter: I) -> Self {
        Self {
            inner: RwLock::new(iter.into_iter().collect()),
        }
    }
}
