use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::key::{Interner, KeyId};
use crate::metrics::{MetricHandle, MetricKind, MetricStorage};
use crate::query::Query;
use crate::tags::TagSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricId(u32);

#[derive(Debug)]
struct MetricDef {
    name: KeyId,
    kind: MetricKind,
}

/// Thread-safe store of named metrics, each partitioned into tagged series.
///
/// Writers obtain a [`MetricHandle`] per series and update it without further locking of the
/// registry. Readers use [`Registry::query`].
#[derive(Debug, Default)]
pub struct Registry {
    interner: Interner,
    defs: RwLock<Vec<MetricDef>>,
    storage: DashMap<MetricId, DashMap<TagSet, MetricStorage>>,
}

impl Registry {
    /// Registers a metric, returning the existing id if the name is already known.
    ///
    /// A name keeps the kind it was first registered with.
    pub fn register(&self, name: &str, kind: MetricKind) -> MetricId {
        let name_id = self.interner.get_or_intern(name);

        let mut defs = self.defs.write();
        if let Some(idx) = defs.iter().position(|d| d.name == name_id) {
            return MetricId(idx as u32);
        }

        let id = MetricId(defs.len() as u32);
        defs.push(MetricDef {
            name: name_id,
            kind,
        });
        self.storage.insert(id, DashMap::new());
        id
    }

    pub fn lookup_metric(&self, name: &str) -> Option<(MetricId, MetricKind)> {
        let name_id = self.interner.get(name)?;
        let defs = self.defs.read();
        defs.iter()
            .position(|d| d.name == name_id)
            .map(|idx| (MetricId(idx as u32), defs[idx].kind))
    }

    pub fn metric_kind(&self, metric: MetricId) -> Option<MetricKind> {
        self.defs.read().get(metric.0 as usize).map(|d| d.kind)
    }

    pub fn resolve_key(&self, key: &str) -> KeyId {
        self.interner.get_or_intern(key)
    }

    /// Like [`Registry::resolve_key`] but never interns; `None` means no series can carry it.
    pub fn lookup_key(&self, key: &str) -> Option<KeyId> {
        self.interner.get(key)
    }

    pub fn resolve_key_id(&self, id: KeyId) -> Option<Arc<str>> {
        self.interner.resolve(id)
    }

    pub fn resolve_tags(&self, tags: &[(&str, &str)]) -> TagSet {
        let mut resolved: Vec<(KeyId, KeyId)> = tags
            .iter()
            .map(|(k, v)| (self.resolve_key(k), self.resolve_key(v)))
            .collect();
        resolved.sort_unstable();
        resolved.dedup_by_key(|(k, _)| *k);
        TagSet::from_sorted_iter(resolved)
    }

    pub fn get_handle(&self, metric: MetricId, tags: TagSet) -> Option<MetricHandle> {
        {
            let series_map = self.storage.get(&metric)?;
            if let Some(storage) = series_map.get(&tags) {
                return Some(storage.handle());
            }
        }

        // `defs` must not be locked while a storage shard is held; `register` takes them in
        // the opposite order.
        let kind = self.metric_kind(metric)?;
        let series_map = self.storage.get(&metric)?;
        let storage = series_map
            .entry(tags)
            .or_insert_with(|| MetricStorage::new(kind));
        Some(storage.handle())
    }

    pub fn query(&self, metric: MetricId) -> Query<'_> {
        Query::new(self, metric)
    }

    pub(crate) fn visit_series(&self, metric: MetricId, mut f: impl FnMut(&TagSet, &MetricStorage)) {
        let Some(series_map) = self.storage.get(&metric) else {
            return;
        };
        for series in series_map.iter() {
            f(series.key(), series.value());
        }
    }
}
