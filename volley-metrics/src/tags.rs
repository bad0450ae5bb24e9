use crate::key::KeyId;
use smallvec::SmallVec;

/// Sorted `(key, value)` pairs identifying one series of a metric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagSet {
    // Most series carry scenario/step/method/status, so 4 inline slots avoid allocating.
    pub(crate) tags: SmallVec<[(KeyId, KeyId); 4]>,
}

impl TagSet {
    pub fn from_sorted_iter(iter: impl IntoIterator<Item = (KeyId, KeyId)>) -> Self {
        Self {
            tags: iter.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (KeyId, KeyId)> + '_ {
        self.tags.iter().copied()
    }

    pub fn get(&self, key: KeyId) -> Option<KeyId> {
        let slice: &[(KeyId, KeyId)] = &self.tags;
        let idx = slice.partition_point(|(k, _)| *k < key);
        slice.get(idx).and_then(|(k, v)| (*k == key).then_some(*v))
    }

    pub fn project(&self, keys: &[KeyId]) -> TagSet {
        let tags = keys
            .iter()
            .filter_map(|key| self.get(*key).map(|value| (*key, value)))
            .collect();
        TagSet { tags }
    }
}
