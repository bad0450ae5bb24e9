use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Interned string id used for metric names, tag keys and tag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u32);

impl From<u32> for KeyId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<KeyId> for u32 {
    fn from(v: KeyId) -> Self {
        v.0
    }
}

#[derive(Default, Debug)]
pub struct Interner {
    map: RwLock<AHashMap<Arc<str>, u32>>,
    vec: RwLock<Vec<Arc<str>>>,
}

impl Interner {
    pub fn get_or_intern(&self, s: &str) -> KeyId {
        if let Some(id) = self.get(s) {
            return id;
        }

        let mut map = self.map.write();
        let mut vec = self.vec.write();

        // Another writer may have won the race between the read and write lock.
        if let Some(&id) = map.get(s) {
            return KeyId(id);
        }

        let id = vec.len() as u32;
        let s: Arc<str> = Arc::from(s);
        vec.push(s.clone());
        map.insert(s, id);

        KeyId(id)
    }

    /// Looks up an already interned string without allocating a new id.
    pub fn get(&self, s: &str) -> Option<KeyId> {
        self.map.read().get(s).map(|&id| KeyId(id))
    }

    pub fn resolve(&self, id: KeyId) -> Option<Arc<str>> {
        self.vec.read().get(id.0 as usize).cloned()
    }
}
