use std::collections::HashMap;

struct Qcow2CacheEntry<V> {
    value: V,
    lru: usize,
    dirty: bool,
}

/// LRU cache for metadata table clusters (L2 tables, refcount blocks).
///
/// A counter stands in for a use timestamp, which is good enough for a
/// single context.  Dirty entries are never dropped silently: `put`
/// hands an evicted dirty victim back to the owner, who writes it out
/// before reusing the slot's backing cluster.
pub struct Qcow2Cache<V> {
    map: HashMap<usize, Qcow2CacheEntry<V>>,
    limit: usize,
    lru_timer: usize,
}

impl<V> Qcow2Cache<V> {
    pub fn new(limit: usize) -> Self {
        assert!(limit >= 1);
        Qcow2Cache {
            map: HashMap::new(),
            limit,
            lru_timer: 0,
        }
    }

    fn bump(timer: &mut usize, entry: &mut Qcow2CacheEntry<V>) {
        *timer += 1;
        entry.lru = *timer;
    }

    pub fn contains_key(&self, key: usize) -> bool {
        self.map.contains_key(&key)
    }

    pub fn get(&mut self, key: usize) -> Option<&V> {
        let timer = &mut self.lru_timer;
        self.map.get_mut(&key).map(|e| {
            Self::bump(timer, e);
            &e.value
        })
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut V> {
        let timer = &mut self.lru_timer;
        self.map.get_mut(&key).map(|e| {
            Self::bump(timer, e);
            &mut e.value
        })
    }

    /// Look up without touching the LRU order; used by flush paths.
    pub fn peek(&self, key: usize) -> Option<&V> {
        self.map.get(&key).map(|e| &e.value)
    }

    /// Insert `value`; if the cache is full, the least recently used
    /// entry is evicted and returned when dirty.
    pub fn put(&mut self, key: usize, value: V) -> Option<(usize, V)> {
        let mut victim = None;

        if !self.map.contains_key(&key) && self.map.len() >= self.limit {
            if let Some(old_key) = self.pop_lru_key() {
                let entry = self.map.remove(&old_key).unwrap();
                if entry.dirty {
                    log::warn!(
                        "cache eviction of dirty entry, key {} type {}",
                        old_key,
                        crate::helpers::qcow2_type_of(&entry.value)
                    );
                    victim = Some((old_key, entry.value));
                }
            }
        }

        self.lru_timer += 1;
        self.map.insert(
            key,
            Qcow2CacheEntry {
                value,
                lru: self.lru_timer,
                dirty: false,
            },
        );

        victim
    }

    fn pop_lru_key(&self) -> Option<usize> {
        self.map
            .iter()
            .min_by_key(|(_, e)| e.lru)
            .map(|(k, _)| *k)
    }

    pub fn set_dirty(&mut self, key: usize, dirty: bool) {
        if let Some(e) = self.map.get_mut(&key) {
            e.dirty = dirty;
        }
    }

    pub fn is_dirty(&self, key: usize) -> bool {
        self.map.get(&key).map(|e| e.dirty).unwrap_or(false)
    }

    /// Keys of all dirty entries, lowest first so flush writes in
    /// ascending file order.
    pub fn dirty_keys(&self) -> Vec<usize> {
        let mut keys: Vec<usize> = self
            .map
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(k, _)| *k)
            .collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
