use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// A thread-safe destination for reducer output. The driver writes to it
/// concurrently from every reducer worker.
pub trait OutputSink<K, O>: Send + Sync {
    fn write(&self, key: K, value: O);
}

/// A mutex-guarded map sink. Writes for the same key keep the last value.
pub struct MapSink<K: Ord, O> {
    entries: Mutex<BTreeMap<K, O>>,
}

impl<K: Ord, O> Default for MapSink<K, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, O> MapSink<K, O> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Take the collected entries out of the sink.
    pub fn into_map(self) -> BTreeMap<K, O> {
        self.entries.into_inner().unwrap()
    }

    pub fn get(&self, key: &K) -> Option<O>
    where
        O: Clone,
    {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl<K: Ord + Send, O: Send> OutputSink<K, O> for MapSink<K, O> {
    fn write(&self, key: K, value: O) {
        self.entries.lock().unwrap().insert(key, value);
    }
}

/// The default shard assignment: a hash of the key, reduced modulo the
/// shard count. Pure and deterministic, so repeated runs of a job place
/// every key in the same shard.
pub fn default_shard<K: Hash>(key: &K, num_shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % num_shards as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_sink() {
        let sink = MapSink::new();
        sink.write("a", 1);
        sink.write("b", 2);
        sink.write("a", 3);
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.get(&"a"), Some(3));

        let map = sink.into_map();
        assert_eq!(map[&"a"], 3);
        assert_eq!(map[&"b"], 2);
    }

    #[test]
    fn test_default_shard_is_stable() {
        for key in 0..100 {
            let first = default_shard(&key, 7);
            assert!(first < 7);
            assert_eq!(first, default_shard(&key, 7));
        }
    }
}
