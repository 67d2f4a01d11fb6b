use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::MapDirection;

struct CacheEntry {
    value: Value,
    inserted: Instant,
}

/// LRU cache for mapped payloads, keyed by a canonical hash of the input plus
/// the mapping direction.
///
/// Callers must not hand credential-bearing objects to the cache; keys are
/// derived from the full payload.
pub struct MappingCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<u64, CacheEntry>,
    order: VecDeque<u64>,
}

impl MappingCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn key(input: &Value, direction: MapDirection) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        direction.hash(&mut hasher);
        hash_value(input, &mut hasher);
        hasher.finish()
    }

    pub fn get(&mut self, key: u64) -> Option<Value> {
        let expired = match self.entries.get(&key) {
            Some(entry) => entry.inserted.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(&key);
            self.order.retain(|existing| *existing != key);
            return None;
        }
        // Refresh recency.
        self.order.retain(|existing| *existing != key);
        self.order.push_back(key);
        self.entries.get(&key).map(|entry| entry.value.clone())
    }

    pub fn insert(&mut self, key: u64, value: Value) {
        if self.entries.contains_key(&key) {
            self.order.retain(|existing| *existing != key);
        } else if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted: Instant::now(),
            },
        );
        self.order.push_back(key);
    }

    /// Drops every entry older than the TTL; intended for a periodic sweep.
    pub fn purge_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted.elapsed() <= ttl);
        let live: std::collections::HashSet<u64> = self.entries.keys().copied().collect();
        self.order.retain(|key| live.contains(key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Order-insensitive structural hash: object keys are visited sorted, so two
/// JSON texts with reordered keys share a cache slot.
fn hash_value<H: Hasher>(value: &Value, hasher: &mut H) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(flag) => {
            1u8.hash(hasher);
            flag.hash(hasher);
        }
        Value::Number(number) => {
            2u8.hash(hasher);
            number.to_string().hash(hasher);
        }
        Value::String(text) => {
            3u8.hash(hasher);
            text.hash(hasher);
        }
        Value::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
        Value::Object(map) => {
            5u8.hash(hasher);
            map.len().hash(hasher);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(hasher);
                hash_value(&map[key], hasher);
            }
        }
    }
}
