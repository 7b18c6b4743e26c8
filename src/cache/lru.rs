//! LRU (Least Recently Used) tracking

use std::collections::{HashMap, VecDeque};

/// LRU order tracker with lazy invalidation
///
/// Every touch appends a fresh `(key, generation)` record; records whose
/// generation no longer matches are skipped when popping.
pub struct LruCache<K: Clone + Eq + std::hash::Hash> {
    /// Access records (front = oldest)
    order: VecDeque<(K, u64)>,
    /// Current generation of each live key
    generations: HashMap<K, u64>,
    /// Generation counter
    generation: u64,
}

impl<K: Clone + Eq + std::hash::Hash> LruCache<K> {
    /// Create a new LRU tracker
    pub fn new() -> Self {
        LruCache {
            order: VecDeque::new(),
            generations: HashMap::new(),
            generation: 0,
        }
    }

    fn record(&mut self, key: K) {
        self.generation += 1;
        self.generations.insert(key.clone(), self.generation);
        self.order.push_back((key, self.generation));

        if self.order.len() > 2 * self.generations.len() + 16 {
            self.compact();
        }
    }

    /// Insert a new item (as most recently used)
    pub fn insert(&mut self, key: K) {
        self.record(key);
    }

    /// Touch an item (mark as recently used)
    pub fn touch(&mut self, key: &K) {
        if self.generations.contains_key(key) {
            self.record(key.clone());
        }
    }

    /// Remove an item
    pub fn remove(&mut self, key: &K) {
        self.generations.remove(key);
    }

    /// Pop the least recently used item
    pub fn pop_oldest(&mut self) -> Option<K> {
        while let Some((key, gen)) = self.order.pop_front() {
            if self.generations.get(&key) == Some(&gen) {
                self.generations.remove(&key);
                return Some(key);
            }
        }
        None
    }

    /// Drop stale access records
    fn compact(&mut self) {
        let generations = &self.generations;
        self.order
            .retain(|(key, gen)| generations.get(key) == Some(gen));
    }
}

impl<K: Clone + Eq + std::hash::Hash> Default for LruCache<K> {
    fn default() -> Self {
        Self::new()
    }
}
