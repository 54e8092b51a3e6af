// Copyright 2024 The Mirrorlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use lru::LruCache;
use parking_lot::Mutex;

/// Values stored in a [`SizedLruCache`] report a cheap estimate of how much
/// memory they occupy. The estimate only has to be stable for a given value,
/// not exact.
pub trait SizedValue {
    fn size(&self) -> u64;
}

struct State<V> {
    lru: LruCache<String, V>,
    sum_size: u64,
}

/// A fixed-capacity map from string key to value. Eviction is strict
/// least-recently-used on access and insert; the summed value sizes never
/// exceed `max_size`. Each cache carries its own lock so instances can be
/// shared freely across tasks.
pub struct SizedLruCache<V: SizedValue> {
    state: Mutex<State<V>>,
    max_size: u64,
}

impl<V: SizedValue + Clone> SizedLruCache<V> {
    pub fn new(max_size: u64) -> Self {
        Self {
            state: Mutex::new(State {
                lru: LruCache::unbounded(),
                sum_size: 0,
            }),
            max_size,
        }
    }

    /// Returns a clone of the cached value and promotes the key.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock();
        state.lru.get(key).cloned()
    }

    pub fn set(&self, key: &str, value: V) {
        let mut state = self.state.lock();
        let new_size = value.size();
        if let Some(old) = state.lru.put(key.to_string(), value) {
            state.sum_size -= old.size();
        }
        state.sum_size += new_size;
        while state.sum_size > self.max_size {
            let Some((_, evicted)) = state.lru.pop_lru() else {
                break;
            };
            state.sum_size -= evicted.size();
        }
    }

    /// Removing a key that is not present is a no-op; invalidations may
    /// arrive for objects that were never loaded.
    pub fn delete(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(old) = state.lru.pop(key) {
            state.sum_size -= old.size();
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.sum_size = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().lru.is_empty()
    }

    pub fn sum_size(&self) -> u64 {
        self.state.lock().sum_size
    }
}
