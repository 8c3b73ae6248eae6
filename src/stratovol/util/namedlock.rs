/*
 * Copyright (C) 2025 The Stratovol Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Per-name mutual exclusion. Create/Mount/Unmount serialize on the volume
//! name they target, so operations on distinct volumes proceed concurrently
//! while a single volume sees at most one in-flight operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct NamedLocks {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `name`, creating it on first use. The entry is
    /// dropped from the registry once no guard or waiter references it.
    pub async fn lock(&self, name: &str) -> NamedLockGuard<'_> {
        let slot = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let permit = slot.lock_owned().await;
        NamedLockGuard {
            registry: self,
            name: name.to_string(),
            _permit: permit,
        }
    }

    fn release(&self, name: &str) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = entries.get(name) {
            // Registry entry plus the releasing guard's own handle: no
            // waiter holds a clone, so the entry can go.
            if Arc::strong_count(slot) == 2 {
                entries.remove(name);
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

pub struct NamedLockGuard<'a> {
    registry: &'a NamedLocks,
    name: String,
    _permit: OwnedMutexGuard<()>,
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.name);
    }
}
