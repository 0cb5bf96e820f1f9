// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Keyed mutual exclusion.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

/// One mutex per key, created on first use.
///
/// Multi-key critical sections lock keys in ascending order, so two callers
/// asking for the same keys in opposite order cannot deadlock.
#[derive(Debug)]
pub(crate) struct LockTable<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Ord + Copy> LockTable<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Runs `f` while holding the locks of every key in `keys`.
    pub(crate) fn with_locked<R>(&self, keys: &[K], f: impl FnOnce() -> R) -> R {
        let mut keys = keys.to_vec();
        keys.sort_unstable();
        keys.dedup();

        // Clone the handles out first: no DashMap shard guard may be held while blocking on a key.
        let handles: Vec<Arc<Mutex<()>>> = keys
            .iter()
            .map(|key| Arc::clone(&self.locks.entry(*key).or_default()))
            .collect();
        let _guards: Vec<_> = handles.iter().map(|handle| handle.lock()).collect();
        f()
    }
}
