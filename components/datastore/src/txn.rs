// Copyright 2020 The Darkstar Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transaction bookkeeping for the store.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::patch::Patch;

/// Monotonically increasing transaction identifier.
///
/// Ids are never reused within one store lifetime, so the ordering of ids is
/// the age ordering of transactions: the larger id is the younger
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(u64);

impl TxnId {
    #[cfg(test)]
    pub(crate) fn for_tests(raw: u64) -> Self {
        TxnId(raw)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// A handle to a registered transaction, scoped to one store.
///
/// The handle is a plain capability: all operations go through
/// [`DataStore`](crate::DataStore) methods that take it as an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnHandle {
    id: TxnId,
}

impl TxnHandle {
    /// The transaction identifier.
    pub fn id(&self) -> TxnId {
        self.id
    }
}

impl fmt::Display for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

/// Lifecycle of a transaction inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnPhase {
    Active,
    Prepared { read_only: bool },
}

#[derive(Debug)]
pub(crate) struct TxnRecord {
    pub deadline: Instant,
    pub phase: TxnPhase,
    pub patch: Patch,
}

/// Registry of live transactions. Guarded by a single mutex in the store.
#[derive(Debug, Default)]
pub(crate) struct TxnRegistry {
    next_id: u64,
    records: HashMap<TxnId, TxnRecord>,
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, timeout: Duration) -> TxnHandle {
        self.next_id += 1;
        let id = TxnId(self.next_id);
        let record = TxnRecord {
            deadline: Instant::now() + timeout,
            phase: TxnPhase::Active,
            patch: Patch::new(),
        };
        self.records.insert(id, record);
        TxnHandle { id }
    }

    pub fn get(&self, id: TxnId) -> Option<&TxnRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: TxnId) -> Option<&mut TxnRecord> {
        self.records.get_mut(&id)
    }

    pub fn remove(&mut self, id: TxnId) -> Option<TxnRecord> {
        self.records.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ids of active transactions whose deadline has passed.
    pub fn expired(&self, now: Instant) -> Vec<TxnId> {
        self.records
            .iter()
            .filter(|(_, record)| record.phase == TxnPhase::Active && now >= record.deadline)
            .map(|(&id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let mut registry = TxnRegistry::new();
        let a = registry.begin(Duration::from_secs(1));
        let b = registry.begin(Duration::from_secs(1));
        assert!(a.id() < b.id());
    }

    #[test]
    fn expired_reports_only_overdue_active_txns() {
        let mut registry = TxnRegistry::new();
        let stale = registry.begin(Duration::from_millis(0));
        let fresh = registry.begin(Duration::from_secs(60));
        let prepared = registry.begin(Duration::from_millis(0));
        registry.get_mut(prepared.id()).unwrap().phase = TxnPhase::Prepared { read_only: false };

        let expired = registry.expired(Instant::now() + Duration::from_millis(1));
        assert!(expired.contains(&stale.id()));
        assert!(!expired.contains(&fresh.id()));
        assert!(!expired.contains(&prepared.id()));
    }
}
