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

//! The lock manager.
//!
//! Locks are two-mode (shared / exclusive), keyed by the entity they protect
//! and held until the owning transaction finishes. A transaction that cannot
//! be granted a lock parks on a condvar; the wait is bounded by the lock
//! timeout and by the transaction deadline, and the wait-for graph is checked
//! before parking. When a cycle is found, the youngest transaction in the
//! cycle is aborted.
//!
//! A transaction may also be *doomed* from the outside (deadlock victim,
//! deadline sweep). Dooming releases the transaction's locks immediately so
//! that others can make progress; the owner observes the verdict at its next
//! operation. This is safe because writes are buffered in the transaction's
//! patch and reach the backend only at commit.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::trace;
use smallvec::SmallVec;

use crate::error::{ConflictCause, StoreError};
use crate::txn::TxnId;

/// An entity protected by a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// An object payload, by raw object id.
    Object(u64),
    /// A name binding.
    Binding(String),
    /// A store metadata row.
    Meta(Vec<u8>),
}

/// Lock access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Multiple transactions may hold the lock for reading.
    Shared,
    /// A single transaction holds the lock for writing.
    Exclusive,
}

#[derive(Debug, Default)]
struct LockEntry {
    holders: SmallVec<[(TxnId, LockMode); 2]>,
}

#[derive(Debug, Default)]
struct TableInner {
    entries: HashMap<LockKey, LockEntry>,
    held: HashMap<TxnId, HashSet<LockKey>>,
    /// The lock each blocked transaction is currently waiting for.
    wants: HashMap<TxnId, (LockKey, LockMode)>,
    doomed: HashMap<TxnId, StoreError>,
    conflicts: u64,
    deadlocks: u64,
}

/// The process-wide lock table of a store.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    inner: Mutex<TableInner>,
    cv: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `key` in `mode` on behalf of `txn`, blocking while the lock
    /// is held incompatibly by other transactions.
    ///
    /// The wait is bounded by `lock_timeout` and by `txn_deadline`; expiry of
    /// the former is a retryable conflict, expiry of the latter a transaction
    /// timeout. Re-acquiring a held lock is a no-op; acquiring `Exclusive`
    /// over an own `Shared` hold upgrades it.
    pub fn acquire(
        &self,
        txn: TxnId,
        key: &LockKey,
        mode: LockMode,
        lock_timeout: Duration,
        txn_deadline: Instant,
    ) -> Result<(), StoreError> {
        let wait_deadline = Instant::now() + lock_timeout;
        let deadline = wait_deadline.min(txn_deadline);

        let mut inner = self.inner.lock().expect("lock table poisoned");
        loop {
            if let Some(err) = inner.doomed.remove(&txn) {
                inner.wants.remove(&txn);
                return Err(err);
            }

            if Self::grantable(&inner, txn, key, mode) {
                inner.wants.remove(&txn);
                Self::grant(&mut inner, txn, key, mode);
                return Ok(());
            }

            inner.wants.insert(txn, (key.clone(), mode));
            if let Some(victim) = Self::find_deadlock_victim(&inner, txn) {
                inner.deadlocks += 1;
                if victim == txn {
                    inner.wants.remove(&txn);
                    trace!("{} is a deadlock victim waiting for {:?}", txn, key);
                    return Err(StoreError::Conflict(ConflictCause::Deadlock));
                }
                trace!("dooming deadlock victim {} on behalf of {}", victim, txn);
                Self::doom_locked(&mut inner, victim, StoreError::Conflict(ConflictCause::Deadlock));
                self.cv.notify_all();
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                inner.wants.remove(&txn);
                inner.conflicts += 1;
                return Err(if now >= txn_deadline {
                    StoreError::Timeout
                } else {
                    StoreError::Conflict(ConflictCause::LockTimeout)
                });
            }
            let (guard, _) = self
                .cv
                .wait_timeout(inner, deadline - now)
                .expect("lock table poisoned");
            inner = guard;
        }
    }

    /// Marks `txn` aborted with `err` and releases its locks so that other
    /// transactions can make progress. The owner observes `err` at its next
    /// operation. Returns `false` if the transaction was already doomed, in
    /// which case the earlier verdict is kept.
    pub fn doom(&self, txn: TxnId, err: StoreError) -> bool {
        let mut inner = self.inner.lock().expect("lock table poisoned");
        if inner.doomed.contains_key(&txn) {
            return false;
        }
        Self::doom_locked(&mut inner, txn, err);
        self.cv.notify_all();
        true
    }

    /// Takes the doom verdict for `txn`, if one is pending.
    pub fn take_doom(&self, txn: TxnId) -> Option<StoreError> {
        let mut inner = self.inner.lock().expect("lock table poisoned");
        inner.doomed.remove(&txn)
    }

    /// Releases all locks of `txn` and forgets any bookkeeping about it.
    pub fn finish(&self, txn: TxnId) {
        let mut inner = self.inner.lock().expect("lock table poisoned");
        Self::release_all_locked(&mut inner, txn);
        inner.wants.remove(&txn);
        inner.doomed.remove(&txn);
        self.cv.notify_all();
    }

    pub fn conflicts(&self) -> u64 {
        self.inner.lock().expect("lock table poisoned").conflicts
    }

    pub fn deadlocks(&self) -> u64 {
        self.inner.lock().expect("lock table poisoned").deadlocks
    }

    fn grantable(inner: &TableInner, txn: TxnId, key: &LockKey, mode: LockMode) -> bool {
        let entry = match inner.entries.get(key) {
            Some(entry) => entry,
            None => return true,
        };
        match mode {
            LockMode::Shared => entry
                .holders
                .iter()
                .all(|&(holder, held)| holder == txn || held == LockMode::Shared),
            LockMode::Exclusive => entry.holders.iter().all(|&(holder, _)| holder == txn),
        }
    }

    fn grant(inner: &mut TableInner, txn: TxnId, key: &LockKey, mode: LockMode) {
        let entry = inner.entries.entry(key.clone()).or_default();
        match entry.holders.iter_mut().find(|(holder, _)| *holder == txn) {
            Some((_, held)) => {
                if mode == LockMode::Exclusive {
                    *held = LockMode::Exclusive;
                }
            }
            None => entry.holders.push((txn, mode)),
        }
        inner.held.entry(txn).or_default().insert(key.clone());
    }

    /// Transactions that block `waiter`'s pending request.
    fn blockers(inner: &TableInner, waiter: TxnId) -> SmallVec<[TxnId; 4]> {
        let mut blockers = SmallVec::new();
        if let Some((key, mode)) = inner.wants.get(&waiter) {
            if let Some(entry) = inner.entries.get(key) {
                for &(holder, held) in &entry.holders {
                    if holder == waiter {
                        continue;
                    }
                    let blocks = match mode {
                        LockMode::Shared => held == LockMode::Exclusive,
                        LockMode::Exclusive => true,
                    };
                    if blocks {
                        blockers.push(holder);
                    }
                }
            }
        }
        blockers
    }

    /// Looks for a wait-for cycle through `start`; if one exists, returns the
    /// youngest transaction in the cycle (transaction ids are monotonic, so
    /// the largest id is the youngest).
    fn find_deadlock_victim(inner: &TableInner, start: TxnId) -> Option<TxnId> {
        let mut visited = HashSet::new();
        let mut cycle = Vec::new();
        if Self::search(inner, start, start, &mut visited, &mut cycle) {
            cycle.iter().copied().max()
        } else {
            None
        }
    }

    fn search(
        inner: &TableInner,
        node: TxnId,
        target: TxnId,
        visited: &mut HashSet<TxnId>,
        cycle: &mut Vec<TxnId>,
    ) -> bool {
        if !visited.insert(node) {
            return false;
        }
        for next in Self::blockers(inner, node) {
            if next == target || Self::search(inner, next, target, visited, cycle) {
                cycle.push(node);
                return true;
            }
        }
        false
    }

    fn doom_locked(inner: &mut TableInner, txn: TxnId, err: StoreError) {
        Self::release_all_locked(inner, txn);
        inner.doomed.entry(txn).or_insert(err);
    }

    fn release_all_locked(inner: &mut TableInner, txn: TxnId) {
        let keys = match inner.held.remove(&txn) {
            Some(keys) => keys,
            None => return,
        };
        for key in keys {
            let empty = match inner.entries.get_mut(&key) {
                Some(entry) => {
                    entry.holders.retain(|&mut (holder, _)| holder != txn);
                    entry.holders.is_empty()
                }
                None => false,
            };
            if empty {
                inner.entries.remove(&key);
            }
        }
    }
}
