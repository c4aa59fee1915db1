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

//! The transactional object store.
//!
//! A [`DataStore`] persists object payloads keyed by [`ObjectId`] and name
//! bindings keyed by UTF-8 names, with serializable isolation. Every
//! operation runs under a transaction registered with
//! [`begin`](DataStore::begin): reads take shared locks, writes take
//! exclusive locks, and all locks are held to the end of the transaction.
//! Writes are buffered in the transaction's [`Patch`] and reach the
//! [`Backend`] atomically at commit, so a transaction always observes its own
//! writes and never anyone's uncommitted ones.
//!
//! The store also keeps a registry of class descriptors in its metadata
//! keyspace, assigning a small integer id to each distinct descriptor so that
//! object payloads do not embed descriptor bytes. Descriptor rows are
//! append-only; reading them takes no locks, while assignment is serialized
//! on the counter row and committed (or discarded) with the assigning
//! transaction.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use serde_derive::{Deserialize, Serialize};

use crate::backends::{Backend, Snapshot};
use crate::error::StoreError;
use crate::keys::BinaryKey;
use crate::lock::{LockKey, LockMode, LockTable};
use crate::patch::{Change, MergeIter, Patch};
use crate::scheduler::{ScheduledHandle, Scheduler};
use crate::txn::{TxnHandle, TxnPhase, TxnRegistry};
use crate::values::BinaryValue;
use crate::Result;

/// Keyspace holding object payloads keyed by big-endian object id.
pub const OBJECTS: &str = "objects";
/// Keyspace holding name bindings keyed by UTF-8 name.
pub const BINDINGS: &str = "bindings";
/// Keyspace holding store metadata: id allocation and the class registry.
pub const META: &str = "meta";

const NEXT_ID_BLOCK: &[u8] = b"id.next_block";
const CLASS_DESC_PREFIX: &[u8] = b"class.d.";
const CLASS_ID_PREFIX: &[u8] = b"class.i.";
const CLASS_NEXT: &[u8] = b"class.next";

const POISONED: &str = "store state poisoned";

/// Identifier of a stored object.
///
/// Ids are 64-bit, positive, assigned monotonically by the store and never
/// reused, even across restarts and aborted transactions. Zero is not a
/// valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Creates an id from its raw representation; `None` for zero.
    pub fn new(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(ObjectId(raw))
        }
    }

    /// The raw numeric value of the id.
    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn key_bytes(self) -> Vec<u8> {
        BinaryKey::to_bytes(&self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BinaryValue for ObjectId {
    fn to_bytes(&self) -> Vec<u8> {
        BinaryValue::to_bytes(&self.0)
    }

    fn from_bytes(bytes: Cow<'_, [u8]>) -> anyhow::Result<Self> {
        let raw = u64::from_bytes(bytes)?;
        ObjectId::new(raw).ok_or_else(|| anyhow::anyhow!("zero is not a valid object id"))
    }
}

/// Outcome of the first phase of two-phase commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepare {
    /// The transaction took no write locks; commit is a no-op and may be
    /// skipped by the coordinator.
    ReadOnly,
    /// The transaction has writes staged for commit.
    Prepared,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Deadline applied to every transaction at `begin`.
    pub txn_timeout: Duration,
    /// How long a transaction waits for a contended lock before giving up
    /// with a retryable conflict.
    pub lock_timeout: Duration,
    /// Period of the background sweep that reaps transactions past their
    /// deadline.
    pub sweep_interval: Duration,
    /// How long `shutdown` waits for in-flight transactions to drain.
    pub shutdown_timeout: Duration,
    /// Number of object ids claimed from the backend at a time.
    pub id_block_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            txn_timeout: Duration::from_secs(1),
            lock_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(10),
            id_block_size: 1024,
        }
    }
}

/// Point-in-time operational counters of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Transactions currently registered.
    pub active_txns: usize,
    /// Transactions committed since the store was opened.
    pub committed: u64,
    /// Transactions aborted since the store was opened.
    pub aborted: u64,
    /// Lock waits that expired with a retryable conflict.
    pub conflicts: u64,
    /// Deadlock victims picked by the lock manager.
    pub deadlocks: u64,
    /// Transactions reaped past their deadline.
    pub timeouts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorePhase {
    Open,
    Draining,
    Closed,
}

#[derive(Debug)]
struct IdAllocator {
    next: u64,
    block_end: u64,
}

struct Inner {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
    locks: LockTable,
    txns: Mutex<TxnRegistry>,
    drain_cv: Condvar,
    phase: Mutex<StorePhase>,
    ids: Mutex<IdAllocator>,
    committed: AtomicU64,
    aborted: AtomicU64,
    timeouts: AtomicU64,
    sweep: Mutex<Option<Box<dyn ScheduledHandle>>>,
}

impl Inner {
    /// Dooms transactions whose deadline has passed, releasing their locks.
    fn sweep(&self) {
        let expired = self.txns.lock().expect(POISONED).expired(Instant::now());
        for id in expired {
            if self.locks.doom(id, StoreError::Timeout) {
                trace!("reaped {} past its deadline", id);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// The transactional object store used by the data service.
///
/// Cloning the store is cheap and yields another handle to the same
/// underlying state.
#[derive(Clone)]
pub struct DataStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for DataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStore").finish()
    }
}

impl DataStore {
    /// Opens a store over the given backend, recovering the id-allocation
    /// high-water mark, and schedules the deadline sweep with `scheduler`.
    pub fn open(
        backend: Arc<dyn Backend>,
        config: StoreConfig,
        scheduler: &dyn Scheduler,
    ) -> Result<Self> {
        let next = match backend.get(META, NEXT_ID_BLOCK) {
            Some(bytes) => {
                let value = u64::from_bytes(Cow::Owned(bytes))
                    .map_err(|err| StoreError::Corrupt(format!("bad id allocation row: {}", err)))?;
                if value == 0 {
                    return Err(StoreError::Corrupt("id allocation row is zero".to_owned()));
                }
                value
            }
            None => 1,
        };

        let inner = Arc::new(Inner {
            backend,
            config: config.clone(),
            locks: LockTable::new(),
            txns: Mutex::new(TxnRegistry::new()),
            drain_cv: Condvar::new(),
            phase: Mutex::new(StorePhase::Open),
            ids: Mutex::new(IdAllocator {
                next,
                block_end: next,
            }),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            sweep: Mutex::new(None),
        });

        let sweeper = Arc::downgrade(&inner);
        let handle = scheduler.schedule_recurring(
            Box::new(move || {
                if let Some(inner) = sweeper.upgrade() {
                    inner.sweep();
                }
            }),
            config.sweep_interval,
        );
        *inner.sweep.lock().expect(POISONED) = Some(handle);

        info!("opened data store; next object id {}", next);
        Ok(DataStore { inner })
    }

    /// Registers a new transaction and returns a handle scoped to it.
    pub fn begin(&self) -> Result<TxnHandle> {
        let phase = self.inner.phase.lock().expect(POISONED);
        match *phase {
            StorePhase::Open => {}
            StorePhase::Draining => return Err(StoreError::ShuttingDown),
            StorePhase::Closed => return Err(StoreError::ShutDown),
        }
        let mut txns = self.inner.txns.lock().expect(POISONED);
        let handle = txns.begin(self.inner.config.txn_timeout);
        trace!("begin {}", handle);
        Ok(handle)
    }

    /// Allocates an object id that was never allocated before and will never
    /// be allocated again, even across restarts.
    ///
    /// Allocation is independent of the outcome of `txn`: ids handed to an
    /// aborted transaction are simply discarded, never reused.
    pub fn allocate_id(&self, txn: TxnHandle) -> Result<ObjectId> {
        self.check_active(txn)?;
        let mut ids = self.inner.ids.lock().expect(POISONED);
        if ids.next == ids.block_end {
            let block_end = ids
                .next
                .checked_add(self.inner.config.id_block_size)
                .ok_or_else(|| StoreError::Corrupt("object id space exhausted".to_owned()))?;
            let mut patch = Patch::new();
            patch.put(META, NEXT_ID_BLOCK.to_vec(), BinaryValue::to_bytes(&block_end));
            self.inner.backend.apply(patch)?;
            debug!("claimed object id block {}..{}", ids.next, block_end);
            ids.block_end = block_end;
        }
        let id = ObjectId(ids.next);
        ids.next += 1;
        trace!("{} allocated object id {}", txn, id);
        Ok(id)
    }

    /// Returns the payload of the object, taking a shared lock, or an
    /// exclusive lock when `for_update` is set.
    pub fn get_object(&self, txn: TxnHandle, id: ObjectId, for_update: bool) -> Result<Vec<u8>> {
        let deadline = self.check_active(txn)?;
        let mode = if for_update {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        self.lock(txn, LockKey::Object(id.get()), mode, deadline)?;
        match self.read_merged(txn, OBJECTS, &id.key_bytes())? {
            Some(payload) => Ok(payload),
            None => Err(StoreError::ObjectNotFound(id)),
        }
    }

    /// Stages a write of the object payload, upgrading to an exclusive lock
    /// if needed.
    pub fn put_object(&self, txn: TxnHandle, id: ObjectId, payload: Vec<u8>) -> Result<()> {
        let deadline = self.check_active(txn)?;
        self.lock(txn, LockKey::Object(id.get()), LockMode::Exclusive, deadline)?;
        self.with_record(txn, |record| {
            record.patch.put(OBJECTS, id.key_bytes(), payload);
            Ok(())
        })
    }

    /// Stages removal of the object. Subsequent reads of `id` within `txn`
    /// fail with [`StoreError::ObjectNotFound`], as do reads in transactions
    /// that begin after `txn` commits.
    pub fn remove_object(&self, txn: TxnHandle, id: ObjectId) -> Result<()> {
        let deadline = self.check_active(txn)?;
        self.lock(txn, LockKey::Object(id.get()), LockMode::Exclusive, deadline)?;
        if self.read_merged(txn, OBJECTS, &id.key_bytes())?.is_none() {
            return Err(StoreError::ObjectNotFound(id));
        }
        self.with_record(txn, |record| {
            record.patch.delete(OBJECTS, id.key_bytes());
            Ok(())
        })
    }

    /// Returns the object id bound to `name`.
    pub fn get_binding(&self, txn: TxnHandle, name: &str) -> Result<ObjectId> {
        let deadline = self.check_active(txn)?;
        self.lock(txn, LockKey::Binding(name.to_owned()), LockMode::Shared, deadline)?;
        match self.read_merged(txn, BINDINGS, &name.to_bytes())? {
            Some(bytes) => decode_object_id(&bytes),
            None => Err(StoreError::NameNotBound(name.to_owned())),
        }
    }

    /// Binds `name` to `id`, replacing any previous binding.
    pub fn set_binding(&self, txn: TxnHandle, name: &str, id: ObjectId) -> Result<()> {
        let deadline = self.check_active(txn)?;
        self.lock(txn, LockKey::Binding(name.to_owned()), LockMode::Exclusive, deadline)?;
        self.with_record(txn, |record| {
            record.patch.put(BINDINGS, name.to_bytes(), id.to_bytes());
            Ok(())
        })
    }

    /// Unbinds `name`. The object the name was bound to is not touched.
    pub fn remove_binding(&self, txn: TxnHandle, name: &str) -> Result<()> {
        let deadline = self.check_active(txn)?;
        self.lock(txn, LockKey::Binding(name.to_owned()), LockMode::Exclusive, deadline)?;
        if self.read_merged(txn, BINDINGS, &name.to_bytes())?.is_none() {
            return Err(StoreError::NameNotBound(name.to_owned()));
        }
        self.with_record(txn, |record| {
            record.patch.delete(BINDINGS, name.to_bytes());
            Ok(())
        })
    }

    /// Returns the smallest bound name lexicographically greater than
    /// `name`, or `None` if there is none.
    ///
    /// The answer merges the transaction's own binding changes over a
    /// backend snapshot taken for this call.
    pub fn next_bound_name(&self, txn: TxnHandle, name: &str) -> Result<Option<String>> {
        let deadline = self.check_active(txn)?;
        // The smallest key strictly greater than `name` in key order.
        let mut from = name.to_bytes();
        from.push(0);

        let next = {
            let snapshot = self.inner.backend.snapshot();
            let txns = self.inner.txns.lock().expect(POISONED);
            let record = match txns.get(txn.id()) {
                Some(record) => record,
                None => return Err(StoreError::NotActive),
            };
            let changes = record
                .patch
                .changes(BINDINGS)
                .map(|changes| changes.range_from(&from));
            let mut iter = MergeIter::new(snapshot.iter(BINDINGS, &from), changes);
            match crate::backends::Iterator::next(&mut iter) {
                Some((key, _)) => Some(String::from_utf8(key.to_vec()).map_err(|_| {
                    StoreError::Corrupt("binding name is not valid UTF-8".to_owned())
                })?),
                None => None,
            }
        };
        if let Some(ref next) = next {
            self.lock(txn, LockKey::Binding(next.clone()), LockMode::Shared, deadline)?;
        }
        Ok(next)
    }

    /// Returns the class id assigned to `descriptor`, assigning a fresh one
    /// under `txn` on first encounter. The boolean is `true` when the id was
    /// newly assigned; such an id becomes permanent only if `txn` commits.
    pub fn get_class_id(&self, txn: TxnHandle, descriptor: &[u8]) -> Result<(u32, bool)> {
        let deadline = self.check_active(txn)?;
        let desc_key = [CLASS_DESC_PREFIX, descriptor].concat();
        if let Some(raw) = self.read_merged(txn, META, &desc_key)? {
            return Ok((decode_class_id(&raw)?, false));
        }

        // Serialize assignment on the counter row; the lock is held to the
        // end of the transaction, so a concurrent assigner blocks here until
        // the winner commits and then finds the committed row.
        self.lock(txn, LockKey::Meta(CLASS_NEXT.to_vec()), LockMode::Exclusive, deadline)?;
        if let Some(raw) = self.read_merged(txn, META, &desc_key)? {
            return Ok((decode_class_id(&raw)?, false));
        }

        let next = match self.read_merged(txn, META, CLASS_NEXT)? {
            Some(raw) => decode_class_id(&raw)?,
            None => 1,
        };
        let successor = next
            .checked_add(1)
            .ok_or_else(|| StoreError::Corrupt("class id space exhausted".to_owned()))?;
        let id_key = [CLASS_ID_PREFIX, &BinaryKey::to_bytes(&next)[..]].concat();
        self.with_record(txn, |record| {
            record.patch.put(META, desc_key, BinaryValue::to_bytes(&next));
            record.patch.put(META, id_key, descriptor.to_vec());
            record
                .patch
                .put(META, CLASS_NEXT.to_vec(), BinaryValue::to_bytes(&successor));
            Ok(())
        })?;
        trace!("{} assigned class id {}", txn, next);
        Ok((next, true))
    }

    /// Returns the descriptor bytes registered under `class_id`, or `None`
    /// for an id that was never assigned.
    pub fn get_class_descriptor(&self, txn: TxnHandle, class_id: u32) -> Result<Option<Vec<u8>>> {
        self.check_active(txn)?;
        let id_key = [CLASS_ID_PREFIX, &BinaryKey::to_bytes(&class_id)[..]].concat();
        self.read_merged(txn, META, &id_key)
    }

    /// Runs the first phase of two-phase commit.
    ///
    /// A transaction with no staged writes reports [`Prepare::ReadOnly`] and
    /// releases its locks immediately; the later commit is a no-op.
    pub fn prepare(&self, txn: TxnHandle) -> Result<Prepare> {
        if let Some(err) = self.inner.locks.take_doom(txn.id()) {
            self.finalize_abort(txn);
            return Err(err);
        }

        enum Verdict {
            ReadOnly,
            Written,
            TimedOut,
        }

        let verdict = {
            let mut txns = self.inner.txns.lock().expect(POISONED);
            let record = match txns.get_mut(txn.id()) {
                Some(record) => record,
                None => return Err(StoreError::NotActive),
            };
            if record.phase != TxnPhase::Active {
                return Err(StoreError::NotActive);
            }
            if Instant::now() >= record.deadline {
                Verdict::TimedOut
            } else {
                let read_only = record.patch.is_empty();
                record.phase = TxnPhase::Prepared { read_only };
                if read_only {
                    Verdict::ReadOnly
                } else {
                    Verdict::Written
                }
            }
        };

        match verdict {
            Verdict::TimedOut => {
                self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
                self.finalize_abort(txn);
                Err(StoreError::Timeout)
            }
            Verdict::ReadOnly => {
                // No writes were taken: the read locks can go right away.
                self.inner.locks.finish(txn.id());
                trace!("{} prepared read-only", txn);
                Ok(Prepare::ReadOnly)
            }
            Verdict::Written => {
                trace!("{} prepared", txn);
                Ok(Prepare::Prepared)
            }
        }
    }

    /// Makes the transaction's writes durable and releases its locks.
    ///
    /// Committing a transaction that has already finished is a no-op, which
    /// makes commit after a read-only prepare idempotent. A transaction that
    /// is still `Active` is prepared and committed in one step.
    pub fn commit(&self, txn: TxnHandle) -> Result<()> {
        if let Some(err) = self.inner.locks.take_doom(txn.id()) {
            self.finalize_abort(txn);
            return Err(err);
        }

        let patch = {
            let mut txns = self.inner.txns.lock().expect(POISONED);
            match txns.remove(txn.id()) {
                None => return Ok(()),
                Some(record) => record.patch,
            }
        };
        self.inner.drain_cv.notify_all();

        let result = if patch.is_empty() {
            Ok(())
        } else {
            self.inner.backend.apply(patch)
        };
        self.inner.locks.finish(txn.id());
        match result {
            Ok(()) => {
                self.inner.committed.fetch_add(1, Ordering::Relaxed);
                trace!("{} committed", txn);
                Ok(())
            }
            Err(err) => {
                self.inner.aborted.fetch_add(1, Ordering::Relaxed);
                warn!("{} failed to commit: {}", txn, err);
                Err(err)
            }
        }
    }

    /// Discards the transaction's writes and releases its locks. Aborting a
    /// transaction that has already finished is a no-op.
    pub fn abort(&self, txn: TxnHandle) -> Result<()> {
        self.inner.locks.take_doom(txn.id());
        let removed = {
            let mut txns = self.inner.txns.lock().expect(POISONED);
            txns.remove(txn.id()).is_some()
        };
        if removed {
            self.inner.drain_cv.notify_all();
            self.inner.locks.finish(txn.id());
            self.inner.aborted.fetch_add(1, Ordering::Relaxed);
            trace!("{} aborted", txn);
        }
        Ok(())
    }

    /// Blocks new transactions and waits for in-flight ones to settle.
    ///
    /// Returns `true` on a clean drain. If the wait is cut short by the
    /// shutdown timeout, the store goes back to accepting transactions and
    /// `false` is returned, so the caller may retry.
    pub fn shutdown(&self) -> Result<bool> {
        {
            let mut phase = self.inner.phase.lock().expect(POISONED);
            match *phase {
                StorePhase::Closed => return Err(StoreError::AlreadyShutDown),
                StorePhase::Draining => return Err(StoreError::ShuttingDown),
                StorePhase::Open => *phase = StorePhase::Draining,
            }
        }
        info!("shutting down the data store");

        let deadline = Instant::now() + self.inner.config.shutdown_timeout;
        let mut txns = self.inner.txns.lock().expect(POISONED);
        while !txns.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .inner
                .drain_cv
                .wait_timeout(txns, deadline - now)
                .expect(POISONED);
            txns = guard;
        }
        let in_flight = txns.len();
        drop(txns);

        let mut phase = self.inner.phase.lock().expect(POISONED);
        if in_flight == 0 {
            *phase = StorePhase::Closed;
            drop(phase);
            if let Some(handle) = self.inner.sweep.lock().expect(POISONED).take() {
                handle.cancel();
            }
            info!("data store shut down cleanly");
            Ok(true)
        } else {
            *phase = StorePhase::Open;
            warn!(
                "data store shutdown interrupted; {} transaction(s) still in flight",
                in_flight
            );
            Ok(false)
        }
    }

    /// Returns current operational counters.
    pub fn stats(&self) -> Stats {
        Stats {
            active_txns: self.inner.txns.lock().expect(POISONED).len(),
            committed: self.inner.committed.load(Ordering::Relaxed),
            aborted: self.inner.aborted.load(Ordering::Relaxed),
            conflicts: self.inner.locks.conflicts(),
            deadlocks: self.inner.locks.deadlocks(),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Validates that `txn` is registered and active, delivering any pending
    /// doom verdict, and returns the transaction deadline for lock waits.
    fn check_active(&self, txn: TxnHandle) -> Result<Instant> {
        if let Some(err) = self.inner.locks.take_doom(txn.id()) {
            self.finalize_abort(txn);
            return Err(err);
        }
        let deadline = {
            let txns = self.inner.txns.lock().expect(POISONED);
            match txns.get(txn.id()) {
                None => return Err(StoreError::NotActive),
                Some(record) => {
                    if record.phase != TxnPhase::Active {
                        return Err(StoreError::NotActive);
                    }
                    record.deadline
                }
            }
        };
        if Instant::now() >= deadline {
            self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
            self.finalize_abort(txn);
            return Err(StoreError::Timeout);
        }
        Ok(deadline)
    }

    fn lock(&self, txn: TxnHandle, key: LockKey, mode: LockMode, deadline: Instant) -> Result<()> {
        self.inner
            .locks
            .acquire(txn.id(), &key, mode, self.inner.config.lock_timeout, deadline)
    }

    /// Reads `key`, observing the transaction's own staged changes first.
    fn read_merged(&self, txn: TxnHandle, keyspace: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txns = self.inner.txns.lock().expect(POISONED);
        let record = match txns.get(txn.id()) {
            Some(record) => record,
            None => return Err(StoreError::NotActive),
        };
        Ok(match record.patch.get(keyspace, key) {
            Some(Change::Put(value)) => Some(value.clone()),
            Some(Change::Delete) => None,
            None => self.inner.backend.get(keyspace, key),
        })
    }

    fn with_record<R>(
        &self,
        txn: TxnHandle,
        action: impl FnOnce(&mut crate::txn::TxnRecord) -> Result<R>,
    ) -> Result<R> {
        let mut txns = self.inner.txns.lock().expect(POISONED);
        match txns.get_mut(txn.id()) {
            Some(record) => action(record),
            None => Err(StoreError::NotActive),
        }
    }

    fn finalize_abort(&self, txn: TxnHandle) {
        {
            let mut txns = self.inner.txns.lock().expect(POISONED);
            txns.remove(txn.id());
        }
        self.inner.drain_cv.notify_all();
        self.inner.locks.finish(txn.id());
        self.inner.aborted.fetch_add(1, Ordering::Relaxed);
    }
}

fn decode_object_id(bytes: &[u8]) -> Result<ObjectId> {
    ObjectId::from_bytes(Cow::Borrowed(bytes))
        .map_err(|err| StoreError::Corrupt(format!("bad binding row: {}", err)))
}

fn decode_class_id(bytes: &[u8]) -> Result<u32> {
    u32::from_bytes(Cow::Borrowed(bytes))
        .map_err(|err| StoreError::Corrupt(format!("bad class registry row: {}", err)))
}
