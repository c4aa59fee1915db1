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

//! Per-transaction context.
//!
//! The context caches every managed object the transaction has touched,
//! keyed by object id, together with its entry state (clean / dirty /
//! removed) and, when modification detection is on, the payload bytes seen
//! at first resolve. Identity is enforced by the cache: resolving the same
//! id twice yields the same handle, and a reverse index from handle identity
//! to id serves `create_reference` and `mark_for_update`.
//!
//! At prepare the context serializes its non-clean entries (plus clean ones
//! that fail the byte compare), writes them through the store, and runs the
//! store's own prepare. The context's lifetime equals its transaction's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, trace};

use darkstar_datastore::{DataStore, ObjectId, Prepare, TxnHandle};

use crate::data::classes::ClassesCatalog;
use crate::data::object::{decode_payload, encode_payload, ErasedCell, ErasedManaged, Managed, ManagedObject};
use crate::errors::DataError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Clean,
    Dirty,
    Removed,
}

struct CacheEntry {
    handle: Arc<dyn ErasedManaged>,
    state: EntryState,
    /// Created in this transaction; nothing to remove from the store if the
    /// object is dropped again before commit.
    fresh: bool,
    /// Payload bytes observed at first resolve, for modification detection.
    snapshot: Option<Vec<u8>>,
}

#[derive(Default)]
struct ContextState {
    cache: HashMap<ObjectId, CacheEntry>,
    by_identity: HashMap<usize, ObjectId>,
    op_count: u64,
}

pub(crate) struct ContextInner {
    pub(crate) txn: TxnHandle,
    store: DataStore,
    catalog: Arc<ClassesCatalog>,
    detect_modifications: bool,
    debug_check_interval: u32,
    state: Mutex<ContextState>,
    ended: AtomicBool,
}

impl ContextInner {
    pub fn new(
        txn: TxnHandle,
        store: DataStore,
        catalog: Arc<ClassesCatalog>,
        detect_modifications: bool,
        debug_check_interval: u32,
    ) -> Self {
        Self {
            txn,
            store,
            catalog,
            detect_modifications,
            debug_check_interval,
            state: Mutex::new(ContextState::default()),
            ended: AtomicBool::new(false),
        }
    }

    /// Whether the owning transaction has committed or aborted.
    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Resolves `id` into a managed object of type `T`, reading it from the
    /// store on a cache miss. `for_update` takes the exclusive lock and
    /// marks the entry dirty.
    pub fn resolve<T: ManagedObject>(
        &self,
        id: ObjectId,
        for_update: bool,
    ) -> Result<Managed<T>, DataError> {
        let mut state = self.lock_state();
        self.tick(&mut state);

        if let Some(entry) = state.cache.get_mut(&id) {
            if entry.state == EntryState::Removed {
                return Err(DataError::ObjectNotFound(id));
            }
            if for_update && entry.state == EntryState::Clean {
                // Upgrade the store lock before handing out the object.
                self.store.get_object(self.txn, id, true)?;
                entry.state = EntryState::Dirty;
                entry.snapshot = None;
            }
            return downcast::<T>(&entry.handle);
        }

        let payload = self.store.get_object(self.txn, id, for_update)?;
        let (class_id, body) = decode_payload(&payload)?;
        let descriptor = self.catalog.descriptor(self.txn, class_id)?;
        if descriptor != T::CLASS {
            return Err(DataError::TypeMismatch {
                expected: T::CLASS.to_string(),
                actual: descriptor.to_string(),
            });
        }
        let value = T::from_bytes(std::borrow::Cow::Borrowed(body))
            .map_err(|err| DataError::SerializationFormat(err.to_string()))?;
        let managed = Managed::new(value);

        let snapshot = if self.detect_modifications && !for_update {
            Some(body.to_vec())
        } else {
            None
        };
        state.by_identity.insert(managed.identity(), id);
        state.cache.insert(
            id,
            CacheEntry {
                handle: Arc::new(ErasedCell(managed.clone())),
                state: if for_update {
                    EntryState::Dirty
                } else {
                    EntryState::Clean
                },
                fresh: false,
                snapshot,
            },
        );
        trace!("{} resolved {} (for_update: {})", self.txn, id, for_update);
        Ok(managed)
    }

    /// Returns the id of `obj`, adopting it into the cache with a fresh id
    /// if it is transient.
    pub fn reference_for<T: ManagedObject>(&self, obj: &Managed<T>) -> Result<ObjectId, DataError> {
        let mut state = self.lock_state();
        self.tick(&mut state);

        if let Some(&id) = state.by_identity.get(&obj.identity()) {
            return Ok(id);
        }
        let id = self.store.allocate_id(self.txn)?;
        state.by_identity.insert(obj.identity(), id);
        state.cache.insert(
            id,
            CacheEntry {
                handle: Arc::new(ErasedCell(obj.clone())),
                state: EntryState::Dirty,
                fresh: true,
                snapshot: None,
            },
        );
        trace!("{} adopted new object as {}", self.txn, id);
        Ok(id)
    }

    /// Flips the cache entry of `obj` to dirty, upgrading the store lock.
    pub fn mark_for_update<T: ManagedObject>(&self, obj: &Managed<T>) -> Result<(), DataError> {
        let mut state = self.lock_state();
        self.tick(&mut state);

        let id = match state.by_identity.get(&obj.identity()) {
            Some(&id) => id,
            None => return Err(DataError::ObjectNotManaged),
        };
        let entry = state.cache.get_mut(&id).ok_or(DataError::ObjectNotManaged)?;
        match entry.state {
            EntryState::Removed => Err(DataError::ObjectNotFound(id)),
            EntryState::Dirty => Ok(()),
            EntryState::Clean => {
                self.store.get_object(self.txn, id, true)?;
                entry.state = EntryState::Dirty;
                entry.snapshot = None;
                Ok(())
            }
        }
    }

    /// Marks `obj` removed. The store's remove runs at prepare; within this
    /// transaction any further resolve of the id fails.
    pub fn remove<T: ManagedObject>(&self, obj: &Managed<T>) -> Result<(), DataError> {
        let mut state = self.lock_state();
        self.tick(&mut state);

        let id = match state.by_identity.get(&obj.identity()) {
            Some(&id) => id,
            None => return Err(DataError::ObjectNotManaged),
        };
        let entry = state.cache.get_mut(&id).ok_or(DataError::ObjectNotManaged)?;
        if entry.state == EntryState::Removed {
            return Err(DataError::ObjectNotFound(id));
        }
        entry.state = EntryState::Removed;
        entry.snapshot = None;
        trace!("{} scheduled removal of {}", self.txn, id);
        Ok(())
    }

    /// Looks up a binding, observing this transaction's writes.
    pub fn get_binding_id(&self, name: &str) -> Result<ObjectId, DataError> {
        self.count_op();
        Ok(self.store.get_binding(self.txn, name)?)
    }

    /// Binds `name` to `id`.
    pub fn set_binding_id(&self, name: &str, id: ObjectId) -> Result<(), DataError> {
        self.count_op();
        Ok(self.store.set_binding(self.txn, name, id)?)
    }

    /// Removes the binding of `name`; the object itself stays.
    pub fn remove_binding(&self, name: &str) -> Result<(), DataError> {
        self.count_op();
        Ok(self.store.remove_binding(self.txn, name)?)
    }

    /// The next bound name lexicographically greater than `name`.
    pub fn next_bound_name(&self, name: &str) -> Result<Option<String>, DataError> {
        self.count_op();
        Ok(self.store.next_bound_name(self.txn, name)?)
    }

    /// First phase of two-phase commit: flush the cache to the store, then
    /// run the store's prepare.
    pub fn prepare(&self) -> Result<Prepare, DataError> {
        let mut state = self.lock_state();

        let mut ids: Vec<ObjectId> = state.cache.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let entry = match state.cache.get_mut(&id) {
                Some(entry) => entry,
                None => continue,
            };
            match entry.state {
                EntryState::Clean => {
                    if self.detect_modifications {
                        let body = entry.handle.serialize();
                        if entry.snapshot.as_deref() != Some(&body[..]) {
                            trace!(
                                "{} detected a silently modified object {}; persisting it",
                                self.txn,
                                id
                            );
                            let class_id = self.catalog.class_id(self.txn, &entry.handle.class())?;
                            self.store
                                .put_object(self.txn, id, encode_payload(class_id, &body))?;
                        }
                    }
                }
                EntryState::Dirty => {
                    let body = entry.handle.serialize();
                    let class_id = self.catalog.class_id(self.txn, &entry.handle.class())?;
                    self.store
                        .put_object(self.txn, id, encode_payload(class_id, &body))?;
                }
                EntryState::Removed => {
                    if !entry.fresh {
                        self.store.remove_object(self.txn, id)?;
                    }
                }
            }
        }
        drop(state);

        Ok(self.store.prepare(self.txn)?)
    }

    /// Second phase: make the writes durable.
    pub fn commit(&self) -> Result<(), DataError> {
        let result = self.store.commit(self.txn);
        match &result {
            Ok(()) => self.catalog.note_commit(self.txn.id()),
            Err(_) => self.catalog.note_abort(self.txn.id()),
        }
        self.ended.store(true, Ordering::Release);
        Ok(result?)
    }

    /// Drops the transaction's writes.
    pub fn abort(&self) {
        if let Err(err) = self.store.abort(self.txn) {
            error!("{} failed to abort: {}", self.txn, err);
        }
        self.catalog.note_abort(self.txn.id());
        self.ended.store(true, Ordering::Release);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.state.lock().expect("context state poisoned")
    }

    fn count_op(&self) {
        let mut state = self.lock_state();
        self.tick(&mut state);
    }

    /// Advances the operation counter and, when the debug check interval is
    /// configured, verifies that every cached entry's id round-trips through
    /// the identity index.
    fn tick(&self, state: &mut ContextState) {
        state.op_count += 1;
        if self.debug_check_interval == 0
            || state.op_count % u64::from(self.debug_check_interval) != 0
        {
            return;
        }
        for (&id, entry) in &state.cache {
            let round_trip = state.by_identity.get(&entry.handle.identity()).copied();
            if round_trip != Some(id) {
                error!(
                    "{} reference table inconsistency: {} resolves to {:?}",
                    self.txn, id, round_trip
                );
                debug_assert!(false, "reference table inconsistency for {}", id);
            }
        }
    }
}

fn downcast<T: ManagedObject>(handle: &Arc<dyn ErasedManaged>) -> Result<Managed<T>, DataError> {
    match handle.as_any().downcast_ref::<Managed<T>>() {
        Some(managed) => Ok(managed.clone()),
        None => Err(DataError::TypeMismatch {
            expected: T::CLASS.to_string(),
            actual: handle.class().to_string(),
        }),
    }
}
