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

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use crate::{
    Backend, BinaryValue, ConflictCause, DataStore, MemoryDb, ObjectId, Prepare, StoreConfig,
    StoreError, ThreadScheduler,
};

fn quick_config() -> StoreConfig {
    StoreConfig {
        txn_timeout: Duration::from_secs(5),
        lock_timeout: Duration::from_millis(40),
        sweep_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_millis(200),
        id_block_size: 8,
    }
}

fn open(backend: &Arc<MemoryDb>, config: StoreConfig) -> DataStore {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend: Arc<dyn Backend> = Arc::clone(backend) as Arc<dyn Backend>;
    DataStore::open(backend, config, &ThreadScheduler::new()).unwrap()
}

fn store() -> DataStore {
    open(&Arc::new(MemoryDb::new()), quick_config())
}

#[test]
fn object_round_trip() {
    let store = store();

    let txn = store.begin().unwrap();
    let id = store.allocate_id(txn).unwrap();
    store.put_object(txn, id, b"payload".to_vec()).unwrap();
    // Read-your-writes before commit.
    assert_eq!(store.get_object(txn, id, false).unwrap(), b"payload".to_vec());
    store.commit(txn).unwrap();

    let txn = store.begin().unwrap();
    assert_eq!(store.get_object(txn, id, false).unwrap(), b"payload".to_vec());
    store.commit(txn).unwrap();
}

#[test]
fn missing_object_is_reported() {
    let store = store();
    let txn = store.begin().unwrap();
    let id = ObjectId::new(777).unwrap();
    assert_eq!(
        store.get_object(txn, id, false).unwrap_err(),
        StoreError::ObjectNotFound(id)
    );
    store.abort(txn).unwrap();
}

#[test]
fn removed_object_is_a_tombstone() {
    let store = store();

    let txn = store.begin().unwrap();
    let id = store.allocate_id(txn).unwrap();
    store.put_object(txn, id, b"gone soon".to_vec()).unwrap();
    store.commit(txn).unwrap();

    let txn = store.begin().unwrap();
    store.remove_object(txn, id).unwrap();
    // Removed earlier in the same transaction.
    assert_eq!(
        store.get_object(txn, id, false).unwrap_err(),
        StoreError::ObjectNotFound(id)
    );
    store.commit(txn).unwrap();

    // Removed by a prior committed transaction.
    let txn = store.begin().unwrap();
    assert_eq!(
        store.get_object(txn, id, true).unwrap_err(),
        StoreError::ObjectNotFound(id)
    );
    assert_eq!(
        store.remove_object(txn, id).unwrap_err(),
        StoreError::ObjectNotFound(id)
    );
    store.abort(txn).unwrap();
}

#[test]
fn binding_round_trip() {
    let store = store();
    let txn = store.begin().unwrap();
    let id = store.allocate_id(txn).unwrap();
    store.set_binding(txn, "a.counter", id).unwrap();
    assert_eq!(store.get_binding(txn, "a.counter").unwrap(), id);
    store.commit(txn).unwrap();

    let txn = store.begin().unwrap();
    assert_eq!(store.get_binding(txn, "a.counter").unwrap(), id);
    store.remove_binding(txn, "a.counter").unwrap();
    assert_eq!(
        store.get_binding(txn, "a.counter").unwrap_err(),
        StoreError::NameNotBound("a.counter".to_owned())
    );
    assert_eq!(
        store.remove_binding(txn, "a.counter").unwrap_err(),
        StoreError::NameNotBound("a.counter".to_owned())
    );
    store.commit(txn).unwrap();
}

#[test]
fn next_bound_name_merges_own_changes() {
    let store = store();

    let txn = store.begin().unwrap();
    let id = store.allocate_id(txn).unwrap();
    store.set_binding(txn, "a.a", id).unwrap();
    store.set_binding(txn, "a.c", id).unwrap();
    store.commit(txn).unwrap();

    let txn = store.begin().unwrap();
    store.set_binding(txn, "a.b", id).unwrap();
    store.remove_binding(txn, "a.c").unwrap();

    assert_eq!(store.next_bound_name(txn, "").unwrap(), Some("a.a".to_owned()));
    assert_eq!(store.next_bound_name(txn, "a.a").unwrap(), Some("a.b".to_owned()));
    assert_eq!(store.next_bound_name(txn, "a.b").unwrap(), None);
    store.abort(txn).unwrap();
}

#[test]
fn uncommitted_write_blocks_readers() {
    let store = store();

    let writer = store.begin().unwrap();
    let id = store.allocate_id(writer).unwrap();
    store.put_object(writer, id, b"draft".to_vec()).unwrap();

    let reader = store.begin().unwrap();
    let err = store.get_object(reader, id, false).unwrap_err();
    assert_eq!(err, StoreError::Conflict(ConflictCause::LockTimeout));
    store.abort(reader).unwrap();

    store.commit(writer).unwrap();
    assert!(store.stats().conflicts > 0);
}

#[test]
fn read_only_prepare_and_idempotent_commit() {
    let store = store();
    let txn = store.begin().unwrap();
    let id = store.allocate_id(txn).unwrap();
    store.put_object(txn, id, b"x".to_vec()).unwrap();
    store.commit(txn).unwrap();

    let txn = store.begin().unwrap();
    store.get_object(txn, id, false).unwrap();
    assert_eq!(store.prepare(txn).unwrap(), Prepare::ReadOnly);
    store.commit(txn).unwrap();
    // Commit is idempotent on a read-only transaction.
    store.commit(txn).unwrap();
}

#[test]
fn prepare_then_commit_persists_writes() {
    let store = store();
    let txn = store.begin().unwrap();
    let id = store.allocate_id(txn).unwrap();
    store.put_object(txn, id, b"two-phase".to_vec()).unwrap();
    assert_eq!(store.prepare(txn).unwrap(), Prepare::Prepared);
    // Data operations are rejected once the transaction is prepared.
    assert_eq!(
        store.get_object(txn, id, false).unwrap_err(),
        StoreError::NotActive
    );
    store.commit(txn).unwrap();

    let txn = store.begin().unwrap();
    assert_eq!(store.get_object(txn, id, false).unwrap(), b"two-phase".to_vec());
    store.commit(txn).unwrap();
}

#[test]
fn aborted_writes_vanish() {
    let store = store();
    let txn = store.begin().unwrap();
    let id = store.allocate_id(txn).unwrap();
    store.put_object(txn, id, b"ephemeral".to_vec()).unwrap();
    store.abort(txn).unwrap();

    assert_eq!(
        store.get_object(txn, id, false).unwrap_err(),
        StoreError::NotActive
    );

    let txn = store.begin().unwrap();
    assert_eq!(
        store.get_object(txn, id, false).unwrap_err(),
        StoreError::ObjectNotFound(id)
    );
    store.abort(txn).unwrap();
}

#[test]
fn ids_stay_unique_across_reopen() {
    let backend = Arc::new(MemoryDb::new());
    let mut seen = BTreeSet::new();

    {
        let store = open(&backend, quick_config());
        let txn = store.begin().unwrap();
        for _ in 0..20 {
            assert!(seen.insert(store.allocate_id(txn).unwrap()));
        }
        // Ids handed to an aborted transaction are discarded, not reused.
        store.abort(txn).unwrap();
        store.shutdown().unwrap();
    }

    let store = open(&backend, quick_config());
    let txn = store.begin().unwrap();
    let max_seen = *seen.iter().next_back().unwrap();
    for _ in 0..20 {
        let id = store.allocate_id(txn).unwrap();
        assert!(id > max_seen);
        assert!(seen.insert(id));
    }
    store.commit(txn).unwrap();
}

#[test]
fn overdue_transaction_times_out() {
    let mut config = quick_config();
    config.txn_timeout = Duration::from_millis(30);
    let store = open(&Arc::new(MemoryDb::new()), config);

    let txn = store.begin().unwrap();
    thread::sleep(Duration::from_millis(80));
    let err = store.get_object(txn, ObjectId::new(1).unwrap(), false).unwrap_err();
    assert_eq!(err, StoreError::Timeout);
    assert!(store.stats().timeouts > 0);
}

#[test]
fn sweep_frees_locks_of_stalled_transactions() {
    let mut config = quick_config();
    config.txn_timeout = Duration::from_millis(40);
    config.lock_timeout = Duration::from_secs(1);
    let store = open(&Arc::new(MemoryDb::new()), config);

    let setup = store.begin().unwrap();
    let id = store.allocate_id(setup).unwrap();
    store.put_object(setup, id, b"v".to_vec()).unwrap();
    store.commit(setup).unwrap();

    // A stalled writer holds the exclusive lock past its deadline.
    let stalled = store.begin().unwrap();
    store.put_object(stalled, id, b"w".to_vec()).unwrap();
    thread::sleep(Duration::from_millis(100));

    // The sweep has doomed the stalled writer, so a newcomer gets the lock.
    let txn = store.begin().unwrap();
    assert_eq!(store.get_object(txn, id, false).unwrap(), b"v".to_vec());
    store.commit(txn).unwrap();

    assert_eq!(store.commit(stalled).unwrap_err(), StoreError::Timeout);
}

#[test]
fn concurrent_increments_serialize() {
    const THREADS: u64 = 2;
    const INCREMENTS: u64 = 50;

    let store = store();
    let setup = store.begin().unwrap();
    let id = store.allocate_id(setup).unwrap();
    store
        .put_object(setup, id, BinaryValue::to_bytes(&0_u64))
        .unwrap();
    store.commit(setup).unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    loop {
                        let txn = store.begin().unwrap();
                        let result = store
                            .get_object(txn, id, true)
                            .and_then(|bytes| {
                                let value = u64::from_bytes(Cow::Owned(bytes))
                                    .expect("stored counter is well-formed");
                                store.put_object(txn, id, BinaryValue::to_bytes(&(value + 1)))
                            })
                            .and_then(|_| store.commit(txn));
                        match result {
                            Ok(()) => break,
                            Err(err) if err.is_retryable() => {
                                store.abort(txn).unwrap();
                            }
                            Err(err) => panic!("unexpected error: {}", err),
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let txn = store.begin().unwrap();
    let bytes = store.get_object(txn, id, false).unwrap();
    assert_eq!(u64::from_bytes(Cow::Owned(bytes)).unwrap(), THREADS * INCREMENTS);
    store.commit(txn).unwrap();
}

#[test]
fn shutdown_drains_and_seals_the_store() {
    let store = store();

    let busy = store.begin().unwrap();
    let id = store.allocate_id(busy).unwrap();
    store.put_object(busy, id, b"wip".to_vec()).unwrap();

    // An in-flight transaction outlives the shutdown budget.
    assert_eq!(store.shutdown().unwrap(), false);

    store.commit(busy).unwrap();
    assert_eq!(store.shutdown().unwrap(), true);

    assert_eq!(store.begin().unwrap_err(), StoreError::ShutDown);
    assert_eq!(store.shutdown().unwrap_err(), StoreError::AlreadyShutDown);
}

#[test]
fn class_registry_assigns_and_reuses_ids() {
    let store = store();

    let txn = store.begin().unwrap();
    let (id, fresh) = store.get_class_id(txn, b"app.Player#1").unwrap();
    assert!(fresh);
    // Repeated lookup within the assigning transaction reuses the id.
    assert_eq!(store.get_class_id(txn, b"app.Player#1").unwrap(), (id, false));
    let (other, fresh) = store.get_class_id(txn, b"app.Room#1").unwrap();
    assert!(fresh);
    assert_ne!(id, other);
    store.commit(txn).unwrap();

    let txn = store.begin().unwrap();
    assert_eq!(store.get_class_id(txn, b"app.Player#1").unwrap(), (id, false));
    assert_eq!(
        store.get_class_descriptor(txn, id).unwrap(),
        Some(b"app.Player#1".to_vec())
    );
    assert_eq!(store.get_class_descriptor(txn, 10_000).unwrap(), None);
    store.commit(txn).unwrap();
}

#[test]
fn class_ids_do_not_survive_rollback() {
    let store = store();

    let txn = store.begin().unwrap();
    let (id, fresh) = store.get_class_id(txn, b"app.Doomed#1").unwrap();
    assert!(fresh);
    store.abort(txn).unwrap();

    let txn = store.begin().unwrap();
    assert_eq!(store.get_class_descriptor(txn, id).unwrap(), None);
    // The discarded id is handed out again to the next assignment.
    assert_eq!(store.get_class_id(txn, b"app.Other#1").unwrap(), (id, true));
    store.abort(txn).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn allocated_ids_are_unique_and_increasing(batches in prop::collection::vec((1_u64..20, any::<bool>()), 1..8)) {
        let store = store();
        let mut all = Vec::new();
        for (count, commit) in batches {
            let txn = store.begin().unwrap();
            for _ in 0..count {
                all.push(store.allocate_id(txn).unwrap());
            }
            if commit {
                store.commit(txn).unwrap();
            } else {
                store.abort(txn).unwrap();
            }
        }
        let unique: BTreeSet<_> = all.iter().copied().collect();
        prop_assert_eq!(unique.len(), all.len());
        let mut sorted = all.clone();
        sorted.sort();
        prop_assert_eq!(sorted, all);
    }
}

#[test]
fn binding_error_carries_the_name() {
    let store = store();
    let txn = store.begin().unwrap();
    assert_matches!(
        store.get_binding(txn, "a.nope").unwrap_err(),
        StoreError::NameNotBound(name) if name == "a.nope"
    );
    store.abort(txn).unwrap();
}
