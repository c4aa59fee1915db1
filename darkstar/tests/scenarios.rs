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

//! End-to-end scenarios for the data service.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use darkstar::{
    ClassDescriptor, DataError, DataHooks, DataService, ErrorKind, HookedDataService, Managed,
    ManagedObject, ManagedRef, Participant, PrepareVote, ServiceConfig, ServiceHeader,
    ServiceState,
};
use darkstar_datastore::{Backend, BinaryValue, MemoryDb, ThreadScheduler};

#[derive(Debug, Clone, PartialEq)]
struct Counter {
    value: u64,
}

impl Counter {
    fn new(value: u64) -> Self {
        Self { value }
    }
}

impl BinaryValue for Counter {
    fn to_bytes(&self) -> Vec<u8> {
        self.value.to_le_bytes().to_vec()
    }

    fn from_bytes(bytes: Cow<'_, [u8]>) -> anyhow::Result<Self> {
        anyhow::ensure!(bytes.len() == 8, "invalid counter encoding");
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(Self {
            value: u64::from_le_bytes(raw),
        })
    }
}

impl ManagedObject for Counter {
    const CLASS: ClassDescriptor = ClassDescriptor::new("test.Counter", 1);
}

#[derive(Debug, Clone, PartialEq)]
struct Note {
    text: String,
}

impl BinaryValue for Note {
    fn to_bytes(&self) -> Vec<u8> {
        self.text.as_bytes().to_vec()
    }

    fn from_bytes(bytes: Cow<'_, [u8]>) -> anyhow::Result<Self> {
        Ok(Self {
            text: String::from_utf8(bytes.into_owned())?,
        })
    }
}

impl ManagedObject for Note {
    const CLASS: ClassDescriptor = ClassDescriptor::new("test.Note", 1);
}

fn service_over(backend: &Arc<MemoryDb>, tweak: impl FnOnce(&mut ServiceConfig)) -> DataService {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = ServiceConfig::new("scenarios");
    tweak(&mut config);
    let backend: Arc<dyn Backend> = Arc::clone(backend) as Arc<dyn Backend>;
    let service = DataService::new(config, backend, &ThreadScheduler::new()).unwrap();
    service.initialize().unwrap();
    service
}

fn service() -> DataService {
    service_over(&Arc::new(MemoryDb::new()), |_| {})
}

// S1: bind-lookup round trip across transactions.
#[test]
fn bind_lookup_round_trip() {
    let service = service();

    service
        .run_task(|| service.set_binding("k", &Managed::new(Counter::new(7))))
        .unwrap();

    let value = service
        .run_task(|| Ok(service.get_binding::<Counter>("k")?.read().value))
        .unwrap();
    assert_eq!(value, 7);
}

// Invariant 1: create_reference(o).get() is o within one transaction, and
// repeated resolves preserve identity.
#[test]
fn references_preserve_identity() {
    let service = service();

    service
        .run_task(|| {
            let object = Managed::new(Counter::new(1));
            let reference = service.create_reference(&object)?;
            assert!(reference.get()?.ptr_eq(&object));

            // A second reference to the same object carries the same id.
            let again = service.create_reference(&object)?;
            assert_eq!(reference, again);
            Ok(())
        })
        .unwrap();

    service
        .run_task(|| service.set_binding("identity", &Managed::new(Counter::new(2))))
        .unwrap();
    service
        .run_task(|| {
            let first = service.get_binding::<Counter>("identity")?;
            let second = service.get_binding::<Counter>("identity")?;
            assert!(first.ptr_eq(&second));
            Ok(())
        })
        .unwrap();
}

// Invariant 3: allocated ids are unique.
#[test]
fn reference_ids_are_unique() {
    let service = service();
    let mut seen = BTreeSet::new();
    for round in 0..5 {
        let ids = service
            .run_task(|| {
                let mut ids = Vec::new();
                for i in 0..10 {
                    let object = Managed::new(Counter::new(round * 100 + i));
                    ids.push(service.create_reference(&object)?.id());
                }
                Ok(ids)
            })
            .unwrap();
        for id in ids {
            assert!(seen.insert(id), "id {} was allocated twice", id);
        }
    }
}

// S2: enumeration visits application bindings in lexicographic order and
// never reveals service bindings (the version header is one).
#[test]
fn enumeration_order() {
    let service = service();

    for name in &["b", "a", "c"] {
        service
            .run_task(|| service.set_binding(name, &Managed::new(Counter::new(0))))
            .unwrap();
    }

    service
        .run_task(|| {
            assert_eq!(service.next_bound_name(None)?.as_deref(), Some("a"));
            assert_eq!(service.next_bound_name(Some("a"))?.as_deref(), Some("b"));
            assert_eq!(service.next_bound_name(Some("b"))?.as_deref(), Some("c"));
            assert_eq!(service.next_bound_name(Some("c"))?, None);
            Ok(())
        })
        .unwrap();

    // The service namespace enumerates independently and does contain the
    // header sentinel.
    service
        .run_task(|| {
            let mut names = Vec::new();
            let mut cursor = None;
            while let Some(name) = service.next_service_bound_name(cursor.as_deref())? {
                names.push(name.clone());
                cursor = Some(name);
            }
            assert_eq!(names, vec!["DataService.header".to_owned()]);
            Ok(())
        })
        .unwrap();
}

// The empty string is a valid binding name and sorts first.
#[test]
fn empty_binding_name_enumerates_first() {
    let service = service();

    service
        .run_task(|| {
            service.set_binding("", &Managed::new(Counter::new(1)))?;
            service.set_binding("x", &Managed::new(Counter::new(2)))
        })
        .unwrap();

    service
        .run_task(|| {
            assert_eq!(service.next_bound_name(None)?.as_deref(), Some(""));
            assert_eq!(service.next_bound_name(Some(""))?.as_deref(), Some("x"));
            assert_eq!(service.next_bound_name(Some("x"))?, None);
            Ok(())
        })
        .unwrap();
}

// S5 / invariant 6: a removed object faults on every further resolve, while
// the name binding survives.
#[test]
fn removed_object_faults() {
    let service = service();

    service
        .run_task(|| service.set_binding("k", &Managed::new(Counter::new(7))))
        .unwrap();

    service
        .run_task(|| {
            let object = service.get_binding::<Counter>("k")?;
            let reference = service.create_reference(&object)?;
            service.remove_object(&object)?;

            // The name is still bound, but the object behind it is gone.
            assert_matches!(
                service.get_binding::<Counter>("k"),
                Err(DataError::ObjectNotFound(_))
            );
            assert_matches!(reference.get(), Err(DataError::ObjectNotFound(_)));
            // Removing twice is a fault as well.
            assert_matches!(
                service.remove_object(&object),
                Err(DataError::ObjectNotFound(_))
            );
            Ok(())
        })
        .unwrap();

    // After commit the removal is visible to later transactions.
    let err = service
        .run_task(|| service.get_binding::<Counter>("k").map(drop))
        .unwrap_err();
    assert_matches!(err, DataError::ObjectNotFound(_));
}

// remove_binding leaves the object alive.
#[test]
fn remove_binding_keeps_the_object() {
    let service = service();

    let id = service
        .run_task(|| {
            let object = Managed::new(Counter::new(3));
            service.set_binding("k", &object)?;
            Ok(service.create_reference(&object)?.id())
        })
        .unwrap();

    service.run_task(|| service.remove_binding("k")).unwrap();

    service
        .run_task(|| {
            assert_matches!(
                service.get_binding::<Counter>("k"),
                Err(DataError::NameNotBound(name)) if name == "k"
            );
            let reference = service.reference_for_id::<Counter>(id.get())?;
            assert_eq!(reference.get()?.read().value, 3);
            Ok(())
        })
        .unwrap();
}

// Caller bugs: unmanaged objects and invalid ids.
#[test]
fn unmanaged_objects_are_rejected() {
    let service = service();
    service
        .run_task(|| {
            let transient = Managed::new(Counter::new(0));
            assert_matches!(
                service.mark_for_update(&transient),
                Err(DataError::ObjectNotManaged)
            );
            assert_matches!(
                service.remove_object(&transient),
                Err(DataError::ObjectNotManaged)
            );
            assert_matches!(
                service.reference_for_id::<Counter>(0),
                Err(DataError::InvalidId(0))
            );
            Ok(())
        })
        .unwrap();
}

#[test]
fn binding_type_is_checked() {
    let service = service();
    service
        .run_task(|| service.set_binding("typed", &Managed::new(Counter::new(1))))
        .unwrap();

    let err = service
        .run_task(|| service.get_binding::<Note>("typed").map(drop))
        .unwrap_err();
    assert_matches!(err, DataError::TypeMismatch { .. });
}

// References serialize as bare ids and resolve again in later transactions.
#[test]
fn references_serialize_as_ids() {
    let service = service();

    let bytes = service
        .run_task(|| {
            let object = Managed::new(Counter::new(42));
            service.set_binding("kept", &object)?;
            let reference = service.create_reference(&object)?;
            Ok(reference.to_bytes())
        })
        .unwrap();
    assert_eq!(bytes.len(), 8);

    let value = service
        .run_task(|| {
            let reference = ManagedRef::<Counter>::from_bytes(Cow::Borrowed(&bytes))
                .map_err(|err| DataError::SerializationFormat(err.to_string()))?;
            Ok(reference.get()?.read().value)
        })
        .unwrap();
    assert_eq!(value, 42);
}

// Dereferencing outside any transaction is rejected.
#[test]
fn dereference_outside_transaction_fails() {
    let service = service();

    let reference = service
        .run_task(|| {
            let object = Managed::new(Counter::new(1));
            service.set_binding("out", &object)?;
            service.create_reference(&object)
        })
        .unwrap();

    assert_matches!(reference.get(), Err(DataError::TransactionNotActive));
    assert_matches!(
        reference.get_for_update(),
        Err(DataError::TransactionNotActive)
    );
}

// Invariant 8: with modification detection on, silent mutations are
// persisted at prepare.
#[test]
fn silent_mutations_are_detected() {
    let backend = Arc::new(MemoryDb::new());
    let service = service_over(&backend, |_| {});

    service
        .run_task(|| service.set_binding("silent", &Managed::new(Counter::new(7))))
        .unwrap();

    service
        .run_task(|| {
            let object = service.get_binding::<Counter>("silent")?;
            object.write().value = 9;
            Ok(())
        })
        .unwrap();

    let value = service
        .run_task(|| Ok(service.get_binding::<Counter>("silent")?.read().value))
        .unwrap();
    assert_eq!(value, 9);
}

#[test]
fn silent_mutations_are_lost_when_detection_is_off() {
    let backend = Arc::new(MemoryDb::new());
    let service = service_over(&backend, |config| config.detect_modifications = false);

    service
        .run_task(|| service.set_binding("silent", &Managed::new(Counter::new(7))))
        .unwrap();

    service
        .run_task(|| {
            let object = service.get_binding::<Counter>("silent")?;
            object.write().value = 9;
            Ok(())
        })
        .unwrap();

    let value = service
        .run_task(|| Ok(service.get_binding::<Counter>("silent")?.read().value))
        .unwrap();
    assert_eq!(value, 7);
}

// Invariant 7 at the service level: concurrent writers to one object all
// make progress through the retry envelope, and conflicts do occur.
#[test]
fn concurrent_writers_serialize_through_retries() {
    const THREADS: u64 = 2;
    const INCREMENTS: u64 = 40;

    let backend = Arc::new(MemoryDb::new());
    let service = service_over(&backend, |config| {
        config.store.lock_timeout = Duration::from_millis(20);
    });

    service
        .run_task(|| service.set_binding("shared", &Managed::new(Counter::new(0))))
        .unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let service = service.clone();
            thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    service
                        .run_task(|| {
                            let object = service.get_binding_for_update::<Counter>("shared")?;
                            object.write().value += 1;
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let value = service
        .run_task(|| Ok(service.get_binding::<Counter>("shared")?.read().value))
        .unwrap();
    assert_eq!(value, THREADS * INCREMENTS);
}

// S3 (scaled): concurrent swap workload over per-thread shards with a small
// hot set; no data loss, and the abort counter moves.
#[test]
fn swap_workload_loses_nothing() {
    const THREADS: usize = 2;
    const SWAPS: usize = 120;
    const SLOTS: usize = 20;
    const HOT: usize = 4;

    let backend = Arc::new(MemoryDb::new());
    let service = service_over(&backend, |config| {
        config.store.lock_timeout = Duration::from_millis(15);
    });

    // Every slot starts with a distinct value; swaps must only permute them.
    let mut expected = BTreeSet::new();
    for thread_id in 0..THREADS {
        for slot in 0..SLOTS {
            let value = (thread_id * SLOTS + slot) as u64;
            expected.insert(value);
            let name = format!("slot.{}.{}", thread_id, slot);
            service
                .run_task(|| service.set_binding(&name, &Managed::new(Counter::new(value))))
                .unwrap();
        }
    }
    for hot in 0..HOT {
        let value = (THREADS * SLOTS + hot) as u64;
        expected.insert(value);
        let name = format!("hot.{}", hot);
        service
            .run_task(|| service.set_binding(&name, &Managed::new(Counter::new(value))))
            .unwrap();
    }

    let workers: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let service = service.clone();
            thread::spawn(move || {
                let mut state = 0x9e37_79b9_u64.wrapping_mul(thread_id as u64 + 1);
                let mut next = move || {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    state
                };
                for op in 0..SWAPS {
                    let (first, second) = if op % 4 == 0 {
                        // Touch the shared hot set, in thread-dependent
                        // order, to provoke conflicts and deadlocks.
                        let a = (next() as usize) % HOT;
                        let b = (a + 1 + (next() as usize) % (HOT - 1)) % HOT;
                        (format!("hot.{}", a), format!("hot.{}", b))
                    } else {
                        let a = (next() as usize) % SLOTS;
                        let b = (a + 1 + (next() as usize) % (SLOTS - 1)) % SLOTS;
                        (
                            format!("slot.{}.{}", thread_id, a),
                            format!("slot.{}.{}", thread_id, b),
                        )
                    };
                    service
                        .run_task(|| {
                            let left = service.get_binding_for_update::<Counter>(&first)?;
                            let right = service.get_binding_for_update::<Counter>(&second)?;
                            let tmp = left.read().value;
                            left.write().value = right.read().value;
                            right.write().value = tmp;
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // Every value is still present exactly once.
    let mut found = BTreeSet::new();
    service
        .run_task(|| {
            found.clear();
            let mut cursor = None;
            while let Some(name) = service.next_bound_name(cursor.as_deref())? {
                let value = service.get_binding::<Counter>(&name)?.read().value;
                assert!(found.insert(value), "value {} appears twice", value);
                cursor = Some(name);
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(found, expected);

    let stats = service.store_stats();
    assert!(
        stats.aborted > 0,
        "expected contention, got stats {:?}",
        stats
    );
}

// S4: version header check on reopen.
#[test]
fn version_header_is_checked_on_reopen() {
    let backend = Arc::new(MemoryDb::new());
    {
        let service = service_over(&backend, |_| {});
        assert!(service.shutdown().unwrap());
    }

    // A minor version difference is accepted.
    {
        let service = service_over(&backend, |_| {});
        service
            .run_task(|| {
                let header =
                    service.get_service_binding_for_update::<ServiceHeader>("DataService.header")?;
                header.write().minor = 1;
                Ok(())
            })
            .unwrap();
        assert!(service.shutdown().unwrap());
    }
    {
        let service = service_over(&backend, |_| {});
        assert!(service.shutdown().unwrap());
    }

    // A major version mismatch is fatal.
    {
        let service = service_over(&backend, |_| {});
        service
            .run_task(|| {
                let header =
                    service.get_service_binding_for_update::<ServiceHeader>("DataService.header")?;
                header.write().major = 99;
                Ok(())
            })
            .unwrap();
        assert!(service.shutdown().unwrap());
    }

    let mut config = ServiceConfig::new("scenarios");
    config.store.shutdown_timeout = Duration::from_millis(200);
    let backend_dyn: Arc<dyn Backend> = Arc::clone(&backend) as Arc<dyn Backend>;
    let service = DataService::new(config, backend_dyn, &ThreadScheduler::new()).unwrap();
    let err = service.initialize().unwrap_err();
    assert_matches!(
        err,
        DataError::VersionIncompatible {
            stored_major: 99,
            code_major: 1,
            ..
        }
    );
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(service.state(), ServiceState::Shutdown);
    assert_matches!(
        service.run_task(|| Ok(())),
        Err(DataError::ServiceShutDown)
    );
}

// Participants are driven in registration order; read-only voters are not
// committed; a failing voter aborts everyone.
#[derive(Debug)]
struct RecordingParticipant {
    name: &'static str,
    vote: PrepareVote,
    fail: bool,
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingParticipant {
    fn new(
        name: &'static str,
        vote: PrepareVote,
        fail: bool,
        events: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            vote,
            fail,
            events: Arc::clone(events),
        })
    }

    fn record(&self, what: &str) {
        self.events.lock().unwrap().push(format!("{}:{}", self.name, what));
    }
}

impl Participant for RecordingParticipant {
    fn name(&self) -> &str {
        self.name
    }

    fn prepare(&self) -> Result<PrepareVote, DataError> {
        self.record("prepare");
        if self.fail {
            Err(DataError::TransactionConflict(
                darkstar_datastore::ConflictCause::LockTimeout,
            ))
        } else {
            Ok(self.vote)
        }
    }

    fn commit(&self) {
        self.record("commit");
    }

    fn abort(&self) {
        self.record("abort");
    }
}

#[test]
fn participants_run_in_registration_order() {
    let service = service();
    let events = Arc::new(Mutex::new(Vec::new()));

    service
        .run_task(|| {
            // Touch the data service first so its participant sits at the
            // head of the list.
            service.set_binding("ordered", &Managed::new(Counter::new(1)))?;
            service.register_participant(RecordingParticipant::new(
                "alpha",
                PrepareVote::Prepared,
                false,
                &events,
            ))?;
            service.register_participant(RecordingParticipant::new(
                "beta",
                PrepareVote::ReadOnly,
                false,
                &events,
            ))?;
            Ok(())
        })
        .unwrap();

    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "alpha:prepare".to_owned(),
            "beta:prepare".to_owned(),
            "alpha:commit".to_owned(),
            // beta voted read-only; no commit call for it.
        ]
    );
}

#[test]
fn failing_participant_aborts_the_transaction() {
    let backend = Arc::new(MemoryDb::new());
    let service = service_over(&backend, |config| {
        // One retryable failure per attempt; keep the envelope small.
        config.retry.max_attempts = 3;
        config.retry.budget = Duration::from_secs(1);
    });
    let events = Arc::new(Mutex::new(Vec::new()));

    let err = {
        let events = Arc::clone(&events);
        service
            .run_task(|| {
                service.set_binding("doomed", &Managed::new(Counter::new(1)))?;
                service.register_participant(RecordingParticipant::new(
                    "saboteur",
                    PrepareVote::Prepared,
                    true,
                    &events,
                ))?;
                Ok(())
            })
            .unwrap_err()
    };
    // The prepare failure was retryable, so the envelope retried and then
    // converted the exhaustion into a non-retryable abort.
    assert_matches!(err, DataError::TransactionAborted { attempts: 3, .. });

    let events = events.lock().unwrap();
    assert!(events.contains(&"saboteur:abort".to_owned()));

    // Nothing leaked into the store.
    assert_matches!(
        service
            .run_task(|| service.get_binding::<Counter>("doomed").map(drop))
            .unwrap_err(),
        DataError::NameNotBound(_)
    );
}

// Operation-argument rewriting through the decorator.
#[derive(Debug, Clone, Default)]
struct CountingHooks {
    objects: Arc<AtomicUsize>,
    ids: Arc<AtomicUsize>,
}

impl DataHooks for CountingHooks {
    fn rewrite_object<T: ManagedObject>(&self, object: Managed<T>) -> Managed<T> {
        self.objects.fetch_add(1, Ordering::SeqCst);
        object
    }

    fn rewrite_id(&self, id: u64) -> u64 {
        self.ids.fetch_add(1, Ordering::SeqCst);
        id
    }
}

#[test]
fn hooks_rewrite_arguments() {
    let hooks = CountingHooks::default();
    let hooked = HookedDataService::new(service(), hooks.clone());

    hooked
        .run_task(|| {
            let object = Managed::new(Counter::new(5));
            hooked.set_binding("hooked", &object)?;
            let reference = hooked.create_reference(&object)?;
            hooked.mark_for_update(&object)?;
            let _ = hooked.reference_for_id::<Counter>(reference.id().get())?;
            Ok(())
        })
        .unwrap();

    assert_eq!(hooks.objects.load(Ordering::SeqCst), 3);
    assert_eq!(hooks.ids.load(Ordering::SeqCst), 1);

    let value = hooked
        .run_task(|| Ok(hooked.get_binding::<Counter>("hooked")?.read().value))
        .unwrap();
    assert_eq!(value, 5);
}

// S6 / invariant 9: shutdown drains in-flight work; afterwards every call is
// rejected.
#[test]
fn shutdown_under_load() {
    const WORKERS: usize = 4;

    let backend = Arc::new(MemoryDb::new());
    let service = service_over(&backend, |config| {
        config.store.shutdown_timeout = Duration::from_secs(5);
    });

    service
        .run_task(|| service.set_binding("load", &Managed::new(Counter::new(0))))
        .unwrap();

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let service = service.clone();
            thread::spawn(move || loop {
                let result = service.run_task(|| {
                    let object = service.get_binding_for_update::<Counter>("load")?;
                    object.write().value += 1;
                    Ok(())
                });
                match result {
                    Ok(()) => {}
                    Err(err) => {
                        // Once the drain starts, the only acceptable
                        // failures are lifecycle rejections.
                        assert_eq!(err.kind(), ErrorKind::Lifecycle, "unexpected error: {}", err);
                        return;
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    assert!(service.shutdown().unwrap());
    assert_eq!(service.state(), ServiceState::Shutdown);

    for worker in workers {
        worker.join().unwrap();
    }

    assert_matches!(
        service.run_task(|| Ok(())),
        Err(DataError::ServiceShutDown)
    );
    assert_matches!(service.shutdown(), Err(DataError::AlreadyShutDown));
}
