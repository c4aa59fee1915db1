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

//! The data service front-end.
//!
//! [`DataService`] exposes the operations application code invokes: name
//! bindings, reference creation, update marking and removal. Each operation
//! checks the service state, joins the current transaction (creating its
//! context and registering the data service as a participant on first
//! contact), validates arguments, prefixes binding names with the proper
//! namespace and maps store errors to the public taxonomy.
//!
//! Two disjoint namespaces share the binding key space: `a.` for
//! application bindings and `s.` for service-internal ones. Enumeration
//! with [`next_bound_name`](DataService::next_bound_name) never crosses from
//! one namespace into the other.

pub mod classes;
pub mod hooks;

mod context;
mod object;
mod reference;

pub use self::object::{Managed, ManagedObject};
pub use self::reference::ManagedRef;

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use log::{error, info, log, trace, warn};

use darkstar_datastore::{Backend, BinaryValue, DataStore, ObjectId, Scheduler, Stats, TxnId};

use crate::config::ServiceConfig;
use crate::coordinator::participant::{Participant, PrepareVote};
use crate::coordinator::{Coordinator, ServiceState};
use crate::data::classes::{ClassDescriptor, ClassesCatalog};
use crate::data::context::ContextInner;
use crate::errors::{DataError, ErrorKind};

/// Major version of the persisted layout. A store written by a different
/// major version is rejected.
pub const MAJOR_VERSION: u16 = 1;
/// Minor version of the persisted layout. Differences are logged and
/// accepted.
pub const MINOR_VERSION: u16 = 0;

const HEADER_BINDING: &str = "DataService.header";

/// The sentinel object recording the persisted layout version, bound under
/// the service namespace on first startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHeader {
    /// Major layout version.
    pub major: u16,
    /// Minor layout version.
    pub minor: u16,
}

impl BinaryValue for ServiceHeader {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4);
        bytes.extend_from_slice(&self.major.to_le_bytes());
        bytes.extend_from_slice(&self.minor.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: Cow<'_, [u8]>) -> anyhow::Result<Self> {
        let bytes = bytes.as_ref();
        anyhow::ensure!(bytes.len() == 4, "invalid service header encoding");
        Ok(Self {
            major: u16::from_le_bytes([bytes[0], bytes[1]]),
            minor: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}

impl ManagedObject for ServiceHeader {
    const CLASS: ClassDescriptor = ClassDescriptor::new("darkstar.ServiceHeader", 1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespace {
    Application,
    Service,
}

impl Namespace {
    fn prefix(self) -> &'static str {
        match self {
            Namespace::Application => "a.",
            Namespace::Service => "s.",
        }
    }

    fn apply(self, name: &str) -> String {
        format!("{}{}", self.prefix(), name)
    }
}

pub(crate) struct ServiceInner {
    config: ServiceConfig,
    store: DataStore,
    catalog: Arc<ClassesCatalog>,
    coordinator: Coordinator,
    contexts: Mutex<HashMap<TxnId, Arc<ContextInner>>>,
}

/// The transactional data service.
///
/// Cloning yields another handle to the same service. All data operations
/// must run inside a task started with [`run_task`](DataService::run_task);
/// outside of one they fail with
/// [`TransactionNotActive`](DataError::TransactionNotActive).
#[derive(Clone)]
pub struct DataService {
    inner: Arc<ServiceInner>,
}

impl fmt::Debug for DataService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataService")
            .field("app_name", &self.inner.config.app_name)
            .finish()
    }
}

thread_local! {
    static CURRENT_SERVICE: RefCell<Option<Weak<ServiceInner>>> = RefCell::new(None);
}

/// The service bound to the current task's thread, if any. Used by managed
/// references to resolve without an explicit service handle.
pub(crate) fn current_service() -> Option<DataService> {
    CURRENT_SERVICE
        .with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
        .map(|inner| DataService { inner })
}

/// Scoped binding of the service to the current thread; restores the
/// previous binding on drop.
struct ServiceBind {
    previous: Option<Weak<ServiceInner>>,
}

impl ServiceBind {
    fn new(service: Weak<ServiceInner>) -> Self {
        let previous = CURRENT_SERVICE.with(|cell| cell.borrow_mut().replace(service));
        Self { previous }
    }
}

impl Drop for ServiceBind {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_SERVICE.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// The data service's seat at the two-phase commit table.
struct ContextParticipant {
    ctx: Arc<ContextInner>,
    service: Weak<ServiceInner>,
}

impl ContextParticipant {
    fn cleanup(&self) {
        if let Some(service) = self.service.upgrade() {
            service
                .contexts
                .lock()
                .expect("context map poisoned")
                .remove(&self.ctx.txn.id());
        }
    }
}

impl Participant for ContextParticipant {
    fn name(&self) -> &str {
        "DataService"
    }

    fn prepare(&self) -> Result<PrepareVote, DataError> {
        self.ctx.prepare().map(PrepareVote::from)
    }

    fn commit(&self) {
        if let Err(err) = self.ctx.commit() {
            error!("data service failed to commit {}: {}", self.ctx.txn, err);
        }
        self.cleanup();
    }

    fn abort(&self) {
        self.ctx.abort();
        self.cleanup();
    }
}

impl DataService {
    /// Creates the service over `backend`. The service starts
    /// `Uninitialized`; call [`initialize`](DataService::initialize) before
    /// running tasks.
    pub fn new(
        config: ServiceConfig,
        backend: Arc<dyn Backend>,
        scheduler: &dyn Scheduler,
    ) -> Result<Self, DataError> {
        config.validate()?;
        let store = DataStore::open(backend, config.store.clone(), scheduler)?;
        let catalog = Arc::new(ClassesCatalog::new(store.clone()));
        let coordinator = Coordinator::new(
            store.clone(),
            config.retry.clone(),
            config.store.shutdown_timeout,
        );
        info!("created data service for application `{}`", config.app_name);
        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                store,
                catalog,
                coordinator,
                contexts: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Moves the service to `Running` and checks the persisted layout
    /// version, writing the header binding on first startup.
    ///
    /// A major version mismatch is fatal: the error is returned and the
    /// service transitions to `Shutdown`.
    pub fn initialize(&self) -> Result<(), DataError> {
        self.inner.coordinator.initialize()?;
        match self.run_task(|| self.check_version()) {
            Ok(()) => {
                info!("data service `{}` initialized", self.inner.config.app_name);
                Ok(())
            }
            Err(err) => {
                if err.kind() == ErrorKind::Fatal {
                    error!("fatal error while initializing the data service: {}", err);
                    self.inner.coordinator.force_shutdown();
                }
                Err(err)
            }
        }
    }

    fn check_version(&self) -> Result<(), DataError> {
        match self.get_service_binding::<ServiceHeader>(HEADER_BINDING) {
            Ok(header) => {
                let header = header.read();
                if header.major != MAJOR_VERSION {
                    return Err(DataError::VersionIncompatible {
                        stored_major: header.major,
                        stored_minor: header.minor,
                        code_major: MAJOR_VERSION,
                        code_minor: MINOR_VERSION,
                    });
                }
                if header.minor != MINOR_VERSION {
                    warn!(
                        "data layout minor version differs: stored {}.{}, code {}.{}",
                        header.major, header.minor, MAJOR_VERSION, MINOR_VERSION
                    );
                }
                Ok(())
            }
            Err(DataError::NameNotBound(_)) => {
                let header = Managed::new(ServiceHeader {
                    major: MAJOR_VERSION,
                    minor: MINOR_VERSION,
                });
                self.set_service_binding(HEADER_BINDING, &header)?;
                info!("wrote data layout header {}.{}", MAJOR_VERSION, MINOR_VERSION);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Runs `task` under a transaction, re-running it on retryable aborts.
    ///
    /// The task must be idempotent under retry: it may run several times,
    /// and only the effects of the final, committed run survive. Tasks must
    /// not nest.
    pub fn run_task<R>(&self, task: impl FnMut() -> Result<R, DataError>) -> Result<R, DataError> {
        let _bind = ServiceBind::new(Arc::downgrade(&self.inner));
        self.inner.coordinator.run_in_txn(task)
    }

    /// Registers an external participant with the current transaction.
    pub fn register_participant(
        &self,
        participant: Arc<dyn Participant>,
    ) -> Result<(), DataError> {
        let active = self.inner.coordinator.current_txn()?;
        active.register(participant);
        Ok(())
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.inner.coordinator.state()
    }

    /// Drains in-flight transactions and shuts the service down; see
    /// [`Coordinator`] semantics: `true` for a clean shutdown, `false` when
    /// the drain was cut short (the service keeps running).
    pub fn shutdown(&self) -> Result<bool, DataError> {
        self.inner.coordinator.shutdown()
    }

    /// Operational counters of the underlying store.
    pub fn store_stats(&self) -> Stats {
        self.inner.store.stats()
    }

    // Application-facing operations.

    /// Returns the managed object bound to `name`, checked to be of type
    /// `T`.
    pub fn get_binding<T: ManagedObject>(&self, name: &str) -> Result<Managed<T>, DataError> {
        self.binding_op("get_binding", Namespace::Application, name, false)
    }

    /// Like [`get_binding`](DataService::get_binding), but takes the write
    /// lock eagerly and marks the object dirty.
    pub fn get_binding_for_update<T: ManagedObject>(
        &self,
        name: &str,
    ) -> Result<Managed<T>, DataError> {
        self.binding_op("get_binding_for_update", Namespace::Application, name, true)
    }

    /// Binds `name` to `object`, creating the object's reference if it is
    /// still transient.
    pub fn set_binding<T: ManagedObject>(
        &self,
        name: &str,
        object: &Managed<T>,
    ) -> Result<(), DataError> {
        self.set_binding_op("set_binding", Namespace::Application, name, object)
    }

    /// Unbinds `name`. The object the name was bound to is not removed.
    pub fn remove_binding(&self, name: &str) -> Result<(), DataError> {
        self.remove_binding_op("remove_binding", Namespace::Application, name)
    }

    /// The lexicographic successor of `name` among application bindings;
    /// `None` input starts the enumeration, `None` output ends it.
    pub fn next_bound_name(&self, name: Option<&str>) -> Result<Option<String>, DataError> {
        self.next_bound_name_op("next_bound_name", Namespace::Application, name)
    }

    // Service-internal equivalents addressing the `s.` namespace.

    /// [`get_binding`](DataService::get_binding) in the service namespace.
    pub fn get_service_binding<T: ManagedObject>(
        &self,
        name: &str,
    ) -> Result<Managed<T>, DataError> {
        self.binding_op("get_service_binding", Namespace::Service, name, false)
    }

    /// [`get_binding_for_update`](DataService::get_binding_for_update) in
    /// the service namespace.
    pub fn get_service_binding_for_update<T: ManagedObject>(
        &self,
        name: &str,
    ) -> Result<Managed<T>, DataError> {
        self.binding_op(
            "get_service_binding_for_update",
            Namespace::Service,
            name,
            true,
        )
    }

    /// [`set_binding`](DataService::set_binding) in the service namespace.
    pub fn set_service_binding<T: ManagedObject>(
        &self,
        name: &str,
        object: &Managed<T>,
    ) -> Result<(), DataError> {
        self.set_binding_op("set_service_binding", Namespace::Service, name, object)
    }

    /// [`remove_binding`](DataService::remove_binding) in the service
    /// namespace.
    pub fn remove_service_binding(&self, name: &str) -> Result<(), DataError> {
        self.remove_binding_op("remove_service_binding", Namespace::Service, name)
    }

    /// [`next_bound_name`](DataService::next_bound_name) in the service
    /// namespace.
    pub fn next_service_bound_name(&self, name: Option<&str>) -> Result<Option<String>, DataError> {
        self.next_bound_name_op("next_service_bound_name", Namespace::Service, name)
    }

    /// Returns a reference to `object`, allocating an id if it is new to
    /// this transaction.
    pub fn create_reference<T: ManagedObject>(
        &self,
        object: &Managed<T>,
    ) -> Result<ManagedRef<T>, DataError> {
        let result = self.join().and_then(|ctx| {
            let id = ctx.reference_for(object)?;
            Ok(ManagedRef::new(id, Arc::downgrade(&ctx)))
        });
        log_outcome("create_reference", "-", &result);
        result
    }

    /// Upgrades `object` to the write lock and marks it dirty, so prepare
    /// persists it without a byte compare.
    pub fn mark_for_update<T: ManagedObject>(&self, object: &Managed<T>) -> Result<(), DataError> {
        let result = self.join().and_then(|ctx| ctx.mark_for_update(object));
        log_outcome("mark_for_update", "-", &result);
        result
    }

    /// Schedules `object` for deletion at commit. Within this transaction
    /// any further resolve of the object fails.
    pub fn remove_object<T: ManagedObject>(&self, object: &Managed<T>) -> Result<(), DataError> {
        let result = self.join().and_then(|ctx| ctx.remove(object));
        log_outcome("remove_object", "-", &result);
        result
    }

    /// Builds a reference from a raw id. The id is validated for range
    /// only; a dangling id surfaces as `ObjectNotFound` at first resolve.
    pub fn reference_for_id<T: ManagedObject>(&self, raw: u64) -> Result<ManagedRef<T>, DataError> {
        let result = self.join().and_then(|ctx| {
            let id = ObjectId::new(raw).ok_or(DataError::InvalidId(raw))?;
            Ok(ManagedRef::new(id, Arc::downgrade(&ctx)))
        });
        log_outcome("reference_for_id", "-", &result);
        result
    }

    // Internals.

    /// Joins the current transaction: returns its context, creating it and
    /// registering the data service as a participant on first contact.
    /// While the service is shutting down only transactions that joined
    /// earlier are served.
    pub(crate) fn join(&self) -> Result<Arc<ContextInner>, DataError> {
        let active = self.inner.coordinator.current_txn()?;
        let mut contexts = self.inner.contexts.lock().expect("context map poisoned");
        if let Some(ctx) = contexts.get(&active.txn.id()) {
            return Ok(Arc::clone(ctx));
        }
        if self.inner.coordinator.state() == ServiceState::ShuttingDown {
            return Err(DataError::ServiceShuttingDown);
        }
        let ctx = Arc::new(ContextInner::new(
            active.txn,
            self.inner.store.clone(),
            Arc::clone(&self.inner.catalog),
            self.inner.config.detect_modifications,
            self.inner.config.debug_check_interval,
        ));
        contexts.insert(active.txn.id(), Arc::clone(&ctx));
        active.register(Arc::new(ContextParticipant {
            ctx: Arc::clone(&ctx),
            service: Arc::downgrade(&self.inner),
        }));
        trace!("{} joined the data service", active.txn);
        Ok(ctx)
    }

    fn binding_op<T: ManagedObject>(
        &self,
        op: &str,
        ns: Namespace,
        name: &str,
        for_update: bool,
    ) -> Result<Managed<T>, DataError> {
        trace!("{} `{}`", op, name);
        let result = self.join().and_then(|ctx| {
            let id = match ctx.get_binding_id(&ns.apply(name)) {
                Err(DataError::NameNotBound(_)) => {
                    return Err(DataError::NameNotBound(name.to_owned()));
                }
                other => other?,
            };
            ctx.resolve::<T>(id, for_update)
        });
        log_outcome(op, name, &result);
        result
    }

    fn set_binding_op<T: ManagedObject>(
        &self,
        op: &str,
        ns: Namespace,
        name: &str,
        object: &Managed<T>,
    ) -> Result<(), DataError> {
        trace!("{} `{}`", op, name);
        let result = self.join().and_then(|ctx| {
            let id = ctx.reference_for(object)?;
            ctx.set_binding_id(&ns.apply(name), id)
        });
        log_outcome(op, name, &result);
        result
    }

    fn remove_binding_op(&self, op: &str, ns: Namespace, name: &str) -> Result<(), DataError> {
        trace!("{} `{}`", op, name);
        let result = self.join().and_then(|ctx| {
            match ctx.remove_binding(&ns.apply(name)) {
                Err(DataError::NameNotBound(_)) => Err(DataError::NameNotBound(name.to_owned())),
                other => other,
            }
        });
        log_outcome(op, name, &result);
        result
    }

    fn next_bound_name_op(
        &self,
        op: &str,
        ns: Namespace,
        name: Option<&str>,
    ) -> Result<Option<String>, DataError> {
        trace!("{} {:?}", op, name);
        let result = self.join().and_then(|ctx| {
            let full = match name {
                Some(given) => ns.apply(given),
                None => {
                    // The empty name is a valid binding and sorts first;
                    // starting an enumeration must include it.
                    match ctx.get_binding_id(ns.prefix()) {
                        Ok(_) => return Ok(Some(String::new())),
                        Err(DataError::NameNotBound(_)) => {}
                        Err(err) => return Err(err),
                    }
                    ns.prefix().to_owned()
                }
            };
            let next = ctx.next_bound_name(&full)?;
            Ok(next.and_then(|full_name| {
                if full_name.starts_with(ns.prefix()) {
                    Some(full_name[ns.prefix().len()..].to_owned())
                } else {
                    // Crossed into the other namespace: enumeration is over.
                    None
                }
            }))
        });
        log_outcome(op, name.unwrap_or("<start>"), &result);
        result
    }
}

fn log_outcome<R>(op: &str, name: &str, result: &Result<R, DataError>) {
    match result {
        Ok(_) => trace!("{} `{}` ok", op, name),
        Err(err) => log!(err.log_level(), "{} `{}` failed: {}", op, name, err),
    }
}
