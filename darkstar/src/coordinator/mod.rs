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

//! The transaction coordinator.
//!
//! The coordinator owns the service lifecycle state, binds transactions to
//! the threads that run application tasks, drives two-phase commit across
//! the registered [`Participant`]s, and re-runs tasks whose transactions
//! abort for a retryable cause.
//!
//! The lifecycle is `Uninitialized → Running → ShuttingDown → Shutdown`,
//! one-way except that a failed shutdown returns to `Running`. The state
//! mutex is held for the whole transition, so a transaction that tries to
//! start concurrently with a transition to `ShuttingDown` is either admitted
//! before it or rejected after it; there is no observable in-between.

pub mod participant;

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use rand::Rng;

use darkstar_datastore::{DataStore, TxnHandle, TxnId};

use crate::config::RetryConfig;
use crate::coordinator::participant::{Participant, PrepareVote};
use crate::errors::DataError;

/// Lifecycle state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Created but not initialized; all service calls are rejected.
    Uninitialized,
    /// Accepting everything.
    Running,
    /// Draining: calls from already-joined transactions are accepted, new
    /// joins are rejected.
    ShuttingDown,
    /// Terminal; all calls are rejected.
    Shutdown,
}

/// A transaction currently bound to some application task.
pub(crate) struct ActiveTxn {
    pub txn: TxnHandle,
    participants: Mutex<Vec<Arc<dyn Participant>>>,
    finished: AtomicBool,
}

impl ActiveTxn {
    fn new(txn: TxnHandle) -> Self {
        Self {
            txn,
            participants: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        }
    }

    /// Adds a participant; participants are driven in registration order.
    pub fn register(&self, participant: Arc<dyn Participant>) {
        self.participants
            .lock()
            .expect("participant list poisoned")
            .push(participant);
    }

    fn participants(&self) -> Vec<Arc<dyn Participant>> {
        self.participants
            .lock()
            .expect("participant list poisoned")
            .clone()
    }
}

struct CoordShared {
    state: ServiceState,
    active: HashMap<TxnId, Arc<ActiveTxn>>,
}

/// The process-wide transaction coordinator of one service.
pub(crate) struct Coordinator {
    store: DataStore,
    retry: RetryConfig,
    shutdown_timeout: Duration,
    shared: Mutex<CoordShared>,
    cv: Condvar,
}

thread_local! {
    static CURRENT_TXN: RefCell<Option<Arc<ActiveTxn>>> = RefCell::new(None);
}

/// Binds an active transaction to the current thread for the duration of one
/// task attempt; unbinds and aborts leftovers on drop, which also covers
/// panics inside the task.
struct TxnBind<'a> {
    coordinator: &'a Coordinator,
    active: Arc<ActiveTxn>,
}

impl<'a> TxnBind<'a> {
    fn new(coordinator: &'a Coordinator, active: Arc<ActiveTxn>) -> Self {
        debug_assert!(
            CURRENT_TXN.with(|cell| cell.borrow().is_none()),
            "application tasks must not nest"
        );
        CURRENT_TXN.with(|cell| *cell.borrow_mut() = Some(Arc::clone(&active)));
        Self { coordinator, active }
    }
}

impl Drop for TxnBind<'_> {
    fn drop(&mut self) {
        CURRENT_TXN.with(|cell| *cell.borrow_mut() = None);
        self.coordinator.abort_all(&self.active);
        self.coordinator.forget(&self.active);
    }
}

impl Coordinator {
    pub fn new(store: DataStore, retry: RetryConfig, shutdown_timeout: Duration) -> Self {
        Self {
            store,
            retry,
            shutdown_timeout,
            shared: Mutex::new(CoordShared {
                state: ServiceState::Uninitialized,
                active: HashMap::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Moves the service from `Uninitialized` to `Running`. Initializing a
    /// running service is a no-op.
    pub fn initialize(&self) -> Result<(), DataError> {
        let mut shared = self.lock_shared();
        match shared.state {
            ServiceState::Uninitialized => {
                shared.state = ServiceState::Running;
                info!("transaction coordinator is running");
                Ok(())
            }
            ServiceState::Running => Ok(()),
            ServiceState::ShuttingDown => Err(DataError::ServiceShuttingDown),
            ServiceState::Shutdown => Err(DataError::ServiceShutDown),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.lock_shared().state
    }

    /// Moves the service straight to `Shutdown` after a fatal error.
    pub fn force_shutdown(&self) {
        {
            let mut shared = self.lock_shared();
            shared.state = ServiceState::Shutdown;
        }
        self.cv.notify_all();
        match self.store.shutdown() {
            Ok(true) => {}
            Ok(false) => warn!("store did not drain during forced shutdown"),
            Err(err) => warn!("store shutdown failed during forced shutdown: {}", err),
        }
    }

    /// The transaction bound to the current thread.
    pub fn current_txn(&self) -> Result<Arc<ActiveTxn>, DataError> {
        let bound = CURRENT_TXN.with(|cell| cell.borrow().clone());
        let state = self.state();
        match bound {
            Some(active) => match state {
                ServiceState::Shutdown => Err(DataError::ServiceShutDown),
                ServiceState::Uninitialized => Err(DataError::ServiceNotReady),
                _ => Ok(active),
            },
            None => match state {
                ServiceState::Uninitialized => Err(DataError::ServiceNotReady),
                ServiceState::Shutdown => Err(DataError::ServiceShutDown),
                _ => Err(DataError::TransactionNotActive),
            },
        }
    }

    /// Runs `task` under a fresh transaction, retrying on retryable aborts
    /// within the configured attempt and wall-clock budgets.
    pub fn run_in_txn<R>(
        &self,
        mut task: impl FnMut() -> Result<R, DataError>,
    ) -> Result<R, DataError> {
        let started = Instant::now();
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            match self.attempt(&mut task) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    if attempts >= self.retry.max_attempts || started.elapsed() >= self.retry.budget
                    {
                        warn!("giving up after {} attempts: {}", attempts, err);
                        return Err(DataError::TransactionAborted {
                            attempts,
                            cause: err.to_string(),
                        });
                    }
                    let delay = self.backoff_delay(attempts);
                    debug!("retrying after {:?} (attempt {}): {}", delay, attempts, err);
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt<R>(&self, task: &mut impl FnMut() -> Result<R, DataError>) -> Result<R, DataError> {
        let active = {
            let mut shared = self.lock_shared();
            match shared.state {
                ServiceState::Uninitialized => return Err(DataError::ServiceNotReady),
                ServiceState::ShuttingDown => return Err(DataError::ServiceShuttingDown),
                ServiceState::Shutdown => return Err(DataError::ServiceShutDown),
                ServiceState::Running => {}
            }
            let txn = self.store.begin()?;
            let active = Arc::new(ActiveTxn::new(txn));
            shared.active.insert(txn.id(), Arc::clone(&active));
            active
        };
        trace!("{} bound to the current task", active.txn);

        let _bind = TxnBind::new(self, Arc::clone(&active));
        let value = task()?;
        self.complete(&active)?;
        Ok(value)
    }

    /// Prepares every participant in registration order, then commits the
    /// ones that voted `Prepared`. Any prepare failure aborts them all.
    fn complete(&self, active: &ActiveTxn) -> Result<(), DataError> {
        let participants = active.participants();
        let mut votes = Vec::with_capacity(participants.len());
        for participant in &participants {
            match participant.prepare() {
                Ok(vote) => {
                    trace!(
                        "participant `{}` voted {:?} in {}",
                        participant.name(),
                        vote,
                        active.txn
                    );
                    votes.push(vote);
                }
                Err(err) => {
                    warn!(
                        "participant `{}` failed to prepare {}: {}",
                        participant.name(),
                        active.txn,
                        err
                    );
                    self.abort_all(active);
                    return Err(err);
                }
            }
        }
        for (participant, vote) in participants.iter().zip(votes) {
            if vote == PrepareVote::Prepared {
                participant.commit();
            }
        }
        // A transaction with no writing participants still has its raw store
        // transaction open; close it. For everyone else this is a no-op.
        self.store.commit(active.txn)?;
        active.finished.store(true, Ordering::Release);
        Ok(())
    }

    fn abort_all(&self, active: &ActiveTxn) {
        if active.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        for participant in active.participants() {
            participant.abort();
        }
        if let Err(err) = self.store.abort(active.txn) {
            warn!("failed to abort {}: {}", active.txn, err);
        }
        trace!("{} aborted", active.txn);
    }

    fn forget(&self, active: &ActiveTxn) {
        {
            let mut shared = self.lock_shared();
            shared.active.remove(&active.txn.id());
        }
        self.cv.notify_all();
    }

    /// Drains in-flight transactions and shuts the service down.
    ///
    /// Returns `true` on a clean shutdown. If the drain is cut short, the
    /// service goes back to `Running` and `false` is returned.
    pub fn shutdown(&self) -> Result<bool, DataError> {
        {
            let mut shared = self.lock_shared();
            loop {
                match shared.state {
                    ServiceState::Uninitialized => {
                        shared.state = ServiceState::Shutdown;
                        drop(shared);
                        if let Err(err) = self.store.shutdown() {
                            warn!("store shutdown failed: {}", err);
                        }
                        return Ok(true);
                    }
                    ServiceState::Running => {
                        shared.state = ServiceState::ShuttingDown;
                        info!("service is shutting down");
                        break;
                    }
                    ServiceState::ShuttingDown => {
                        // Another shutdown is in flight; wait for its outcome.
                        shared = self
                            .cv
                            .wait(shared)
                            .expect("coordinator state poisoned");
                    }
                    ServiceState::Shutdown => return Err(DataError::AlreadyShutDown),
                }
            }
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        let mut shared = self.lock_shared();
        while !shared.active.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(shared, deadline - now)
                .expect("coordinator state poisoned");
            shared = guard;
        }

        if shared.active.is_empty() {
            drop(shared);
            let store_done = match self.store.shutdown() {
                Ok(done) => done,
                Err(err) => {
                    warn!("store shutdown failed: {}", err);
                    false
                }
            };
            let mut shared = self.lock_shared();
            shared.state = if store_done {
                ServiceState::Shutdown
            } else {
                ServiceState::Running
            };
            drop(shared);
            self.cv.notify_all();
            if store_done {
                info!("service shut down cleanly");
            }
            Ok(store_done)
        } else {
            let in_flight = shared.active.len();
            shared.state = ServiceState::Running;
            drop(shared);
            self.cv.notify_all();
            warn!(
                "service shutdown interrupted; {} transaction(s) still in flight",
                in_flight
            );
            Ok(false)
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry.backoff.max(Duration::from_micros(100));
        let capped = base.saturating_mul(1_u32 << attempt.min(6));
        let micros = capped.as_micros() as u64;
        let jittered = micros / 2 + rand::thread_rng().gen_range(0..=micros / 2);
        Duration::from_micros(jittered)
    }

    fn lock_shared(&self) -> std::sync::MutexGuard<'_, CoordShared> {
        self.shared.lock().expect("coordinator state poisoned")
    }
}
