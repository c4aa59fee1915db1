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

//! The Darkstar transactional data service.
//!
//! Darkstar is a distributed runtime for persistent multi-user server
//! applications. This crate is its data service: the subsystem that lets
//! application code work with an object graph as if it were ordinary
//! in-memory state while, underneath, every read and write participates in
//! a serializable transaction whose effects are durably stored.
//!
//! # Managed objects
//!
//! An application type becomes persistent by implementing
//! [`ManagedObject`]; code holds [`Managed<T>`] handles and serializable
//! [`ManagedRef<T>`] references, which record the object id rather than the
//! payload, so cyclic object graphs are fine. Objects resolved within one
//! transaction keep their identity: resolving the same id twice yields the
//! same handle.
//!
//! # Tasks and transactions
//!
//! Application work runs in tasks started with
//! [`DataService::run_task`]. Each task executes under a fresh transaction;
//! on a retryable abort (lock conflict, deadlock victim, timeout) the task
//! is re-executed from scratch, so tasks must be idempotent under retry.
//! Completion runs two-phase commit across every registered
//! [`Participant`](coordinator::participant::Participant) in registration
//! order.
//!
//! # Example
//!
//! ```
//! use std::borrow::Cow;
//! use std::sync::Arc;
//!
//! use darkstar::{ClassDescriptor, DataService, Managed, ManagedObject, ServiceConfig};
//! use darkstar_datastore::{BinaryValue, MemoryDb, ThreadScheduler};
//!
//! #[derive(Debug, Clone)]
//! struct Counter {
//!     value: u64,
//! }
//!
//! impl BinaryValue for Counter {
//!     fn to_bytes(&self) -> Vec<u8> {
//!         self.value.to_le_bytes().to_vec()
//!     }
//!
//!     fn from_bytes(bytes: Cow<'_, [u8]>) -> anyhow::Result<Self> {
//!         let mut raw = [0_u8; 8];
//!         anyhow::ensure!(bytes.len() == 8, "invalid counter encoding");
//!         raw.copy_from_slice(&bytes);
//!         Ok(Self { value: u64::from_le_bytes(raw) })
//!     }
//! }
//!
//! impl ManagedObject for Counter {
//!     const CLASS: ClassDescriptor = ClassDescriptor::new("example.Counter", 1);
//! }
//!
//! let service = DataService::new(
//!     ServiceConfig::new("example"),
//!     Arc::new(MemoryDb::new()),
//!     &ThreadScheduler::new(),
//! )
//! .unwrap();
//! service.initialize().unwrap();
//!
//! service
//!     .run_task(|| service.set_binding("counter", &Managed::new(Counter { value: 7 })))
//!     .unwrap();
//! let value = service
//!     .run_task(|| Ok(service.get_binding::<Counter>("counter")?.read().value))
//!     .unwrap();
//! assert_eq!(value, 7);
//! ```

#![warn(missing_debug_implementations, unsafe_code, bare_trait_objects)]

pub use crate::{
    config::{RetryConfig, ServiceConfig, MIN_DISCONNECT_DELAY},
    coordinator::{
        participant::{Participant, PrepareVote},
        ServiceState,
    },
    data::{
        classes::{ClassDescriptor, ClassId},
        hooks::{DataHooks, HookedDataService},
        DataService, Managed, ManagedObject, ManagedRef, ServiceHeader, MAJOR_VERSION,
        MINOR_VERSION,
    },
    errors::{DataError, ErrorKind},
};

pub mod config;
pub mod coordinator;
pub mod data;
pub mod errors;
