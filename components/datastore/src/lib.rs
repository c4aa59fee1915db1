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

//! The transactional object store beneath the Darkstar data service.
//!
//! # Store
//!
//! A [`DataStore`] maps 64-bit [`ObjectId`]s to serialized object payloads
//! and textual names to object ids, with serializable isolation. Work
//! happens under transactions: [`begin`](DataStore::begin) registers one,
//! every read takes a shared lock and every write an exclusive lock on the
//! entity it touches, and locks are held to the end of the transaction.
//! Conflicts are resolved by retry, not by merging: a transaction that loses
//! a lock wait or is picked as a deadlock victim fails with a retryable
//! error and is expected to be re-executed from scratch.
//!
//! Writes are buffered in a per-transaction [`Patch`] and applied to the
//! [`Backend`] atomically at commit. The first phase of two-phase commit is
//! [`prepare`](DataStore::prepare), which reports
//! [`Prepare::ReadOnly`](Prepare) for transactions without writes.
//!
//! # Backend
//!
//! The byte-level page store is not part of this crate; it plugs in behind
//! the [`Backend`] trait. [`MemoryDb`] is the bundled in-memory backend used
//! for tests and experiments.
//!
//! # `BinaryKey` and `BinaryValue`
//!
//! Types stored as keys or values implement the [`BinaryKey`] or
//! [`BinaryValue`] traits respectively; both are implemented for the common
//! standard types.

#![warn(missing_debug_implementations, unsafe_code, bare_trait_objects)]

pub use crate::{
    backends::{memorydb::MemoryDb, Backend, Iter, Iterator, Snapshot},
    db::{DataStore, ObjectId, Prepare, Stats, StoreConfig, BINDINGS, META, OBJECTS},
    error::{ConflictCause, StoreError},
    keys::BinaryKey,
    patch::{Change, Changes, Patch, PatchIterator},
    scheduler::{ScheduledHandle, Scheduler, Task, ThreadScheduler},
    txn::{TxnHandle, TxnId},
    values::BinaryValue,
};

/// A specialized `Result` type for operations with the store.
pub type Result<T> = std::result::Result<T, StoreError>;

pub mod backends;
mod db;
mod error;
mod keys;
mod lock;
mod patch;
mod scheduler;
mod txn;
mod values;

#[cfg(test)]
mod tests;
