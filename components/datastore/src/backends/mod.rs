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

//! Storage backends.
//!
//! A [`Backend`] is the byte-level engine beneath the store: a collection of
//! named keyspaces with consistent snapshots and atomic patch application.
//! The store never interacts with pages or files directly; a production
//! page store plugs in behind this trait, and [`MemoryDb`] serves tests and
//! experiments.
//!
//! [`MemoryDb`]: memorydb::MemoryDb

pub mod memorydb;

use std::fmt;

use crate::patch::Patch;
use crate::Result;

/// A generalized iterator over the entries of one keyspace.
pub type Iter<'a> = Box<dyn Iterator + 'a>;

/// A streaming iterator over keyspace entries. Unlike the standard
/// [`Iterator`](std::iter::Iterator) trait, this trait is low-level and,
/// therefore, operates with bytes.
pub trait Iterator {
    /// Advances the iterator and returns a reference to the next key and value.
    fn next(&mut self) -> Option<(&[u8], &[u8])>;

    /// Returns a reference to the current key and value without advancing the
    /// iterator.
    fn peek(&mut self) -> Option<(&[u8], &[u8])>;
}

/// A read-only, point-in-time view of a backend.
///
/// A `Snapshot` is immutable: consistency is guaranteed even if the data in
/// the backend changes between reads.
pub trait Snapshot: Send + Sync {
    /// Returns a value corresponding to the specified key, or `None` if it
    /// does not exist.
    fn get(&self, keyspace: &str, key: &[u8]) -> Option<Vec<u8>>;

    /// Returns `true` if the snapshot contains a value for the specified key.
    fn contains(&self, keyspace: &str, key: &[u8]) -> bool {
        self.get(keyspace, key).is_some()
    }

    /// Returns an iterator over the entries of the keyspace in ascending
    /// order, starting from the specified key.
    fn iter(&self, keyspace: &str, from: &[u8]) -> Iter<'_>;
}

/// The byte-level storage engine beneath the store.
///
/// A `Backend` instance is shared across threads, so it must be `Sync` and
/// `Send`. All interaction goes through [`snapshot`](Backend::snapshot),
/// [`get`](Backend::get) and [`apply`](Backend::apply).
pub trait Backend: Send + Sync + 'static {
    /// Creates a new snapshot of the backend from its current state.
    fn snapshot(&self) -> Box<dyn Snapshot>;

    /// Returns the current value for the specified key.
    ///
    /// The default implementation takes a full snapshot; implementations are
    /// expected to override it with a cheaper point read.
    fn get(&self, keyspace: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.snapshot().get(keyspace, key)
    }

    /// Atomically applies a patch to the backend.
    ///
    /// This method may be called concurrently from different threads; the
    /// onus to guarantee atomicity is on the implementor. In case of an
    /// error, no changes may be applied.
    fn apply(&self, patch: Patch) -> Result<()>;
}

impl Snapshot for Box<dyn Snapshot> {
    fn get(&self, keyspace: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.as_ref().get(keyspace, key)
    }

    fn contains(&self, keyspace: &str, key: &[u8]) -> bool {
        self.as_ref().contains(keyspace, key)
    }

    fn iter(&self, keyspace: &str, from: &[u8]) -> Iter<'_> {
        self.as_ref().iter(keyspace, from)
    }
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").finish()
    }
}

impl fmt::Debug for dyn Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").finish()
    }
}

impl fmt::Debug for dyn Iterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iterator").finish()
    }
}
