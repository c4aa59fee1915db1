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

//! An implementation of the in-memory backend.

use crossbeam::sync::ShardedLock;
use std::{
    collections::{btree_map::Range, BTreeMap, HashMap},
    iter::Peekable,
    sync::Arc,
};

use crate::backends::{Backend, Iter, Iterator as DbIterator, Snapshot};
use crate::patch::{Change, Patch};
use crate::Result;

type Keyspaces = HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// This in-memory backend is only used for testing and experimenting; it is
/// not designed to operate under load in production.
#[derive(Debug, Default)]
pub struct MemoryDb {
    inner: Arc<ShardedLock<Keyspaces>>,
}

struct MemorySnapshot {
    snapshot: Keyspaces,
}

struct MemoryDbIterator<'a> {
    iter: Peekable<Range<'a, Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    /// Creates a new, empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the contents of the backend.
    pub fn clear(&self) {
        let mut keyspaces = self.inner.write().expect("Couldn't get write lock");
        for keyspace in keyspaces.values_mut() {
            keyspace.clear();
        }
    }
}

impl Backend for MemoryDb {
    fn snapshot(&self) -> Box<dyn Snapshot> {
        Box::new(MemorySnapshot {
            snapshot: self.inner.read().expect("Couldn't get read lock").clone(),
        })
    }

    fn get(&self, keyspace: &str, key: &[u8]) -> Option<Vec<u8>> {
        let keyspaces = self.inner.read().expect("Couldn't get read lock");
        keyspaces.get(keyspace)?.get(key).cloned()
    }

    fn apply(&self, patch: Patch) -> Result<()> {
        let mut keyspaces = self.inner.write().expect("Couldn't get write lock");
        for (name, changes) in patch {
            if !keyspaces.contains_key(&name) {
                keyspaces.insert(name.clone(), BTreeMap::new());
            }
            let keyspace = keyspaces.get_mut(&name).expect("keyspace was just inserted");

            for (key, change) in changes.into_data() {
                match change {
                    Change::Put(value) => keyspace.insert(key, value),
                    Change::Delete => keyspace.remove(&key),
                };
            }
        }
        Ok(())
    }
}

impl Snapshot for MemorySnapshot {
    fn get(&self, keyspace: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.snapshot.get(keyspace)?.get(key).cloned()
    }

    fn iter(&self, keyspace: &str, from: &[u8]) -> Iter<'_> {
        static EMPTY: &BTreeMap<Vec<u8>, Vec<u8>> = &BTreeMap::new();

        let keyspace = self.snapshot.get(keyspace).unwrap_or(EMPTY);
        let iter = keyspace.range::<[u8], _>((
            std::ops::Bound::Included(from),
            std::ops::Bound::Unbounded,
        ));

        Box::new(MemoryDbIterator {
            iter: iter.peekable(),
        })
    }
}

impl<'a> DbIterator for MemoryDbIterator<'a> {
    fn next(&mut self) -> Option<(&[u8], &[u8])> {
        let (key, value) = self.iter.next()?;
        Some((key, value))
    }

    fn peek(&mut self) -> Option<(&[u8], &[u8])> {
        let (key, value) = self.iter.peek()?;
        Some((key, value))
    }
}

impl From<MemoryDb> for Arc<dyn Backend> {
    fn from(db: MemoryDb) -> Self {
        Arc::new(db)
    }
}
