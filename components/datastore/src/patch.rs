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

//! Buffered write sets.
//!
//! Every transaction accumulates its writes in a [`Patch`]: a set of
//! [`Change`]s grouped by keyspace. A patch is applied to the backend
//! atomically when the transaction commits, and simply dropped when it
//! aborts. Reads within the owning transaction consult the patch first, so a
//! transaction always observes its own writes.

use std::collections::{
    btree_map::{self, BTreeMap},
    hash_map::{self, HashMap},
    Bound::{Included, Unbounded},
};
use std::iter::Peekable;

use crate::backends::{Iter, Iterator};

/// A type of change made to some key in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Put the specified value into the store for the corresponding key.
    Put(Vec<u8>),
    /// Delete the value from the store for the corresponding key.
    Delete,
}

/// Changes accumulated for a single keyspace, ordered by key.
#[derive(Debug, Clone, Default)]
pub struct Changes {
    data: BTreeMap<Vec<u8>, Change>,
}

impl Changes {
    /// Returns an iterator over the changes in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, Vec<u8>, Change> {
        self.data.iter()
    }

    /// Returns the number of changed keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if no keys were changed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consumes the changes, yielding the underlying map.
    pub fn into_data(self) -> BTreeMap<Vec<u8>, Change> {
        self.data
    }

    pub(crate) fn range_from(&self, from: &[u8]) -> btree_map::Range<'_, Vec<u8>, Change> {
        self.data.range::<[u8], _>((Included(from), Unbounded))
    }
}

/// A set of changes that is applied to the backend atomically.
///
/// Changes from multiple keyspaces may be present; a keyspace without an
/// entry is untouched.
#[derive(Debug, Default)]
pub struct Patch {
    changes: HashMap<String, Changes>,
}

impl Patch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the patch contains no changes at all.
    pub fn is_empty(&self) -> bool {
        self.changes.values().all(Changes::is_empty)
    }

    /// Records a put of `value` under `key` in `keyspace`, replacing any
    /// previously recorded change for the same key.
    pub fn put(&mut self, keyspace: &str, key: Vec<u8>, value: Vec<u8>) {
        self.changes_mut(keyspace).data.insert(key, Change::Put(value));
    }

    /// Records a deletion of `key` in `keyspace`, replacing any previously
    /// recorded change for the same key.
    pub fn delete(&mut self, keyspace: &str, key: Vec<u8>) {
        self.changes_mut(keyspace).data.insert(key, Change::Delete);
    }

    /// Returns the change recorded for `key` in `keyspace`, if any.
    pub fn get(&self, keyspace: &str, key: &[u8]) -> Option<&Change> {
        self.changes.get(keyspace)?.data.get(key)
    }

    /// Returns the changes recorded for `keyspace`, if any.
    pub fn changes(&self, keyspace: &str) -> Option<&Changes> {
        self.changes.get(keyspace)
    }

    fn changes_mut(&mut self, keyspace: &str) -> &mut Changes {
        if !self.changes.contains_key(keyspace) {
            self.changes.insert(keyspace.to_owned(), Changes::default());
        }
        self.changes.get_mut(keyspace).expect("keyspace was just inserted")
    }
}

/// Iterator over the `Patch` data.
#[derive(Debug)]
pub struct PatchIterator {
    inner: hash_map::IntoIter<String, Changes>,
}

impl std::iter::Iterator for PatchIterator {
    type Item = (String, Changes);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl IntoIterator for Patch {
    type Item = (String, Changes);
    type IntoIter = PatchIterator;

    fn into_iter(self) -> Self::IntoIter {
        PatchIterator {
            inner: self.changes.into_iter(),
        }
    }
}

/// Overlays a transaction's pending changes on a backend iterator, so that a
/// scan observes the transaction's own writes: puts replace or insert
/// entries, deletions hide them.
///
/// Both sources yield keys in ascending order. The overlay keeps one merged
/// entry of owned lookahead, which also backs the bytes handed out by
/// `peek`/`next`.
pub(crate) struct MergeIter<'a, T: std::iter::Iterator> {
    stored: Iter<'a>,
    pending: Option<Peekable<T>>,
    /// Next merged entry, produced by `fill`.
    head: Option<(Vec<u8>, Vec<u8>)>,
    /// Entry most recently yielded by `next`; owns the bytes the returned
    /// borrows point into.
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl<'a, T> MergeIter<'a, T>
where
    T: std::iter::Iterator<Item = (&'a Vec<u8>, &'a Change)>,
{
    pub fn new(stored: Iter<'a>, pending: Option<T>) -> Self {
        MergeIter {
            stored,
            pending: pending.map(std::iter::Iterator::peekable),
            head: None,
            current: None,
        }
    }

    /// Computes the next merged entry into `head`, unless one is already
    /// waiting. A run of deletions can swallow any number of backend
    /// entries, hence the loop.
    fn fill(&mut self) {
        while self.head.is_none() {
            let (change_key, change) = match self
                .pending
                .as_mut()
                .and_then(|pending| pending.peek().copied())
            {
                Some(change) => change,
                None => {
                    // Nothing pending anymore: the backend passes through.
                    self.head = self.stored.next().map(|(k, v)| (k.to_vec(), v.to_vec()));
                    return;
                }
            };

            if let Some((key, value)) = self.stored.peek() {
                if key < change_key.as_slice() {
                    // The backend entry sorts before the change and is
                    // untouched by it.
                    self.head = Some((key.to_vec(), value.to_vec()));
                    self.stored.next();
                    return;
                }
                if key == change_key.as_slice() {
                    // The change shadows this backend entry.
                    self.stored.next();
                }
            }

            self.pending
                .as_mut()
                .expect("a change was just peeked")
                .next();
            match change {
                Change::Put(value) => {
                    self.head = Some((change_key.clone(), value.clone()));
                    return;
                }
                // Deleting a present or absent key produces no entry; keep
                // scanning.
                Change::Delete => {}
            }
        }
    }
}

impl<'a, T> Iterator for MergeIter<'a, T>
where
    T: std::iter::Iterator<Item = (&'a Vec<u8>, &'a Change)>,
{
    fn next(&mut self) -> Option<(&[u8], &[u8])> {
        self.fill();
        self.current = self.head.take();
        self.current
            .as_ref()
            .map(|(key, value)| (key.as_slice(), value.as_slice()))
    }

    fn peek(&mut self) -> Option<(&[u8], &[u8])> {
        self.fill();
        self.head
            .as_ref()
            .map(|(key, value)| (key.as_slice(), value.as_slice()))
    }
}
