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

//! The classes catalog.
//!
//! Each distinct class descriptor written to the store is assigned a small
//! integer id on first encounter; payloads embed that id instead of the
//! descriptor. Rows live in the store's metadata keyspace under the
//! assigning transaction, so a fresh id becomes permanent exactly when that
//! transaction commits. A process-wide cache fronts the rows; additions made
//! by a transaction enter the cache only after its commit.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, RwLock};

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use darkstar_datastore::{DataStore, TxnHandle, TxnId};

use crate::errors::DataError;

/// Small integer id standing in for a class descriptor in payloads.
pub type ClassId = u32;

/// Identifies a managed-object class and the version of its serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassDescriptor {
    /// Fully qualified class name.
    pub name: Cow<'static, str>,
    /// Serial version of the encoding.
    pub version: u32,
}

impl ClassDescriptor {
    /// Creates a descriptor; usable in constant position.
    pub const fn new(name: &'static str, version: u32) -> Self {
        Self {
            name: Cow::Borrowed(name),
            version,
        }
    }

    pub(crate) fn to_row_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0_u8; 4];
        LittleEndian::write_u32(&mut bytes, self.version);
        bytes.extend_from_slice(self.name.as_bytes());
        bytes
    }

    pub(crate) fn from_row_bytes(bytes: &[u8]) -> Result<Self, DataError> {
        if bytes.len() < 4 {
            return Err(DataError::SerializationFormat(
                "truncated class descriptor row".to_owned(),
            ));
        }
        let version = LittleEndian::read_u32(&bytes[..4]);
        let name = String::from_utf8(bytes[4..].to_vec()).map_err(|_| {
            DataError::SerializationFormat("class name is not valid UTF-8".to_owned())
        })?;
        Ok(Self {
            name: Cow::Owned(name),
            version,
        })
    }
}

impl fmt::Display for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.version)
    }
}

#[derive(Debug, Default)]
struct CacheMaps {
    by_descriptor: HashMap<ClassDescriptor, ClassId>,
    by_id: HashMap<ClassId, ClassDescriptor>,
}

/// Process-wide catalog of class descriptors, shared by all transactions of
/// one service.
#[derive(Debug)]
pub(crate) struct ClassesCatalog {
    store: DataStore,
    cache: RwLock<CacheMaps>,
    /// Ids assigned by transactions that have not committed yet.
    pending: Mutex<HashMap<TxnId, Vec<(ClassDescriptor, ClassId)>>>,
}

impl ClassesCatalog {
    pub fn new(store: DataStore) -> Self {
        Self {
            store,
            cache: RwLock::new(CacheMaps::default()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the id of `descriptor`, assigning one under `txn` on first
    /// encounter.
    pub fn class_id(&self, txn: TxnHandle, descriptor: &ClassDescriptor) -> Result<ClassId, DataError> {
        if let Some(&id) = self
            .cache
            .read()
            .expect("classes cache poisoned")
            .by_descriptor
            .get(descriptor)
        {
            return Ok(id);
        }

        let (id, fresh) = self.store.get_class_id(txn, &descriptor.to_row_bytes())?;
        if fresh {
            trace!("{} assigned class id {} to {}", txn, id, descriptor);
            let mut pending = self.pending.lock().expect("classes catalog poisoned");
            pending
                .entry(txn.id())
                .or_insert_with(Vec::new)
                .push((descriptor.clone(), id));
        } else {
            self.insert_cached(descriptor.clone(), id);
        }
        Ok(id)
    }

    /// Returns the descriptor registered under `class_id`.
    ///
    /// An unknown id is a serialization format error: payloads are the only
    /// place ids come from, and a payload with an unregistered id cannot be
    /// interpreted.
    pub fn descriptor(&self, txn: TxnHandle, class_id: ClassId) -> Result<ClassDescriptor, DataError> {
        if let Some(descriptor) = self
            .cache
            .read()
            .expect("classes cache poisoned")
            .by_id
            .get(&class_id)
        {
            return Ok(descriptor.clone());
        }

        {
            let pending = self.pending.lock().expect("classes catalog poisoned");
            if let Some(additions) = pending.get(&txn.id()) {
                if let Some((descriptor, _)) = additions.iter().find(|(_, id)| *id == class_id) {
                    return Ok(descriptor.clone());
                }
            }
        }

        match self.store.get_class_descriptor(txn, class_id)? {
            Some(bytes) => {
                let descriptor = ClassDescriptor::from_row_bytes(&bytes)?;
                self.insert_cached(descriptor.clone(), class_id);
                Ok(descriptor)
            }
            None => Err(DataError::SerializationFormat(format!(
                "unknown class id {}",
                class_id
            ))),
        }
    }

    /// Publishes the ids assigned by `txn` to the shared cache.
    pub fn note_commit(&self, txn: TxnId) {
        let additions = self.pending.lock().expect("classes catalog poisoned").remove(&txn);
        if let Some(additions) = additions {
            for (descriptor, id) in additions {
                self.insert_cached(descriptor, id);
            }
        }
    }

    /// Discards the ids assigned by `txn`.
    pub fn note_abort(&self, txn: TxnId) {
        self.pending.lock().expect("classes catalog poisoned").remove(&txn);
    }

    fn insert_cached(&self, descriptor: ClassDescriptor, id: ClassId) {
        let mut cache = self.cache.write().expect("classes cache poisoned");
        cache.by_descriptor.insert(descriptor.clone(), id);
        cache.by_id.insert(id, descriptor);
    }
}
