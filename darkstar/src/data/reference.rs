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

//! Managed references.
//!
//! A reference owns no object bytes: it carries the stable object id plus a
//! weak back-reference to the context that created it, which is never used
//! once that context ends. Resolution goes through the current
//! transaction's context, so a reference deserialized in a later
//! transaction hits the store on first resolve.
//!
//! Serializing a reference writes only its id; cross-object edges in a
//! serialized graph are therefore ids, never payloads, which is also what
//! keeps cyclic object graphs free of ownership cycles in memory.

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Weak;

use darkstar_datastore::{BinaryValue, ObjectId};

use crate::data::context::ContextInner;
use crate::data::object::{Managed, ManagedObject};
use crate::data;
use crate::errors::DataError;

/// A serializable handle to a managed object.
///
/// Two references are equal exactly when their ids are equal.
pub struct ManagedRef<T: ManagedObject> {
    id: ObjectId,
    ctx: Weak<ContextInner>,
    _object: PhantomData<fn() -> T>,
}

impl<T: ManagedObject> ManagedRef<T> {
    pub(crate) fn new(id: ObjectId, ctx: Weak<ContextInner>) -> Self {
        Self {
            id,
            ctx,
            _object: PhantomData,
        }
    }

    /// The stable identifier of the referenced object.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Resolves the reference for reading.
    pub fn get(&self) -> Result<Managed<T>, DataError> {
        self.resolve(false)
    }

    /// Resolves the reference for update, taking the write lock eagerly.
    pub fn get_for_update(&self) -> Result<Managed<T>, DataError> {
        self.resolve(true)
    }

    fn resolve(&self, for_update: bool) -> Result<Managed<T>, DataError> {
        // The creating context serves resolves for as long as its
        // transaction runs; afterwards (or for a deserialized reference) the
        // current transaction's context takes over.
        if let Some(ctx) = self.ctx.upgrade() {
            if !ctx.ended() {
                return ctx.resolve(self.id, for_update);
            }
        }
        let service = data::current_service().ok_or(DataError::TransactionNotActive)?;
        let ctx = service.join()?;
        ctx.resolve(self.id, for_update)
    }
}

impl<T: ManagedObject> Clone for ManagedRef<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            ctx: self.ctx.clone(),
            _object: PhantomData,
        }
    }
}

impl<T: ManagedObject> fmt::Debug for ManagedRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedRef").field("id", &self.id).finish()
    }
}

impl<T: ManagedObject> PartialEq for ManagedRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: ManagedObject> Eq for ManagedRef<T> {}

impl<T: ManagedObject> Hash for ManagedRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T: ManagedObject> BinaryValue for ManagedRef<T> {
    fn to_bytes(&self) -> Vec<u8> {
        self.id.to_bytes()
    }

    fn from_bytes(bytes: Cow<'_, [u8]>) -> anyhow::Result<Self> {
        let id = ObjectId::from_bytes(bytes)?;
        Ok(Self::new(id, Weak::new()))
    }
}
