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

//! The managed-object model.
//!
//! A managed object is an application value whose identity, persistence and
//! lifecycle are controlled by the data service. Application code holds a
//! [`Managed<T>`] handle; the value inside is read and mutated through
//! ordinary lock guards, and identity is the handle's allocation, so two
//! resolves of the same object id within one transaction yield handles to
//! the same value.
//!
//! Persisted payloads carry a small class id (assigned through the classes
//! catalog) followed by the value bytes, so payloads never embed class
//! names.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use darkstar_datastore::BinaryValue;

use crate::data::classes::{ClassDescriptor, ClassId};
use crate::errors::DataError;

/// A value that can live in the data service.
///
/// The value must be serializable in [`BinaryValue`] form and carry a stable
/// [`ClassDescriptor`]; bump the descriptor version when the serialized form
/// changes.
pub trait ManagedObject: BinaryValue + Send + Sync + 'static {
    /// Class descriptor recorded with every persisted payload of this type.
    const CLASS: ClassDescriptor;
}

/// A handle to a managed object.
///
/// Cloning the handle does not copy the value: clones share the same cell,
/// and mutations through any clone are visible through all of them. Managed
/// identity is cell identity.
pub struct Managed<T: ManagedObject> {
    cell: Arc<RwLock<T>>,
}

impl<T: ManagedObject> Managed<T> {
    /// Wraps a fresh value. The object stays transient until it is handed
    /// to `create_reference` or `set_binding`.
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(RwLock::new(value)),
        }
    }

    /// Locks the value for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell.read().expect("managed object lock poisoned")
    }

    /// Locks the value for writing.
    ///
    /// Note that mutating a value does not by itself mark the object dirty;
    /// use `mark_for_update` (or resolve the reference for update) so the
    /// write lock is taken eagerly. With modification detection enabled a
    /// silent mutation is still persisted, at the cost of a byte-level
    /// compare at prepare.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.cell.write().expect("managed object lock poisoned")
    }

    /// Whether two handles denote the same managed object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.cell) as usize
    }
}

impl<T: ManagedObject> Clone for Managed<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: ManagedObject + fmt::Debug> fmt::Debug for Managed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Managed").field(&*self.read()).finish()
    }
}

/// Type-erased view of a cached managed object, used by the context to
/// serialize entries at prepare without knowing their concrete types.
pub(crate) trait ErasedManaged: Send + Sync {
    fn class(&self) -> ClassDescriptor;
    fn serialize(&self) -> Vec<u8>;
    fn as_any(&self) -> &dyn Any;
    fn identity(&self) -> usize;
}

pub(crate) struct ErasedCell<T: ManagedObject>(pub(crate) Managed<T>);

impl<T: ManagedObject> ErasedManaged for ErasedCell<T> {
    fn class(&self) -> ClassDescriptor {
        T::CLASS
    }

    fn serialize(&self) -> Vec<u8> {
        self.0.read().to_bytes()
    }

    fn as_any(&self) -> &dyn Any {
        &self.0
    }

    fn identity(&self) -> usize {
        self.0.identity()
    }
}

/// Prepends the class id to the serialized value bytes.
pub(crate) fn encode_payload(class_id: ClassId, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(body.len() + 5);
    leb128::write::unsigned(&mut payload, u64::from(class_id))
        .expect("writing to a Vec cannot fail");
    payload.extend_from_slice(body);
    payload
}

/// Splits a payload into its class id and value bytes.
pub(crate) fn decode_payload(payload: &[u8]) -> Result<(ClassId, &[u8]), DataError> {
    let mut rest = payload;
    let raw = leb128::read::unsigned(&mut rest)
        .map_err(|err| DataError::SerializationFormat(format!("bad class id prefix: {}", err)))?;
    if raw == 0 || raw > u64::from(u32::max_value()) {
        return Err(DataError::SerializationFormat(format!(
            "class id {} out of range",
            raw
        )));
    }
    Ok((raw as ClassId, rest))
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Blob(Vec<u8>);

    impl BinaryValue for Blob {
        fn to_bytes(&self) -> Vec<u8> {
            self.0.clone()
        }

        fn from_bytes(bytes: Cow<'_, [u8]>) -> anyhow::Result<Self> {
            Ok(Blob(bytes.into_owned()))
        }
    }

    impl ManagedObject for Blob {
        const CLASS: ClassDescriptor = ClassDescriptor::new("test.Blob", 1);
    }

    #[test]
    fn clones_share_the_cell() {
        let a = Managed::new(Blob(vec![1]));
        let b = a.clone();
        b.write().0.push(2);
        assert_eq!(a.read().0, vec![1, 2]);
        assert!(a.ptr_eq(&b));
        assert_eq!(a.identity(), b.identity());

        let c = Managed::new(Blob(vec![1, 2]));
        assert!(!a.ptr_eq(&c));
    }

    #[test]
    fn payload_round_trip() {
        let payload = encode_payload(7, b"value");
        let (class_id, body) = decode_payload(&payload).unwrap();
        assert_eq!(class_id, 7);
        assert_eq!(body, b"value");
    }

    #[test]
    fn zero_class_id_is_rejected() {
        let payload = encode_payload(0, b"");
        assert!(matches!(
            decode_payload(&payload),
            Err(DataError::SerializationFormat(_))
        ));
        assert!(decode_payload(b"").is_err());
    }
}
