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

//! A definition of the `BinaryKey` trait.
//!
//! The store keys on three kinds of entities, and each has an
//! implementation here: object ids (`u64`), class registry ids (`u32`) and
//! binding names (`str`).

use byteorder::{BigEndian, ByteOrder};

/// A type that can be (de)serialized as a key in the object store.
///
/// Since keys are sorted in their serialized form, the big-endian encoding
/// is used for unsigned integer types so that the serialized order matches
/// the natural order.
pub trait BinaryKey: ToOwned {
    /// Returns the size of the serialized key in bytes.
    fn size(&self) -> usize;

    /// Serializes the key into the specified buffer of bytes.
    ///
    /// The caller must guarantee that the size of the buffer is equal to the
    /// precalculated size of the serialized key. Returns the number of
    /// written bytes.
    fn write(&self, buffer: &mut [u8]) -> usize;

    /// Deserializes the key from the specified buffer of bytes.
    fn read(buffer: &[u8]) -> Self::Owned;

    /// Serializes the key into a freshly allocated byte vector.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0_u8; self.size()];
        self.write(&mut buffer);
        buffer
    }
}

impl BinaryKey for u32 {
    fn size(&self) -> usize {
        4
    }

    fn write(&self, buffer: &mut [u8]) -> usize {
        BigEndian::write_u32(buffer, *self);
        self.size()
    }

    fn read(buffer: &[u8]) -> Self::Owned {
        BigEndian::read_u32(buffer)
    }
}

impl BinaryKey for u64 {
    fn size(&self) -> usize {
        8
    }

    fn write(&self, buffer: &mut [u8]) -> usize {
        BigEndian::write_u64(buffer, *self);
        self.size()
    }

    fn read(buffer: &[u8]) -> Self::Owned {
        BigEndian::read_u64(buffer)
    }
}

/// Uses UTF-8 string serialization; lexicographic byte order coincides with
/// the order of the strings themselves.
impl BinaryKey for str {
    fn size(&self) -> usize {
        self.len()
    }

    fn write(&self, buffer: &mut [u8]) -> usize {
        buffer.copy_from_slice(self.as_bytes());
        self.size()
    }

    fn read(buffer: &[u8]) -> Self::Owned {
        String::from_utf8(buffer.to_vec()).expect("failed to convert bytes to utf8")
    }
}
