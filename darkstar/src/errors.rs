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

//! The public error taxonomy of the data service.
//!
//! Errors fall into five kinds (see [`ErrorKind`]). Only retryable errors
//! are handled by the coordinator's retry envelope; everything else escapes
//! the task to the application. Fatal errors additionally transition the
//! service towards shutdown.
//!
//! There is no null-argument error: the absence of nulls is enforced by the
//! type system, and optional inputs (such as the start name of an
//! enumeration) are expressed with `Option`.

use log::Level;
use thiserror::Error;

use darkstar_datastore::{ConflictCause, ObjectId, StoreError};

/// Classification of a [`DataError`], driving retry behavior and log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transaction may succeed if re-executed from scratch; the
    /// coordinator discards the attempt and retries.
    Retryable,
    /// The caller passed arguments that can never work.
    CallerBug,
    /// The requested name or object does not exist.
    DataAbsent,
    /// The service is not in a state that accepts the call.
    Lifecycle,
    /// Persistent state is unusable; the service shuts down.
    Fatal,
}

/// The error type of data service operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    /// A raw object id outside the valid range was supplied.
    #[error("invalid object id {0}")]
    InvalidId(u64),

    /// The object bound under the requested name has a different class.
    #[error("type mismatch: expected class `{expected}`, found `{actual}`")]
    TypeMismatch {
        /// The class the caller asked for.
        expected: String,
        /// The class actually recorded in the payload.
        actual: String,
    },

    /// The object cannot be serialized.
    ///
    /// With the typed API this cannot arise for ordinary managed objects,
    /// whose serializability is a trait bound; the variant remains for
    /// decorators and foreign front-ends that take erased objects.
    #[error("object is not serializable: {0}")]
    NotSerializable(String),

    /// The object is not managed by the current transaction's context.
    #[error("object is not managed")]
    ObjectNotManaged,

    /// The service configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The name has no binding.
    #[error("name `{0}` is not bound")]
    NameNotBound(String),

    /// The object does not exist, or was removed.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    /// The transaction lost a conflict with a concurrent transaction.
    #[error("transaction conflict ({0})")]
    TransactionConflict(ConflictCause),

    /// The transaction exceeded its deadline.
    #[error("transaction timed out")]
    TransactionTimeout,

    /// The retry budget was exhausted; the last retryable cause is recorded.
    #[error("transaction aborted after {attempts} attempts: {cause}")]
    TransactionAborted {
        /// How many times the task was attempted.
        attempts: u32,
        /// Description of the last retryable failure.
        cause: String,
    },

    /// The service has not been initialized yet.
    #[error("service is not ready")]
    ServiceNotReady,

    /// The service no longer accepts new transactions.
    #[error("service is shutting down")]
    ServiceShuttingDown,

    /// The service has been shut down.
    #[error("service is shut down")]
    ServiceShutDown,

    /// `shutdown` was called again after a successful shutdown.
    #[error("service is already shut down")]
    AlreadyShutDown,

    /// The operation requires an active transaction.
    #[error("transaction is not active")]
    TransactionNotActive,

    /// Persisted state cannot be interpreted.
    #[error("storage is corrupt: {0}")]
    StorageCorrupt(String),

    /// The persisted layout major version differs from the code.
    #[error(
        "incompatible data version: stored {stored_major}.{stored_minor}, \
         code {code_major}.{code_minor}"
    )]
    VersionIncompatible {
        /// Major version found in the store.
        stored_major: u16,
        /// Minor version found in the store.
        stored_minor: u16,
        /// Major version of the running code.
        code_major: u16,
        /// Minor version of the running code.
        code_minor: u16,
    },

    /// A payload or registry row cannot be decoded.
    #[error("serialization format error: {0}")]
    SerializationFormat(String),
}

impl DataError {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        use DataError::*;
        match self {
            TransactionConflict(_) | TransactionTimeout => ErrorKind::Retryable,
            InvalidId(_) | TypeMismatch { .. } | NotSerializable(_) | ObjectNotManaged
            | InvalidConfig(_) => ErrorKind::CallerBug,
            NameNotBound(_) | ObjectNotFound(_) => ErrorKind::DataAbsent,
            TransactionAborted { .. } | ServiceNotReady | ServiceShuttingDown | ServiceShutDown
            | AlreadyShutDown | TransactionNotActive => ErrorKind::Lifecycle,
            StorageCorrupt(_) | VersionIncompatible { .. } | SerializationFormat(_) => {
                ErrorKind::Fatal
            }
        }
    }

    /// Whether the enclosing transaction may succeed on a fresh attempt
    /// without caller intervention.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// The log level matching this error's kind.
    pub fn log_level(&self) -> Level {
        match self.kind() {
            ErrorKind::Retryable => Level::Debug,
            ErrorKind::CallerBug | ErrorKind::DataAbsent => Level::Info,
            ErrorKind::Lifecycle => Level::Warn,
            ErrorKind::Fatal => Level::Error,
        }
    }
}

impl From<StoreError> for DataError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ObjectNotFound(id) => DataError::ObjectNotFound(id),
            StoreError::NameNotBound(name) => DataError::NameNotBound(name),
            StoreError::Conflict(cause) => DataError::TransactionConflict(cause),
            StoreError::Timeout => DataError::TransactionTimeout,
            StoreError::NotActive => DataError::TransactionNotActive,
            StoreError::ShuttingDown => DataError::ServiceShuttingDown,
            StoreError::ShutDown => DataError::ServiceShutDown,
            StoreError::AlreadyShutDown => DataError::AlreadyShutDown,
            StoreError::Corrupt(message) => DataError::StorageCorrupt(message),
        }
    }
}
