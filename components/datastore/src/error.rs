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

//! Error types for the object store.

use std::fmt;

use thiserror::Error;

use crate::db::ObjectId;

/// The reason a transaction lost a conflict with a concurrent transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictCause {
    /// The transaction gave up waiting for a lock held by another transaction.
    LockTimeout,
    /// The transaction was picked as the victim of a lock-wait cycle.
    Deadlock,
}

impl fmt::Display for ConflictCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictCause::LockTimeout => f.write_str("lock wait timed out"),
            ConflictCause::Deadlock => f.write_str("deadlock victim"),
        }
    }
}

/// The error type for [`DataStore`](crate::DataStore) operations.
///
/// Errors for which [`is_retryable`](StoreError::is_retryable) returns `true`
/// indicate that the enclosing transaction may succeed if it is re-executed
/// from the beginning; all other errors are surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The object does not exist, or was removed by a committed transaction.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    /// The name has no binding.
    #[error("name `{0}` is not bound")]
    NameNotBound(String),

    /// The transaction lost a conflict with a concurrent transaction.
    #[error("transaction conflict ({0})")]
    Conflict(ConflictCause),

    /// The transaction exceeded its deadline.
    #[error("transaction timed out")]
    Timeout,

    /// The transaction has already been prepared, committed or aborted.
    #[error("transaction is not active")]
    NotActive,

    /// The store is draining in-flight transactions before closing.
    #[error("store is shutting down")]
    ShuttingDown,

    /// The store has been shut down.
    #[error("store is shut down")]
    ShutDown,

    /// `shutdown` was called again after a successful shutdown.
    #[error("store is already shut down")]
    AlreadyShutDown,

    /// Persisted state cannot be interpreted.
    #[error("storage is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Returns `true` if the enclosing transaction may succeed when run again
    /// from scratch without any caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StoreError::Conflict(ConflictCause::LockTimeout).is_retryable());
        assert!(StoreError::Conflict(ConflictCause::Deadlock).is_retryable());
        assert!(StoreError::Timeout.is_retryable());

        assert!(!StoreError::NotActive.is_retryable());
        assert!(!StoreError::NameNotBound("x".to_owned()).is_retryable());
        assert!(!StoreError::Corrupt("bad row".to_owned()).is_retryable());
    }
}
