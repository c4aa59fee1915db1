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

//! Transaction participants.
//!
//! Anything that joins a transaction and wants a say in its outcome
//! implements [`Participant`]: the data service context is one, and session,
//! channel or task services register their own. Participants are driven in
//! registration order through the two phases of commit.

use std::fmt;

use darkstar_datastore::Prepare;

use crate::errors::DataError;

/// A participant's vote in the first phase of two-phase commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    /// The participant took no writes; its commit call is skipped.
    ReadOnly,
    /// The participant has prepared its writes and awaits commit.
    Prepared,
}

impl From<Prepare> for PrepareVote {
    fn from(prepare: Prepare) -> Self {
        match prepare {
            Prepare::ReadOnly => PrepareVote::ReadOnly,
            Prepare::Prepared => PrepareVote::Prepared,
        }
    }
}

/// A subsystem taking part in a transaction's two-phase commit.
///
/// `prepare` may fail, which aborts the whole transaction; `commit` and
/// `abort` are expected to cope on their own and merely log internal
/// problems.
pub trait Participant: Send + Sync {
    /// Participant name, for diagnostics.
    fn name(&self) -> &str;

    /// First phase: flush state, acquire final locks, vote.
    fn prepare(&self) -> Result<PrepareVote, DataError>;

    /// Second phase: make the writes durable.
    fn commit(&self);

    /// Drop all effects of the transaction.
    fn abort(&self);
}

impl fmt::Debug for dyn Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant").field("name", &self.name()).finish()
    }
}
