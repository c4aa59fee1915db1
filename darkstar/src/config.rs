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

//! Service configuration.
//!
//! The structs here are the configuration contract; loading them from files
//! is the host's business.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use darkstar_datastore::StoreConfig;

use crate::errors::DataError;

/// The smallest accepted [`disconnect_delay`](ServiceConfig::disconnect_delay).
pub const MIN_DISCONNECT_DELAY: Duration = Duration::from_millis(200);

/// Configuration of the retry envelope around application tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Upper bound on attempts for one task.
    pub max_attempts: u32,
    /// Wall-clock budget for retrying one task; exhaustion converts the
    /// last retryable error into a non-retryable abort.
    pub budget: Duration,
    /// Base delay of the exponential backoff between attempts.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            budget: Duration::from_secs(10),
            backoff: Duration::from_millis(1),
        }
    }
}

/// Configuration of the data service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Name of the application; identifies the namespace root. Required.
    pub app_name: String,
    /// Whether to snapshot clean reads and compare at prepare, persisting
    /// objects that were mutated without `mark_for_update`.
    pub detect_modifications: bool,
    /// Operations between reference-table consistency checks; zero disables
    /// the check.
    pub debug_check_interval: u32,
    /// Minimum delay before a disconnected client is dropped. Reserved for
    /// the session layer; validated here because it ships in the same
    /// configuration block.
    pub disconnect_delay: Duration,
    /// Retry envelope settings.
    pub retry: RetryConfig,
    /// Settings passed through to the store.
    pub store: StoreConfig,
}

impl ServiceConfig {
    /// Creates a configuration with the given application name and defaults
    /// for everything else.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            detect_modifications: true,
            debug_check_interval: 0,
            disconnect_delay: Duration::from_secs(1),
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), DataError> {
        if self.app_name.is_empty() {
            return Err(DataError::InvalidConfig("app_name must not be empty".to_owned()));
        }
        if self.disconnect_delay < MIN_DISCONNECT_DELAY {
            return Err(DataError::InvalidConfig(format!(
                "disconnect_delay must be at least {:?}",
                MIN_DISCONNECT_DELAY
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(DataError::InvalidConfig(
                "retry.max_attempts must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}
