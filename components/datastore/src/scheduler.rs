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

//! The scheduler contract for recurring background work.
//!
//! The store does not own threads for its maintenance duties (deadline
//! sweeps, checkpoints); instead it asks the host for them through the
//! [`Scheduler`] trait and keeps the returned handles for its lifetime.
//! [`ThreadScheduler`] is the plain thread-per-task implementation used by
//! standalone deployments and tests.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::warn;

/// A recurring background task.
pub type Task = Box<dyn FnMut() + Send>;

/// A cancellable handle to a scheduled recurring task.
pub trait ScheduledHandle: Send {
    /// Cancels the task. Idempotent. The task stops after its current run,
    /// if one is in progress.
    fn cancel(&self);
}

/// Host-provided scheduler for recurring background work.
///
/// The host invokes the task roughly every `period`; precise timing is not
/// part of the contract.
pub trait Scheduler: Send + Sync {
    /// Schedules `task` to run repeatedly with the given period.
    fn schedule_recurring(&self, task: Task, period: Duration) -> Box<dyn ScheduledHandle>;
}

/// A scheduler that runs every task on its own thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadScheduler;

impl ThreadScheduler {
    /// Creates a scheduler.
    pub fn new() -> Self {
        Self::default()
    }
}

struct ThreadHandle {
    shared: Arc<(Mutex<bool>, Condvar)>,
}

impl ScheduledHandle for ThreadHandle {
    fn cancel(&self) {
        let (cancelled, cv) = &*self.shared;
        *cancelled.lock().expect("scheduler state poisoned") = true;
        cv.notify_all();
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_recurring(&self, mut task: Task, period: Duration) -> Box<dyn ScheduledHandle> {
        let shared = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_shared = Arc::clone(&shared);

        let spawned = thread::Builder::new()
            .name("darkstar-recurring".to_owned())
            .spawn(move || {
                let (cancelled, cv) = &*thread_shared;
                loop {
                    let mut guard = cancelled.lock().expect("scheduler state poisoned");
                    let deadline = Instant::now() + period;
                    while !*guard {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        let (next, _) = cv
                            .wait_timeout(guard, deadline - now)
                            .expect("scheduler state poisoned");
                        guard = next;
                    }
                    if *guard {
                        return;
                    }
                    drop(guard);
                    task();
                }
            });
        if let Err(err) = spawned {
            warn!("failed to spawn a recurring task thread: {}", err);
        }

        Box::new(ThreadHandle { shared })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn task_runs_repeatedly_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let scheduler = ThreadScheduler::new();
        let handle = scheduler.schedule_recurring(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(5),
        );

        while runs.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        handle.cancel();
        let after_cancel = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        // One run may already be in flight when the task is cancelled.
        assert!(runs.load(Ordering::SeqCst) <= after_cancel + 1);
    }
}
