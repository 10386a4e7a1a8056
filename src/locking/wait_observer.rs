// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Observer interfaces for lock wait instrumentation.
//!
//! Observers decouple the acquisition scheduler from whatever the embedding
//! application wants to report about contention, so callers can surface wait
//! information without duplicating polling logic.

use crate::locking::key::LockName;
use crate::locking::timeout::LockTimeoutValue;
use log::{debug, info, warn};
use std::time::Duration;

/// Observer hooks for lock wait events.
pub trait LockWaitObserver: Send + Sync {
    fn on_wait_start(&self, _name: &LockName, _timeout: LockTimeoutValue) {}

    fn on_retry(
        &self,
        _name: &LockName,
        _attempt: usize,
        _elapsed: Duration,
        _remaining: Option<Duration>,
    ) {
    }

    fn on_acquired(&self, _name: &LockName, _waited: Duration) {}

    fn on_timeout(&self, _name: &LockName, _waited: Duration) {}
}

/// Observer implementation that performs no work.
#[derive(Debug, Default)]
pub struct NoopLockWaitObserver;

impl LockWaitObserver for NoopLockWaitObserver {}

/// Reports contention through the `log` facade.
#[derive(Debug, Default)]
pub struct LoggingWaitObserver;

impl LockWaitObserver for LoggingWaitObserver {
    fn on_wait_start(&self, name: &LockName, timeout: LockTimeoutValue) {
        info!("Waiting for lock {name} (timeout: {timeout})");
    }

    fn on_retry(
        &self,
        name: &LockName,
        attempt: usize,
        elapsed: Duration,
        remaining: Option<Duration>,
    ) {
        match remaining {
            Some(left) => debug!(
                "Lock {name} still busy after attempt {attempt} ({:.3}s elapsed, {:.3}s left)",
                elapsed.as_secs_f64(),
                left.as_secs_f64()
            ),
            None => debug!(
                "Lock {name} still busy after attempt {attempt} ({:.3}s elapsed)",
                elapsed.as_secs_f64()
            ),
        }
    }

    fn on_acquired(&self, name: &LockName, waited: Duration) {
        if !waited.is_zero() {
            info!("Acquired lock {name} after waiting {:.3}s", waited.as_secs_f64());
        }
    }

    fn on_timeout(&self, name: &LockName, waited: Duration) {
        warn!("Gave up on lock {name} after {:.3}s", waited.as_secs_f64());
    }
}
