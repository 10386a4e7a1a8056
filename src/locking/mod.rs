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

pub mod acquisition;
pub mod handle;
pub mod key;
pub mod locker;
pub mod scheduler;
pub mod session;
pub mod stack;
pub mod timeout;
pub mod wait_observer;

pub use acquisition::{LockAcquisitionRequest, LockTimeoutBudget, PollingBackoff};
pub use handle::LockGuard;
pub use key::{LockKey, LockMode, LockName, stable_hash};
pub use locker::AdvisoryLocker;
pub use scheduler::{Acquired, AcquisitionState};
pub use session::{HeldLock, LockOptions, LockSession};
pub use stack::{LockStack, LockStackEntry, ReleaseOutcome};
pub use timeout::{LockTimeoutParseError, LockTimeoutValue, parse_timeout};
pub use wait_observer::{LockWaitObserver, LoggingWaitObserver, NoopLockWaitObserver};
