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

//! Named advisory locks backed by a shared database.
//!
//! Locks are owned by a database connection. A [`LockSession`] pairs one
//! connection with the record of what it holds, which makes repeated
//! acquisition of the same name on that connection reentrant. Mutual
//! exclusion itself is delegated to the backend: PostgreSQL advisory locks,
//! MySQL named locks, OS file locks, or an in-process table.
//!
//! ```no_run
//! use dblock::{AdvisoryLocker, LockOptions, LockingConfig};
//!
//! # fn main() -> dblock::Result<()> {
//! let locker = AdvisoryLocker::from_config(&LockingConfig::load(None)?)?;
//! let mut session = locker.session()?;
//! session.with_lock("job:42", LockOptions::exclusive(), |_| {
//!     // runs while no other connection holds "job:42"
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod locking;

pub use backend::{AdvisoryConnection, BackendCapabilities, BackendProvider, ConnectionProvider};
pub use config::{BackendKind, LockSettings, LockingConfig};
pub use error::{LockError, LockErrorKind, Result};
pub use locking::{
    AdvisoryLocker, LockGuard, LockMode, LockName, LockOptions, LockSession, LockTimeoutValue,
};
