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

mod context;

pub use context::ErrorContext;

use thiserror::Error;

/// Broad classification of a [`LockError`] so callers can decide whether to
/// retry, abort or report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErrorKind {
    /// The backend cannot provide the requested mode or transition.
    Capability,
    /// The deadline elapsed before the lock could be obtained.
    Timeout,
    /// Acquire/release bookkeeping was violated by the caller.
    Balance,
    /// The underlying database or operating system call failed.
    Backend,
    /// Configuration could not be loaded or is invalid.
    Config,
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Timed out after {waited_secs:.3}s waiting for lock {name} ({attempts} attempts)")]
    Timeout {
        name: String,
        waited_secs: f64,
        attempts: usize,
    },

    #[error("Lock bookkeeping violated for {name}: {details}")]
    Balance { name: String, details: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Postgres(#[from] postgres::Error),

    #[cfg(feature = "mysql")]
    #[error(transparent)]
    Mysql(#[from] mysql::Error),
}

impl LockError {
    pub fn kind(&self) -> LockErrorKind {
        match self {
            LockError::Unsupported { .. } => LockErrorKind::Capability,
            LockError::Timeout { .. } => LockErrorKind::Timeout,
            LockError::Balance { .. } => LockErrorKind::Balance,
            LockError::Config(_) => LockErrorKind::Config,
            LockError::Backend(_) | LockError::Io(_) => LockErrorKind::Backend,
            #[cfg(feature = "postgres")]
            LockError::Postgres(_) => LockErrorKind::Backend,
            #[cfg(feature = "mysql")]
            LockError::Mysql(_) => LockErrorKind::Backend,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == LockErrorKind::Timeout
    }

    pub fn is_capability(&self) -> bool {
        self.kind() == LockErrorKind::Capability
    }

    pub(crate) fn balance(name: impl ToString, details: impl Into<String>) -> Self {
        LockError::Balance {
            name: name.to_string(),
            details: details.into(),
        }
    }
}

impl From<config::ConfigError> for LockError {
    fn from(err: config::ConfigError) -> Self {
        LockError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
