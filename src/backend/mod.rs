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

//! Database adapters that provide the actual mutual-exclusion primitive.
//!
//! Every adapter wraps one physical connection (or session) and exposes the
//! same small capability surface. Ownership of any lock taken through an
//! [`AdvisoryConnection`] is scoped to that connection: it cannot be released
//! from another connection and disappears when the connection is dropped.

pub mod file;
pub mod memory;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::config::{BackendKind, LockingConfig};
use crate::error::{LockError, Result};
use crate::locking::key::{LockKey, LockMode};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use file::{FileBackend, FileConnection};
pub use memory::{MemoryBackend, MemoryConnection};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the physical session that owns held locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates a process-unique identity for adapters without a server-side id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// How a backend turns a held shared lock into an exclusive one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStyle {
    /// An exclusive grant is stacked on top of the shared one; both must be released.
    Stacked,
    /// The shared grant is converted and a single exclusive release frees it.
    InPlace,
}

/// What an adapter can do natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub shared: bool,
    pub native_blocking: bool,
    pub upgrade: Option<UpgradeStyle>,
}

impl BackendCapabilities {
    pub const fn exclusive_only() -> Self {
        Self {
            shared: false,
            native_blocking: false,
            upgrade: None,
        }
    }

    pub const fn full() -> Self {
        Self {
            shared: true,
            native_blocking: true,
            upgrade: Some(UpgradeStyle::Stacked),
        }
    }
}

/// One database connection able to take advisory locks.
pub trait AdvisoryConnection {
    /// Short engine label used in logs and capability errors.
    fn backend_name(&self) -> &'static str;

    fn connection_id(&self) -> ConnectionId;

    fn capabilities(&self) -> BackendCapabilities;

    /// Attempts the lock without waiting.
    fn try_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<bool>;

    /// Waits until the lock is granted. Only called when
    /// `capabilities().native_blocking` is true.
    fn blocking_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<()>;

    /// Releases one grant previously obtained in `mode`.
    fn release(&mut self, key: LockKey, mode: LockMode) -> Result<()>;

    /// Best-effort probe of whether any connection, this one included, holds `key`.
    fn lock_exists(&mut self, key: LockKey) -> Result<bool>;

    /// Attempts to turn a held shared grant into an exclusive one without waiting.
    fn try_upgrade(&mut self, _key: LockKey) -> Result<bool> {
        Err(unsupported(self.backend_name(), "lock upgrade"))
    }

    /// Waits until the held shared grant can be upgraded.
    fn blocking_upgrade(&mut self, _key: LockKey) -> Result<()> {
        Err(unsupported(self.backend_name(), "lock upgrade"))
    }
}

impl<T: AdvisoryConnection + ?Sized> AdvisoryConnection for Box<T> {
    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }

    fn connection_id(&self) -> ConnectionId {
        (**self).connection_id()
    }

    fn capabilities(&self) -> BackendCapabilities {
        (**self).capabilities()
    }

    fn try_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<bool> {
        (**self).try_acquire(key, mode)
    }

    fn blocking_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<()> {
        (**self).blocking_acquire(key, mode)
    }

    fn release(&mut self, key: LockKey, mode: LockMode) -> Result<()> {
        (**self).release(key, mode)
    }

    fn lock_exists(&mut self, key: LockKey) -> Result<bool> {
        (**self).lock_exists(key)
    }

    fn try_upgrade(&mut self, key: LockKey) -> Result<bool> {
        (**self).try_upgrade(key)
    }

    fn blocking_upgrade(&mut self, key: LockKey) -> Result<()> {
        (**self).blocking_upgrade(key)
    }
}

/// Hands out connections for lock sessions. Pooling, if any, lives behind this.
pub trait ConnectionProvider {
    type Connection: AdvisoryConnection;

    fn connect(&self) -> Result<Self::Connection>;
}

pub type DynConnection = Box<dyn AdvisoryConnection + Send>;

/// Backend chosen once from configuration.
#[derive(Debug, Clone)]
pub enum BackendProvider {
    Memory(MemoryBackend),
    File(FileBackend),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PostgresProvider),
    #[cfg(feature = "mysql")]
    Mysql(mysql::MysqlProvider),
}

impl BackendProvider {
    pub fn from_config(config: &LockingConfig) -> Result<Self> {
        match config.backend {
            BackendKind::Memory => Ok(BackendProvider::Memory(MemoryBackend::new())),
            BackendKind::File => Ok(BackendProvider::File(FileBackend::new(config.lock_dir()))),
            BackendKind::Postgres => {
                #[cfg(feature = "postgres")]
                {
                    let url = required_url(config)?;
                    Ok(BackendProvider::Postgres(postgres::PostgresProvider::new(url)))
                }
                #[cfg(not(feature = "postgres"))]
                {
                    Err(LockError::Config(
                        "backend 'postgres' requires the `postgres` cargo feature".to_string(),
                    ))
                }
            }
            BackendKind::Mysql => {
                #[cfg(feature = "mysql")]
                {
                    let url = required_url(config)?;
                    Ok(BackendProvider::Mysql(mysql::MysqlProvider::new(url)))
                }
                #[cfg(not(feature = "mysql"))]
                {
                    Err(LockError::Config(
                        "backend 'mysql' requires the `mysql` cargo feature".to_string(),
                    ))
                }
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendProvider::Memory(_) => BackendKind::Memory,
            BackendProvider::File(_) => BackendKind::File,
            #[cfg(feature = "postgres")]
            BackendProvider::Postgres(_) => BackendKind::Postgres,
            #[cfg(feature = "mysql")]
            BackendProvider::Mysql(_) => BackendKind::Mysql,
        }
    }
}

impl ConnectionProvider for BackendProvider {
    type Connection = DynConnection;

    fn connect(&self) -> Result<DynConnection> {
        Ok(match self {
            BackendProvider::Memory(backend) => Box::new(backend.connect()?),
            BackendProvider::File(backend) => Box::new(backend.connect()?),
            #[cfg(feature = "postgres")]
            BackendProvider::Postgres(provider) => Box::new(provider.connect()?),
            #[cfg(feature = "mysql")]
            BackendProvider::Mysql(provider) => Box::new(provider.connect()?),
        })
    }
}

#[cfg(any(feature = "postgres", feature = "mysql"))]
fn required_url(config: &LockingConfig) -> Result<String> {
    config.url.clone().ok_or_else(|| {
        LockError::Config(format!(
            "backend '{}' requires a connection url",
            config.backend
        ))
    })
}

pub(crate) fn unsupported(backend: &'static str, operation: &'static str) -> LockError {
    LockError::Unsupported { backend, operation }
}
