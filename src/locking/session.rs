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

//! A database connection paired with the stack of locks it holds.
//!
//! All acquisitions made through one [`LockSession`] share its connection, so
//! nested requests for the same name are reentrant. Separate sessions contend
//! with each other exactly as separate database connections would.

use crate::backend::{AdvisoryConnection, UpgradeStyle};
use crate::config::LockSettings;
use crate::error::{LockError, Result};
use crate::locking::acquisition::LockAcquisitionRequest;
use crate::locking::handle::LockGuard;
use crate::locking::key::{LockKey, LockMode, LockName};
use crate::locking::scheduler::{self, Acquired};
use crate::locking::stack::{LockStack, ReleaseOutcome};
use crate::locking::timeout::LockTimeoutValue;
use crate::locking::wait_observer::LockWaitObserver;
use log::{debug, info, warn};
use std::sync::Arc;

/// Mode and timeout for a single acquisition.
///
/// A `None` timeout falls back to the session's configured default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockOptions {
    pub mode: LockMode,
    pub timeout: Option<LockTimeoutValue>,
}

impl LockOptions {
    pub fn exclusive() -> Self {
        Self {
            mode: LockMode::Exclusive,
            timeout: None,
        }
    }

    pub fn shared() -> Self {
        Self {
            mode: LockMode::Shared,
            timeout: None,
        }
    }

    pub fn with_mode(mut self, mode: LockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: LockTimeoutValue) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `None` waits forever; zero makes a single attempt.
    pub fn with_timeout_seconds(mut self, seconds: Option<f64>) -> Self {
        self.timeout = Some(LockTimeoutValue::from_seconds(seconds));
        self
    }

    pub fn no_wait(self) -> Self {
        self.with_timeout(LockTimeoutValue::NO_WAIT)
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::exclusive()
    }
}

impl From<LockMode> for LockOptions {
    fn from(mode: LockMode) -> Self {
        Self::exclusive().with_mode(mode)
    }
}

/// Snapshot of one lock held by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub name: LockName,
    pub key: LockKey,
    pub mode: LockMode,
    pub count: u32,
}

pub struct LockSession<C: AdvisoryConnection> {
    connection: C,
    stack: LockStack,
    settings: LockSettings,
    observer: Option<Arc<dyn LockWaitObserver>>,
}

impl<C: AdvisoryConnection> LockSession<C> {
    pub fn new(connection: C, settings: LockSettings) -> Self {
        let stack = LockStack::new(connection.connection_id());
        Self {
            connection,
            stack,
            settings,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LockWaitObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub(crate) fn set_observer(&mut self, observer: Option<Arc<dyn LockWaitObserver>>) {
        self.observer = observer;
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Direct access for running the guarded work's own queries.
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    pub fn key_for(&self, name: &LockName) -> LockKey {
        name.key(self.settings.key_namespace)
    }

    /// Acquires `name` and returns a guard that releases it when dropped.
    pub fn acquire<N: Into<LockName>>(
        &mut self,
        name: N,
        options: LockOptions,
    ) -> Result<LockGuard<'_, C>> {
        let name = name.into();
        let key = self.key_for(&name);
        self.lock(&name, key, options)?;
        Ok(LockGuard::new(self, name, key, options.mode))
    }

    /// Runs `work` while holding `name`, releasing it on every exit path.
    ///
    /// `work` is never run when the lock is not obtained. A failure to release
    /// afterwards is logged and does not replace the work's output.
    pub fn with_lock<N, T, F>(&mut self, name: N, options: LockOptions, work: F) -> Result<T>
    where
        N: Into<LockName>,
        F: FnOnce(&mut LockSession<C>) -> T,
    {
        let mut guard = self.acquire(name, options)?;
        let output = work(&mut *guard);
        let label = guard.name().to_string();
        if let Err(err) = guard.release() {
            warn!("Failed to release lock {label} after guarded work: {err}");
        }
        Ok(output)
    }

    /// Like [`LockSession::with_lock`], but a timeout yields `Ok(None)`.
    pub fn try_with_lock<N, T, F>(
        &mut self,
        name: N,
        options: LockOptions,
        work: F,
    ) -> Result<Option<T>>
    where
        N: Into<LockName>,
        F: FnOnce(&mut LockSession<C>) -> T,
    {
        match self.with_lock(name, options, work) {
            Ok(output) => Ok(Some(output)),
            Err(err) if err.is_timeout() => {
                debug!("Skipped guarded work: {err}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Turns a held shared lock into an exclusive one without releasing it.
    ///
    /// Already holding the lock exclusively is a no-op.
    pub fn upgrade<N: Into<LockName>>(
        &mut self,
        name: N,
        timeout: Option<LockTimeoutValue>,
    ) -> Result<()> {
        let name = name.into();
        let key = self.key_for(&name);
        let current = self.held_mode(&name, key)?;
        if current == LockMode::Exclusive {
            return Ok(());
        }

        let Some(style) = self.connection.capabilities().upgrade else {
            return Err(LockError::Unsupported {
                backend: self.connection.backend_name(),
                operation: "lock upgrade",
            });
        };

        let timeout = timeout.unwrap_or(self.settings.default_timeout);
        let mut request = LockAcquisitionRequest::new(name.clone(), key, LockMode::Exclusive, timeout)
            .with_backoff(self.settings.backoff.clone())
            .with_observer(self.observer.as_deref());
        scheduler::upgrade(&mut self.connection, &mut request)?;
        self.stack.note_upgraded(key, style)?;
        info!(
            "Upgraded lock {name} to exclusive on {} after {:.3}s",
            self.stack.connection(),
            request.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Returns an upgraded lock to shared mode.
    ///
    /// Only backends that stack the exclusive grant over the shared one can do
    /// this without a window in which the lock is not held.
    pub fn downgrade<N: Into<LockName>>(&mut self, name: N) -> Result<()> {
        let name = name.into();
        let key = self.key_for(&name);
        if self.connection.capabilities().upgrade != Some(UpgradeStyle::Stacked) {
            return Err(LockError::Unsupported {
                backend: self.connection.backend_name(),
                operation: "lock downgrade",
            });
        }

        self.stack.note_downgraded(key)?;
        if let Err(err) = self.connection.release(key, LockMode::Exclusive) {
            self.stack.note_upgraded(key, UpgradeStyle::Stacked)?;
            return Err(err);
        }
        info!("Downgraded lock {name} to shared on {}", self.stack.connection());
        Ok(())
    }

    /// Whether anyone, this session included, currently holds `name`.
    ///
    /// Informational only; the answer may be stale by the time it is used.
    pub fn lock_exists<N: Into<LockName>>(&mut self, name: N) -> Result<bool> {
        let name = name.into();
        let key = self.key_for(&name);
        self.connection.lock_exists(key)
    }

    /// Mode in which this session holds `name`, if at all.
    pub fn holds<N: Into<LockName>>(&self, name: N) -> Option<LockMode> {
        let name = name.into();
        self.stack
            .entry(self.key_for(&name))
            .map(|entry| entry.mode())
    }

    pub fn held_locks(&self) -> Vec<HeldLock> {
        let mut held: Vec<HeldLock> = self
            .stack
            .entries()
            .map(|entry| HeldLock {
                name: entry.name().clone(),
                key: self.key_for(entry.name()),
                mode: entry.mode(),
                count: entry.count(),
            })
            .collect();
        held.sort_by_key(|lock| lock.key);
        held
    }

    /// Releases anything still held and hands the connection back.
    pub fn into_connection(mut self) -> C {
        for (key, entry) in self.stack.drain() {
            warn!(
                "Lock {} still held {} time(s) when closing session; releasing",
                entry.name(),
                entry.count()
            );
            for mode in entry.grants().iter().rev() {
                if let Err(err) = self.connection.release(key, *mode) {
                    warn!("Failed to release {mode} lock {}: {err}", entry.name());
                }
            }
        }
        self.connection
    }

    fn lock(&mut self, name: &LockName, key: LockKey, options: LockOptions) -> Result<Acquired> {
        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        let mut request = LockAcquisitionRequest::new(name.clone(), key, options.mode, timeout)
            .with_backoff(self.settings.backoff.clone())
            .with_observer(self.observer.as_deref());
        let acquired = scheduler::acquire(&mut self.connection, &mut self.stack, &mut request)?;
        if acquired.reentrant {
            debug!(
                "Re-entered lock {name} on {} (depth {})",
                self.stack.connection(),
                acquired.hold_count
            );
        }
        Ok(acquired)
    }

    /// Drops one level of ownership, releasing the backend grants on the last.
    pub(crate) fn release_key(&mut self, key: LockKey) -> Result<()> {
        match self.stack.note_released(key)? {
            ReleaseOutcome::Retained { remaining } => {
                debug!(
                    "Lock {key} still held {remaining} time(s) on {}",
                    self.stack.connection()
                );
                Ok(())
            }
            ReleaseOutcome::Drained { grants } => {
                let mut first_error = None;
                for mode in grants.into_iter().rev() {
                    if let Err(err) = self.connection.release(key, mode) {
                        warn!("Failed to release {mode} grant on {key}: {err}");
                        first_error.get_or_insert(err);
                    }
                }
                match first_error {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }

    fn held_mode(&self, name: &LockName, key: LockKey) -> Result<LockMode> {
        self.stack.entry(key).map(|entry| entry.mode()).ok_or_else(|| {
            LockError::balance(name, format!("{} does not hold it", self.stack.connection()))
        })
    }
}
