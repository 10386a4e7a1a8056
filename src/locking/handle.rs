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

use crate::backend::AdvisoryConnection;
use crate::error::Result;
use crate::locking::key::{LockKey, LockMode, LockName};
use crate::locking::session::LockSession;
use log::{debug, warn};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// RAII guard for one level of ownership of a named lock.
///
/// The guard borrows its session mutably and dereferences to it, so nested
/// acquisitions are made through the guard itself and must be released
/// before it.
pub struct LockGuard<'s, C: AdvisoryConnection> {
    session: &'s mut LockSession<C>,
    name: LockName,
    key: LockKey,
    mode: LockMode,
    acquired_at: Instant,
    released: bool,
}

impl<'s, C: AdvisoryConnection> LockGuard<'s, C> {
    pub(crate) fn new(
        session: &'s mut LockSession<C>,
        name: LockName,
        key: LockKey,
        mode: LockMode,
    ) -> Self {
        Self {
            session,
            name,
            key,
            mode,
            acquired_at: Instant::now(),
            released: false,
        }
    }

    pub fn name(&self) -> &LockName {
        &self.name
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    /// Mode that was requested for this level of ownership.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Releases this level of ownership, reporting any backend failure.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        self.session.release_key(self.key)?;
        debug!(
            "Released {} lock {} after {:.3}s",
            self.mode,
            self.name,
            duration_to_secs(self.acquired_at.elapsed())
        );
        Ok(())
    }
}

impl<C: AdvisoryConnection> fmt::Debug for LockGuard<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("released", &self.released)
            .finish()
    }
}

impl<C: AdvisoryConnection> Deref for LockGuard<'_, C> {
    type Target = LockSession<C>;

    fn deref(&self) -> &LockSession<C> {
        &*self.session
    }
}

impl<C: AdvisoryConnection> DerefMut for LockGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut LockSession<C> {
        &mut *self.session
    }
}

impl<C: AdvisoryConnection> Drop for LockGuard<'_, C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.release_inner() {
            warn!("Failed to release lock {} during drop: {err}", self.name);
        }
    }
}

fn duration_to_secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use crate::backend::MemoryBackend;
    use crate::config::LockSettings;
    use crate::locking::key::{LockMode, LockName};
    use crate::locking::session::{LockOptions, LockSession};

    #[test]
    fn guard_release_allows_reacquire() {
        let backend = MemoryBackend::new();
        let mut first = LockSession::new(backend.connect().unwrap(), LockSettings::default());
        let mut second = LockSession::new(backend.connect().unwrap(), LockSettings::default());

        {
            let guard = first.acquire("job:42", LockOptions::exclusive()).unwrap();
            assert_eq!(guard.mode(), LockMode::Exclusive);
            assert_eq!(guard.name(), &LockName::from("job:42"));
        }
        let reacquired = second
            .acquire("job:42", LockOptions::exclusive().no_wait())
            .unwrap();
        drop(reacquired);
    }

    #[test]
    fn explicit_release_returns_ok() {
        let backend = MemoryBackend::new();
        let mut session = LockSession::new(backend.connect().unwrap(), LockSettings::default());
        let guard = session.acquire("job:42", LockOptions::shared()).unwrap();
        let key = guard.key();
        guard.release().unwrap();
        assert!(backend.granted_modes(key).unwrap().is_empty());
        assert!(session.held_locks().is_empty());
    }

    #[test]
    fn inner_guard_keeps_outer_hold() {
        let backend = MemoryBackend::new();
        let mut session = LockSession::new(backend.connect().unwrap(), LockSettings::default());
        let mut outer = session.acquire("job:42", LockOptions::exclusive()).unwrap();
        let key = outer.key();
        {
            let inner = outer.acquire("job:42", LockOptions::exclusive()).unwrap();
            assert_eq!(inner.held_locks()[0].count, 2);
        }
        assert_eq!(outer.held_locks()[0].count, 1);
        assert_eq!(backend.granted_modes(key).unwrap(), vec![LockMode::Exclusive]);
        outer.release().unwrap();
        assert!(backend.granted_modes(key).unwrap().is_empty());
    }
}
