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

//! In-process emulation of a session-level advisory lock server.
//!
//! The lock table follows PostgreSQL semantics: grants stack per session, a
//! session never conflicts with itself, and every grant needs its own release.
//! Capabilities can be narrowed to emulate engines that only offer exclusive,
//! non-blocking primitives.

use crate::backend::{
    AdvisoryConnection, BackendCapabilities, ConnectionId, ConnectionProvider, UpgradeStyle,
    unsupported,
};
use crate::error::{LockError, Result};
use crate::locking::key::{LockKey, LockMode};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

const BACKEND_NAME: &str = "memory";

#[derive(Debug, Default)]
struct Holders {
    shared: HashMap<ConnectionId, u32>,
    exclusive: HashMap<ConnectionId, u32>,
}

impl Holders {
    fn can_grant(&self, connection: ConnectionId, mode: LockMode) -> bool {
        let others = |grants: &HashMap<ConnectionId, u32>| grants.keys().any(|id| *id != connection);
        (!others(&self.shared) || mode.compatible_with(LockMode::Shared))
            && (!others(&self.exclusive) || mode.compatible_with(LockMode::Exclusive))
    }

    fn grants_mut(&mut self, mode: LockMode) -> &mut HashMap<ConnectionId, u32> {
        match mode {
            LockMode::Shared => &mut self.shared,
            LockMode::Exclusive => &mut self.exclusive,
        }
    }

    fn grant(&mut self, connection: ConnectionId, mode: LockMode) {
        *self.grants_mut(mode).entry(connection).or_insert(0) += 1;
    }

    fn revoke(&mut self, connection: ConnectionId, mode: LockMode) -> bool {
        let grants = self.grants_mut(mode);
        match grants.get_mut(&connection) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                grants.remove(&connection);
                true
            }
            None => false,
        }
    }

    fn drop_connection(&mut self, connection: ConnectionId) {
        self.shared.remove(&connection);
        self.exclusive.remove(&connection);
    }

    fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockTable {
    locks: Mutex<HashMap<LockKey, Holders>>,
    changed: Condvar,
}

impl LockTable {
    fn locks(&self) -> Result<MutexGuard<'_, HashMap<LockKey, Holders>>> {
        self.locks
            .lock()
            .map_err(|_| LockError::Backend("memory lock table is poisoned".to_string()))
    }
}

/// Shared lock table; every [`MemoryConnection`] created from one backend
/// contends on the same locks.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    table: Arc<LockTable>,
    capabilities: BackendCapabilities,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capabilities(BackendCapabilities::full())
    }

    /// Emulates an engine with only exclusive, poll-based locks.
    pub fn exclusive_only() -> Self {
        Self::with_capabilities(BackendCapabilities::exclusive_only())
    }

    pub fn with_capabilities(capabilities: BackendCapabilities) -> Self {
        Self {
            table: Arc::new(LockTable::default()),
            capabilities,
        }
    }

    pub fn connect(&self) -> Result<MemoryConnection> {
        Ok(MemoryConnection {
            id: ConnectionId::next(),
            table: Arc::clone(&self.table),
            capabilities: self.capabilities,
        })
    }

    /// Modes currently granted on `key` across all connections, one entry per
    /// grant, exclusive grants first.
    pub fn granted_modes(&self, key: LockKey) -> Result<Vec<LockMode>> {
        let locks = self.table.locks()?;
        let mut modes = Vec::new();
        if let Some(holders) = locks.get(&key) {
            let exclusive: u32 = holders.exclusive.values().sum();
            let shared: u32 = holders.shared.values().sum();
            modes.extend((0..exclusive).map(|_| LockMode::Exclusive));
            modes.extend((0..shared).map(|_| LockMode::Shared));
        }
        Ok(modes)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionProvider for MemoryBackend {
    type Connection = MemoryConnection;

    fn connect(&self) -> Result<MemoryConnection> {
        MemoryBackend::connect(self)
    }
}

/// One emulated session. Dropping it frees every grant it still holds.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    table: Arc<LockTable>,
    capabilities: BackendCapabilities,
}

impl MemoryConnection {
    fn ensure_mode(&self, mode: LockMode) -> Result<()> {
        if mode.is_shared() && !self.capabilities.shared {
            return Err(unsupported(BACKEND_NAME, "shared locks"));
        }
        Ok(())
    }

    fn ensure_upgrade(&self) -> Result<UpgradeStyle> {
        self.capabilities
            .upgrade
            .ok_or_else(|| unsupported(BACKEND_NAME, "lock upgrade"))
    }

    fn try_grant(&self, locks: &mut HashMap<LockKey, Holders>, key: LockKey, mode: LockMode) -> bool {
        let holders = locks.entry(key).or_default();
        if holders.can_grant(self.id, mode) {
            holders.grant(self.id, mode);
            true
        } else {
            if holders.is_empty() {
                locks.remove(&key);
            }
            false
        }
    }

    fn try_convert(&self, locks: &mut HashMap<LockKey, Holders>, key: LockKey) -> Result<bool> {
        let style = self.ensure_upgrade()?;
        let holders = match locks.get_mut(&key) {
            Some(holders) if holders.shared.contains_key(&self.id) => holders,
            _ => {
                return Err(LockError::Backend(format!(
                    "{} holds no shared lock on {key} to upgrade",
                    self.id
                )));
            }
        };
        if !holders.can_grant(self.id, LockMode::Exclusive) {
            return Ok(false);
        }
        if style == UpgradeStyle::InPlace {
            holders.revoke(self.id, LockMode::Shared);
        }
        holders.grant(self.id, LockMode::Exclusive);
        Ok(true)
    }
}

impl AdvisoryConnection for MemoryConnection {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn try_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<bool> {
        self.ensure_mode(mode)?;
        let mut locks = self.table.locks()?;
        Ok(self.try_grant(&mut locks, key, mode))
    }

    fn blocking_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<()> {
        self.ensure_mode(mode)?;
        if !self.capabilities.native_blocking {
            return Err(unsupported(BACKEND_NAME, "blocking acquisition"));
        }
        let mut locks = self.table.locks()?;
        while !self.try_grant(&mut locks, key, mode) {
            locks = self
                .table
                .changed
                .wait(locks)
                .map_err(|_| LockError::Backend("memory lock table is poisoned".to_string()))?;
        }
        Ok(())
    }

    fn release(&mut self, key: LockKey, mode: LockMode) -> Result<()> {
        let mut locks = self.table.locks()?;
        let released = match locks.get_mut(&key) {
            Some(holders) => {
                let released = holders.revoke(self.id, mode);
                if holders.is_empty() {
                    locks.remove(&key);
                }
                released
            }
            None => false,
        };
        drop(locks);

        if !released {
            return Err(LockError::Backend(format!(
                "{} does not hold a {mode} lock on {key}",
                self.id
            )));
        }
        self.table.changed.notify_all();
        Ok(())
    }

    fn lock_exists(&mut self, key: LockKey) -> Result<bool> {
        let locks = self.table.locks()?;
        Ok(locks.get(&key).is_some_and(|holders| !holders.is_empty()))
    }

    fn try_upgrade(&mut self, key: LockKey) -> Result<bool> {
        let mut locks = self.table.locks()?;
        self.try_convert(&mut locks, key)
    }

    fn blocking_upgrade(&mut self, key: LockKey) -> Result<()> {
        if !self.capabilities.native_blocking {
            return Err(unsupported(BACKEND_NAME, "blocking acquisition"));
        }
        let mut locks = self.table.locks()?;
        while !self.try_convert(&mut locks, key)? {
            locks = self
                .table
                .changed
                .wait(locks)
                .map_err(|_| LockError::Backend("memory lock table is poisoned".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        match self.table.locks.lock() {
            Ok(mut locks) => {
                let before = locks.len();
                for holders in locks.values_mut() {
                    holders.drop_connection(self.id);
                }
                locks.retain(|_, holders| !holders.is_empty());
                if locks.len() != before {
                    debug!("Closed {} with locks still held; grants discarded", self.id);
                }
            }
            Err(_) => warn!("Lock table poisoned while closing {}", self.id),
        }
        self.table.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: LockKey = LockKey::new(0, 42);

    #[test]
    fn exclusive_grants_exclude_other_connections() {
        let backend = MemoryBackend::new();
        let mut one = backend.connect().unwrap();
        let mut two = backend.connect().unwrap();

        assert!(one.try_acquire(KEY, LockMode::Exclusive).unwrap());
        assert!(!two.try_acquire(KEY, LockMode::Exclusive).unwrap());
        assert!(!two.try_acquire(KEY, LockMode::Shared).unwrap());

        one.release(KEY, LockMode::Exclusive).unwrap();
        assert!(two.try_acquire(KEY, LockMode::Shared).unwrap());
    }

    #[test]
    fn shared_grants_coexist() {
        let backend = MemoryBackend::new();
        let mut one = backend.connect().unwrap();
        let mut two = backend.connect().unwrap();

        assert!(one.try_acquire(KEY, LockMode::Shared).unwrap());
        assert!(two.try_acquire(KEY, LockMode::Shared).unwrap());
        assert_eq!(
            backend.granted_modes(KEY).unwrap(),
            vec![LockMode::Shared, LockMode::Shared]
        );
    }

    #[test]
    fn grants_stack_within_one_connection() {
        let backend = MemoryBackend::new();
        let mut one = backend.connect().unwrap();

        assert!(one.try_acquire(KEY, LockMode::Exclusive).unwrap());
        assert!(one.try_acquire(KEY, LockMode::Exclusive).unwrap());
        one.release(KEY, LockMode::Exclusive).unwrap();
        assert!(one.lock_exists(KEY).unwrap());
        one.release(KEY, LockMode::Exclusive).unwrap();
        assert!(!one.lock_exists(KEY).unwrap());
    }

    #[test]
    fn release_without_grant_is_an_error() {
        let backend = MemoryBackend::new();
        let mut one = backend.connect().unwrap();
        let err = one.release(KEY, LockMode::Shared).unwrap_err();
        assert!(err.to_string().contains("does not hold a shared lock"));
    }

    #[test]
    fn stacked_upgrade_keeps_shared_grant() {
        let backend = MemoryBackend::new();
        let mut one = backend.connect().unwrap();
        assert!(one.try_acquire(KEY, LockMode::Shared).unwrap());
        assert!(one.try_upgrade(KEY).unwrap());
        assert_eq!(
            backend.granted_modes(KEY).unwrap(),
            vec![LockMode::Exclusive, LockMode::Shared]
        );
    }

    #[test]
    fn in_place_upgrade_converts_grant() {
        let backend = MemoryBackend::with_capabilities(BackendCapabilities {
            upgrade: Some(UpgradeStyle::InPlace),
            ..BackendCapabilities::full()
        });
        let mut one = backend.connect().unwrap();
        assert!(one.try_acquire(KEY, LockMode::Shared).unwrap());
        assert!(one.try_upgrade(KEY).unwrap());
        assert_eq!(backend.granted_modes(KEY).unwrap(), vec![LockMode::Exclusive]);
    }

    #[test]
    fn upgrade_waits_for_other_shared_holders() {
        let backend = MemoryBackend::new();
        let mut one = backend.connect().unwrap();
        let mut two = backend.connect().unwrap();
        assert!(one.try_acquire(KEY, LockMode::Shared).unwrap());
        assert!(two.try_acquire(KEY, LockMode::Shared).unwrap());
        assert!(!one.try_upgrade(KEY).unwrap());
    }

    #[test]
    fn exclusive_only_rejects_shared_and_blocking() {
        let backend = MemoryBackend::exclusive_only();
        let mut one = backend.connect().unwrap();
        assert!(one.try_acquire(KEY, LockMode::Shared).unwrap_err().is_capability());
        assert!(
            one.blocking_acquire(KEY, LockMode::Exclusive)
                .unwrap_err()
                .is_capability()
        );
        assert!(one.try_upgrade(KEY).unwrap_err().is_capability());
    }

    #[test]
    fn dropping_connection_frees_its_grants() {
        let backend = MemoryBackend::new();
        let mut one = backend.connect().unwrap();
        let mut two = backend.connect().unwrap();
        assert!(one.try_acquire(KEY, LockMode::Exclusive).unwrap());
        drop(one);
        assert!(two.try_acquire(KEY, LockMode::Exclusive).unwrap());
    }

    #[test]
    fn blocking_acquire_wakes_on_release() {
        let backend = MemoryBackend::new();
        let mut one = backend.connect().unwrap();
        let mut two = backend.connect().unwrap();
        assert!(one.try_acquire(KEY, LockMode::Exclusive).unwrap());

        let waiter = std::thread::spawn(move || {
            two.blocking_acquire(KEY, LockMode::Exclusive).unwrap();
            two
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        one.release(KEY, LockMode::Exclusive).unwrap();

        let mut two = waiter.join().unwrap();
        two.release(KEY, LockMode::Exclusive).unwrap();
    }
}
