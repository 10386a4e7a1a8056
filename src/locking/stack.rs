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

//! Per-connection bookkeeping of held locks.
//!
//! The stack is owned by exactly one connection and is the only place hold
//! counts change. An entry exists only while its count is at least one, and a
//! key is held in a single effective mode at a time. Each entry also remembers
//! the grants actually taken at the database so the last release can undo
//! them precisely.

use crate::backend::{ConnectionId, UpgradeStyle};
use crate::error::{LockError, Result};
use crate::locking::key::{LockKey, LockMode, LockName};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStackEntry {
    name: LockName,
    mode: LockMode,
    count: u32,
    grants: Vec<LockMode>,
    upgraded_at: Option<u32>,
}

impl LockStackEntry {
    pub fn name(&self) -> &LockName {
        &self.name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Backend grants in acquisition order.
    pub fn grants(&self) -> &[LockMode] {
        &self.grants
    }
}

/// Result of dropping one level of ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Outer scopes still hold the lock.
    Retained { remaining: u32 },
    /// The entry is gone; these backend grants must now be released, last first.
    Drained { grants: Vec<LockMode> },
}

impl ReleaseOutcome {
    pub fn remaining(&self) -> u32 {
        match self {
            ReleaseOutcome::Retained { remaining } => *remaining,
            ReleaseOutcome::Drained { .. } => 0,
        }
    }
}

#[derive(Debug)]
pub struct LockStack {
    connection: ConnectionId,
    entries: HashMap<LockKey, LockStackEntry>,
}

impl LockStack {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            entries: HashMap::new(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn entry(&self, key: LockKey) -> Option<&LockStackEntry> {
        self.entries.get(&key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LockStackEntry> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether a request for `mode` is already satisfied on this connection.
    pub fn already_held(&self, key: LockKey, mode: LockMode) -> bool {
        self.entries
            .get(&key)
            .is_some_and(|entry| entry.mode.covers(mode))
    }

    /// Records one more level of ownership and returns the new hold count.
    ///
    /// A fresh entry records a single backend grant in `mode`. Re-entry in a
    /// mode the entry does not cover is rejected; that transition must go
    /// through [`LockStack::note_upgraded`].
    pub fn note_acquired(&mut self, key: LockKey, name: &LockName, mode: LockMode) -> Result<u32> {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                if !entry.mode.covers(mode) {
                    return Err(LockError::balance(
                        name,
                        format!(
                            "{} holds it {} and cannot re-enter it {mode} without an upgrade",
                            self.connection, entry.mode
                        ),
                    ));
                }
                entry.count += 1;
                Ok(entry.count)
            }
            None => {
                self.entries.insert(
                    key,
                    LockStackEntry {
                        name: name.clone(),
                        mode,
                        count: 1,
                        grants: vec![mode],
                        upgraded_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    pub fn note_released(&mut self, key: LockKey) -> Result<ReleaseOutcome> {
        let Some(entry) = self.entries.get_mut(&key) else {
            return Err(LockError::balance(
                key,
                format!("{} released a lock it does not hold", self.connection),
            ));
        };

        entry.count -= 1;
        if let Some(upgraded_at) = entry.upgraded_at {
            entry.upgraded_at = Some(upgraded_at.min(entry.count));
        }
        if entry.count > 0 {
            return Ok(ReleaseOutcome::Retained {
                remaining: entry.count,
            });
        }

        let entry = self
            .entries
            .remove(&key)
            .ok_or_else(|| LockError::balance(key, "entry vanished during release"))?;
        Ok(ReleaseOutcome::Drained {
            grants: entry.grants,
        })
    }

    /// Switches a shared entry to exclusive after the backend granted it.
    pub fn note_upgraded(&mut self, key: LockKey, style: UpgradeStyle) -> Result<()> {
        let entry = self.shared_entry_mut(key)?;
        entry.mode = LockMode::Exclusive;
        entry.upgraded_at = Some(entry.count);
        match style {
            UpgradeStyle::Stacked => entry.grants.push(LockMode::Exclusive),
            UpgradeStyle::InPlace => entry.grants = vec![LockMode::Exclusive],
        }
        Ok(())
    }

    /// Reverts a stacked upgrade; the caller releases the exclusive grant.
    ///
    /// Scopes entered after the upgrade may rely on exclusivity, so the hold
    /// count must be back at its value from the time of the upgrade.
    pub fn note_downgraded(&mut self, key: LockKey) -> Result<()> {
        let connection = self.connection;
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| LockError::balance(key, format!("{connection} does not hold it")))?;
        if entry.mode != LockMode::Exclusive || entry.grants != [LockMode::Shared, LockMode::Exclusive]
        {
            return Err(LockError::balance(
                &entry.name,
                "only a stacked upgrade of a shared lock can be downgraded",
            ));
        }
        let later_scopes = entry
            .count
            .saturating_sub(entry.upgraded_at.unwrap_or(entry.count));
        if later_scopes > 0 {
            return Err(LockError::balance(
                &entry.name,
                format!("{later_scopes} scope(s) entered after the upgrade still hold it exclusively"),
            ));
        }
        entry.grants.pop();
        entry.mode = LockMode::Shared;
        entry.upgraded_at = None;
        Ok(())
    }

    fn shared_entry_mut(&mut self, key: LockKey) -> Result<&mut LockStackEntry> {
        let connection = self.connection;
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| LockError::balance(key, format!("{connection} does not hold it")))?;
        if entry.mode != LockMode::Shared {
            return Err(LockError::balance(
                &entry.name,
                format!("{connection} holds it {}, not shared", entry.mode),
            ));
        }
        Ok(entry)
    }

    /// Removes every entry, returning them for cleanup.
    pub(crate) fn drain(&mut self) -> Vec<(LockKey, LockStackEntry)> {
        self.entries.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: LockKey = LockKey::new(0, 1);

    fn stack() -> LockStack {
        LockStack::new(ConnectionId::from_raw(1))
    }

    fn name() -> LockName {
        LockName::from("job:42")
    }

    #[test]
    fn nested_acquisitions_drain_on_last_release() {
        let mut stack = stack();
        assert_eq!(stack.note_acquired(KEY, &name(), LockMode::Exclusive).unwrap(), 1);
        assert_eq!(stack.note_acquired(KEY, &name(), LockMode::Exclusive).unwrap(), 2);

        assert_eq!(
            stack.note_released(KEY).unwrap(),
            ReleaseOutcome::Retained { remaining: 1 }
        );
        assert_eq!(
            stack.note_released(KEY).unwrap(),
            ReleaseOutcome::Drained {
                grants: vec![LockMode::Exclusive]
            }
        );
        assert!(stack.is_empty());
    }

    #[test]
    fn release_without_entry_is_balance_error() {
        let mut stack = stack();
        let err = stack.note_released(KEY).unwrap_err();
        assert_eq!(err.kind(), crate::error::LockErrorKind::Balance);
    }

    #[test]
    fn exclusive_entry_covers_shared_reentry() {
        let mut stack = stack();
        stack.note_acquired(KEY, &name(), LockMode::Exclusive).unwrap();
        assert!(stack.already_held(KEY, LockMode::Shared));
        assert_eq!(stack.note_acquired(KEY, &name(), LockMode::Shared).unwrap(), 2);
        assert_eq!(stack.entry(KEY).unwrap().mode(), LockMode::Exclusive);
    }

    #[test]
    fn shared_entry_rejects_exclusive_reentry() {
        let mut stack = stack();
        stack.note_acquired(KEY, &name(), LockMode::Shared).unwrap();
        assert!(!stack.already_held(KEY, LockMode::Exclusive));
        let err = stack
            .note_acquired(KEY, &name(), LockMode::Exclusive)
            .unwrap_err();
        assert!(err.to_string().contains("without an upgrade"));
        assert_eq!(stack.entry(KEY).unwrap().count(), 1);
    }

    #[test]
    fn stacked_upgrade_records_both_grants() {
        let mut stack = stack();
        stack.note_acquired(KEY, &name(), LockMode::Shared).unwrap();
        stack.note_upgraded(KEY, UpgradeStyle::Stacked).unwrap();

        let entry = stack.entry(KEY).unwrap();
        assert_eq!(entry.mode(), LockMode::Exclusive);
        assert_eq!(entry.grants(), &[LockMode::Shared, LockMode::Exclusive]);

        stack.note_downgraded(KEY).unwrap();
        assert_eq!(stack.entry(KEY).unwrap().grants(), &[LockMode::Shared]);
    }

    #[test]
    fn downgrade_waits_for_scopes_entered_after_upgrade() {
        let mut stack = stack();
        stack.note_acquired(KEY, &name(), LockMode::Shared).unwrap();
        stack.note_upgraded(KEY, UpgradeStyle::Stacked).unwrap();
        stack.note_acquired(KEY, &name(), LockMode::Exclusive).unwrap();

        let err = stack.note_downgraded(KEY).unwrap_err();
        assert_eq!(err.kind(), crate::error::LockErrorKind::Balance);
        let entry = stack.entry(KEY).unwrap();
        assert_eq!(entry.mode(), LockMode::Exclusive);
        assert_eq!(entry.grants(), &[LockMode::Shared, LockMode::Exclusive]);

        stack.note_released(KEY).unwrap();
        stack.note_downgraded(KEY).unwrap();
        assert_eq!(stack.entry(KEY).unwrap().mode(), LockMode::Shared);
    }

    #[test]
    fn upgrade_depth_follows_outer_releases() {
        let mut stack = stack();
        stack.note_acquired(KEY, &name(), LockMode::Shared).unwrap();
        stack.note_acquired(KEY, &name(), LockMode::Shared).unwrap();
        stack.note_upgraded(KEY, UpgradeStyle::Stacked).unwrap();
        stack.note_released(KEY).unwrap();
        stack.note_acquired(KEY, &name(), LockMode::Exclusive).unwrap();

        assert!(stack.note_downgraded(KEY).is_err());
        stack.note_released(KEY).unwrap();
        stack.note_downgraded(KEY).unwrap();
    }

    #[test]
    fn in_place_upgrade_replaces_grant() {
        let mut stack = stack();
        stack.note_acquired(KEY, &name(), LockMode::Shared).unwrap();
        stack.note_upgraded(KEY, UpgradeStyle::InPlace).unwrap();
        assert_eq!(stack.entry(KEY).unwrap().grants(), &[LockMode::Exclusive]);
        assert!(stack.note_downgraded(KEY).is_err());
    }

    #[test]
    fn upgrade_requires_shared_entry() {
        let mut stack = stack();
        assert!(stack.note_upgraded(KEY, UpgradeStyle::Stacked).is_err());
        stack.note_acquired(KEY, &name(), LockMode::Exclusive).unwrap();
        assert!(stack.note_upgraded(KEY, UpgradeStyle::Stacked).is_err());
    }
}
