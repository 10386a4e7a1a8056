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

//! Lock names and their mapping onto backend key space.
//!
//! Database advisory locks are addressed by integers, so every [`LockName`]
//! is reduced to a [`LockKey`] pair of 31-bit values: a namespace and a value.
//! Text names are hashed with SHA-256 and truncated, which is stable across
//! processes and releases but not collision free. Two distinct text names that
//! truncate to the same value address the same database lock and will contend
//! with each other. Callers that cannot tolerate this should use
//! [`LockName::Id`] or [`LockName::Composite`] with explicit numbers.

use sha2::{Digest, Sha256};
use std::fmt;

const KEY_MASK: u32 = 0x7fff_ffff;

/// Indicates whether a lock allows concurrent holders or enforces exclusivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn from_shared(shared: bool) -> Self {
        if shared {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        }
    }

    pub fn is_shared(self) -> bool {
        matches!(self, LockMode::Shared)
    }

    /// Returns true when holding `self` already satisfies a request for `requested`.
    pub fn covers(self, requested: LockMode) -> bool {
        matches!(
            (self, requested),
            (LockMode::Exclusive, _) | (LockMode::Shared, LockMode::Shared)
        )
    }

    /// Whether two holders on different connections may coexist.
    pub fn compatible_with(self, other: LockMode) -> bool {
        self.is_shared() && other.is_shared()
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// Name identifying an advisory lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockName {
    /// Free-form name, hashed into the configured namespace.
    Text(String),
    /// Explicit numeric value within the configured namespace.
    Id(i32),
    /// Fully explicit key pair, independent of the configured namespace.
    Composite { namespace: i32, value: i32 },
}

impl LockName {
    pub fn composite(namespace: i32, value: i32) -> Self {
        LockName::Composite { namespace, value }
    }

    /// Maps the name to its backend key using `namespace` for non-composite names.
    pub fn key(&self, namespace: i32) -> LockKey {
        match self {
            LockName::Text(text) => LockKey::new(namespace, stable_hash(text)),
            LockName::Id(value) => LockKey::new(namespace, *value),
            LockName::Composite { namespace, value } => LockKey::new(*namespace, *value),
        }
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockName::Text(text) => write!(f, "'{text}'"),
            LockName::Id(value) => write!(f, "#{value}"),
            LockName::Composite { namespace, value } => write!(f, "({namespace}, {value})"),
        }
    }
}

impl From<&str> for LockName {
    fn from(value: &str) -> Self {
        LockName::Text(value.to_string())
    }
}

impl From<String> for LockName {
    fn from(value: String) -> Self {
        LockName::Text(value)
    }
}

impl From<&String> for LockName {
    fn from(value: &String) -> Self {
        LockName::Text(value.clone())
    }
}

impl From<i32> for LockName {
    fn from(value: i32) -> Self {
        LockName::Id(value)
    }
}

impl From<(i32, i32)> for LockName {
    fn from((namespace, value): (i32, i32)) -> Self {
        LockName::Composite { namespace, value }
    }
}

/// Numeric identity of a lock as seen by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    namespace: i32,
    value: i32,
}

impl LockKey {
    pub const fn new(namespace: i32, value: i32) -> Self {
        Self { namespace, value }
    }

    pub fn namespace(&self) -> i32 {
        self.namespace
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    /// Single 64-bit form for backends with one bigint key.
    pub fn as_i64(&self) -> i64 {
        ((self.namespace as i64) << 32) | (self.value as u32 as i64)
    }

    /// String form for backends that lock on names (MySQL `GET_LOCK`).
    pub fn as_lock_string(&self) -> String {
        format!("dblock:{}:{}", self.namespace, self.value)
    }

    /// File name used by filesystem backends.
    pub fn file_name(&self) -> String {
        format!("{}-{}.lock", self.namespace, self.value)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.value)
    }
}

/// Deterministic 31-bit hash of a lock name.
pub fn stable_hash(text: &str) -> i32 {
    let digest = Sha256::digest(text.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (prefix & KEY_MASK) as i32
}
