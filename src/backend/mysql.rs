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

//! MySQL / MariaDB named locks (`GET_LOCK` family).
//!
//! Named locks are exclusive only. `GET_LOCK` with a negative timeout waits
//! indefinitely, which requires MySQL 5.7.5 or MariaDB 10.0.2 and later.

use crate::backend::{AdvisoryConnection, BackendCapabilities, ConnectionId, ConnectionProvider};
use crate::error::{LockError, Result};
use crate::locking::key::{LockKey, LockMode};
use ::mysql::prelude::Queryable;
use ::mysql::{Conn, Opts};
use log::debug;

const BACKEND_NAME: &str = "mysql";

#[derive(Debug, Clone)]
pub struct MysqlProvider {
    url: String,
}

impl MysqlProvider {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self { url: url.into() }
    }

    pub fn connect(&self) -> Result<MysqlConnection> {
        let opts = Opts::from_url(&self.url)
            .map_err(|err| LockError::Config(format!("invalid mysql url: {err}")))?;
        Ok(MysqlConnection::new(Conn::new(opts)?))
    }
}

impl ConnectionProvider for MysqlProvider {
    type Connection = MysqlConnection;

    fn connect(&self) -> Result<MysqlConnection> {
        MysqlProvider::connect(self)
    }
}

/// Named-lock adapter around a caller-supplied connection.
pub struct MysqlConnection {
    conn: Conn,
    id: ConnectionId,
}

impl MysqlConnection {
    pub fn new(conn: Conn) -> Self {
        let id = ConnectionId::from_raw(u64::from(conn.connection_id()));
        debug!("Attached named locking to mysql connection {}", id.as_u64());
        Self { conn, id }
    }

    pub fn conn_mut(&mut self) -> &mut Conn {
        &mut self.conn
    }

    pub fn into_inner(self) -> Conn {
        self.conn
    }

    fn get_lock(&mut self, key: LockKey, timeout_secs: i64) -> Result<bool> {
        let result: Option<Option<i64>> = self
            .conn
            .exec_first("SELECT GET_LOCK(?, ?)", (key.as_lock_string(), timeout_secs))?;
        match result.flatten() {
            Some(1) => Ok(true),
            Some(_) => Ok(false),
            None => Err(LockError::Backend(format!(
                "GET_LOCK returned NULL for {}",
                key.as_lock_string()
            ))),
        }
    }

    fn ensure_exclusive(mode: LockMode) -> Result<()> {
        if mode.is_shared() {
            return Err(LockError::Unsupported {
                backend: BACKEND_NAME,
                operation: "shared locks",
            });
        }
        Ok(())
    }
}

impl AdvisoryConnection for MysqlConnection {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            shared: false,
            native_blocking: true,
            upgrade: None,
        }
    }

    fn try_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<bool> {
        Self::ensure_exclusive(mode)?;
        self.get_lock(key, 0)
    }

    fn blocking_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<()> {
        Self::ensure_exclusive(mode)?;
        if self.get_lock(key, -1)? {
            Ok(())
        } else {
            Err(LockError::Backend(format!(
                "GET_LOCK gave up on {} despite infinite timeout",
                key.as_lock_string()
            )))
        }
    }

    fn release(&mut self, key: LockKey, mode: LockMode) -> Result<()> {
        Self::ensure_exclusive(mode)?;
        let result: Option<Option<i64>> = self
            .conn
            .exec_first("SELECT RELEASE_LOCK(?)", (key.as_lock_string(),))?;
        match result.flatten() {
            Some(1) => Ok(()),
            _ => Err(LockError::Backend(format!(
                "mysql connection {} did not hold lock {}",
                self.id.as_u64(),
                key.as_lock_string()
            ))),
        }
    }

    fn lock_exists(&mut self, key: LockKey) -> Result<bool> {
        let result: Option<Option<i64>> = self
            .conn
            .exec_first("SELECT IS_FREE_LOCK(?)", (key.as_lock_string(),))?;
        match result.flatten() {
            Some(free) => Ok(free == 0),
            None => Err(LockError::Backend(format!(
                "IS_FREE_LOCK returned NULL for {}",
                key.as_lock_string()
            ))),
        }
    }
}
