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

//! PostgreSQL session-level advisory locks.
//!
//! Keys use the two-argument `int4, int4` form of the `pg_advisory_*`
//! functions, which `pg_locks` reports with `objsubid = 2`. Grants stack per
//! session, so an upgrade is simply an exclusive grant taken while the shared
//! one is still held; both are released individually.

use crate::backend::{AdvisoryConnection, BackendCapabilities, ConnectionId, ConnectionProvider};
use crate::error::{LockError, Result};
use crate::locking::key::{LockKey, LockMode};
use ::postgres::{Client, NoTls};
use log::debug;

const BACKEND_NAME: &str = "postgres";

/// Opens plain (non-TLS) client connections from a connection string.
#[derive(Debug, Clone)]
pub struct PostgresProvider {
    url: String,
}

impl PostgresProvider {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self { url: url.into() }
    }

    pub fn connect(&self) -> Result<PostgresConnection> {
        let client = Client::connect(&self.url, NoTls)?;
        PostgresConnection::new(client)
    }
}

impl ConnectionProvider for PostgresProvider {
    type Connection = PostgresConnection;

    fn connect(&self) -> Result<PostgresConnection> {
        PostgresProvider::connect(self)
    }
}

/// Advisory-lock adapter around a caller-supplied client.
pub struct PostgresConnection {
    client: Client,
    id: ConnectionId,
}

impl PostgresConnection {
    pub fn new(mut client: Client) -> Result<Self> {
        let pid: i32 = client.query_one("SELECT pg_backend_pid()", &[])?.get(0);
        debug!("Attached advisory locking to postgres backend pid {pid}");
        Ok(Self {
            client,
            id: ConnectionId::from_raw(pid as u64),
        })
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    pub fn into_inner(self) -> Client {
        self.client
    }

    fn query_bool(&mut self, sql: &str, key: LockKey) -> Result<bool> {
        let row = self
            .client
            .query_one(sql, &[&key.namespace(), &key.value()])?;
        Ok(row.get(0))
    }
}

impl AdvisoryConnection for PostgresConnection {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::full()
    }

    fn try_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<bool> {
        let sql = match mode {
            LockMode::Shared => "SELECT pg_try_advisory_lock_shared($1, $2)",
            LockMode::Exclusive => "SELECT pg_try_advisory_lock($1, $2)",
        };
        self.query_bool(sql, key)
    }

    fn blocking_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<()> {
        let sql = match mode {
            LockMode::Shared => "SELECT pg_advisory_lock_shared($1, $2)",
            LockMode::Exclusive => "SELECT pg_advisory_lock($1, $2)",
        };
        self.client.execute(sql, &[&key.namespace(), &key.value()])?;
        Ok(())
    }

    fn release(&mut self, key: LockKey, mode: LockMode) -> Result<()> {
        let sql = match mode {
            LockMode::Shared => "SELECT pg_advisory_unlock_shared($1, $2)",
            LockMode::Exclusive => "SELECT pg_advisory_unlock($1, $2)",
        };
        if self.query_bool(sql, key)? {
            Ok(())
        } else {
            Err(LockError::Backend(format!(
                "postgres session {} did not hold a {mode} advisory lock on {key}",
                self.id.as_u64()
            )))
        }
    }

    fn lock_exists(&mut self, key: LockKey) -> Result<bool> {
        // pg_locks stores the int4 pair as oids.
        let classid = key.namespace() as u32;
        let objid = key.value() as u32;
        let row = self.client.query_one(
            "SELECT EXISTS (SELECT 1 FROM pg_locks WHERE locktype = 'advisory' \
             AND classid = $1 AND objid = $2 AND objsubid = 2)",
            &[&classid, &objid],
        )?;
        Ok(row.get(0))
    }

    fn try_upgrade(&mut self, key: LockKey) -> Result<bool> {
        self.try_acquire(key, LockMode::Exclusive)
    }

    fn blocking_upgrade(&mut self, key: LockKey) -> Result<()> {
        self.blocking_acquire(key, LockMode::Exclusive)
    }
}
