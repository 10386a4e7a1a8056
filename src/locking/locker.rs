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

use crate::backend::{AdvisoryConnection, BackendProvider, ConnectionProvider};
use crate::config::{LockSettings, LockingConfig};
use crate::error::Result;
use crate::locking::key::LockName;
use crate::locking::session::{LockOptions, LockSession};
use crate::locking::wait_observer::LockWaitObserver;
use log::debug;
use std::sync::Arc;

/// Entry point handed to application code: builds lock sessions over
/// connections from an explicit provider.
pub struct AdvisoryLocker<P: ConnectionProvider> {
    provider: P,
    settings: LockSettings,
    observer: Option<Arc<dyn LockWaitObserver>>,
}

impl<P: ConnectionProvider> AdvisoryLocker<P> {
    pub fn new(provider: P, settings: LockSettings) -> Self {
        Self {
            provider,
            settings,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LockWaitObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Opens a fresh connection and wraps it in a session.
    pub fn session(&self) -> Result<LockSession<P::Connection>> {
        let connection = self.provider.connect()?;
        Ok(self.attach(connection))
    }

    /// Wraps a connection the caller already owns, such as one checked out of
    /// its own pool. Locks taken through the session belong to that connection.
    pub fn attach<C: AdvisoryConnection>(&self, connection: C) -> LockSession<C> {
        debug!(
            "Attached {} connection {} to lock session",
            connection.backend_name(),
            connection.connection_id()
        );
        let mut session = LockSession::new(connection, self.settings.clone());
        session.set_observer(self.observer.clone());
        session
    }

    /// Runs `work` under `name` on a dedicated connection that is closed afterwards.
    pub fn with_lock<N, T, F>(&self, name: N, options: LockOptions, work: F) -> Result<T>
    where
        N: Into<LockName>,
        F: FnOnce(&mut LockSession<P::Connection>) -> T,
    {
        let mut session = self.session()?;
        let output = session.with_lock(name, options, work)?;
        drop(session.into_connection());
        Ok(output)
    }

    pub fn lock_exists<N: Into<LockName>>(&self, name: N) -> Result<bool> {
        self.session()?.lock_exists(name)
    }
}

impl AdvisoryLocker<BackendProvider> {
    /// Selects the backend and runtime policy from configuration.
    pub fn from_config(config: &LockingConfig) -> Result<Self> {
        let provider = BackendProvider::from_config(config)?;
        debug!("Using {} lock backend", provider.kind());
        Ok(Self::new(provider, config.settings()?))
    }
}
