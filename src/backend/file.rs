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

//! Operating-system file locks standing in for engines without advisory locks.
//!
//! Each key maps to one file in the lock directory. A connection opens its own
//! handle per held key, so two connections in the same process contend just
//! like two processes would. Lock files are left in place after release;
//! removing them would race with concurrent openers.

use crate::backend::{AdvisoryConnection, BackendCapabilities, ConnectionId, ConnectionProvider};
use crate::error::{LockError, Result};
use crate::locking::key::{LockKey, LockMode};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};

const BACKEND_NAME: &str = "file";

/// Directory of lock files shared by every connection created from it.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn connect(&self) -> Result<FileConnection> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            LockError::Backend(format!(
                "Failed to ensure lock directory {} exists: {err}",
                self.dir.display()
            ))
        })?;
        Ok(FileConnection {
            id: ConnectionId::next(),
            dir: self.dir.clone(),
            held: HashMap::new(),
        })
    }
}

impl ConnectionProvider for FileBackend {
    type Connection = FileConnection;

    fn connect(&self) -> Result<FileConnection> {
        FileBackend::connect(self)
    }
}

#[derive(Debug)]
struct HeldFile {
    file: File,
    mode: LockMode,
}

/// A set of open lock-file handles acting as one session.
#[derive(Debug)]
pub struct FileConnection {
    id: ConnectionId,
    dir: PathBuf,
    held: HashMap<LockKey, HeldFile>,
}

impl FileConnection {
    fn lock_path(&self, key: LockKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    fn ensure_not_held(&self, key: LockKey) -> Result<()> {
        if self.held.contains_key(&key) {
            return Err(LockError::Backend(format!(
                "{} already holds a file lock on {key}",
                self.id
            )));
        }
        Ok(())
    }

    fn prepare_lock_file(&self, lock_path: &Path) -> io::Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(lock_path, permissions)?;
        }

        Ok(file)
    }
}

fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
    let result = match mode {
        LockMode::Shared => file.try_lock_shared(),
        LockMode::Exclusive => file.try_lock(),
    };

    match result {
        Ok(()) => Ok(true),
        Err(TryLockError::WouldBlock) => Ok(false),
        Err(TryLockError::Error(err)) => Err(err),
    }
}

impl AdvisoryConnection for FileConnection {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn capabilities(&self) -> BackendCapabilities {
        // OS lock conversion drops the old lock before taking the new one, so
        // upgrades are not offered.
        BackendCapabilities {
            shared: true,
            native_blocking: true,
            upgrade: None,
        }
    }

    fn try_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<bool> {
        self.ensure_not_held(key)?;
        let lock_path = self.lock_path(key);
        let file = self.prepare_lock_file(&lock_path)?;
        if try_lock(&file, mode)? {
            debug!("{} locked {} ({mode})", self.id, lock_path.display());
            self.held.insert(key, HeldFile { file, mode });
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn blocking_acquire(&mut self, key: LockKey, mode: LockMode) -> Result<()> {
        self.ensure_not_held(key)?;
        let lock_path = self.lock_path(key);
        let file = self.prepare_lock_file(&lock_path)?;
        match mode {
            LockMode::Shared => file.lock_shared()?,
            LockMode::Exclusive => file.lock()?,
        }
        debug!("{} locked {} ({mode})", self.id, lock_path.display());
        self.held.insert(key, HeldFile { file, mode });
        Ok(())
    }

    fn release(&mut self, key: LockKey, mode: LockMode) -> Result<()> {
        match self.held.remove(&key) {
            Some(held) if held.mode == mode => {
                held.file.unlock()?;
                Ok(())
            }
            Some(held) => {
                let held_mode = held.mode;
                self.held.insert(key, held);
                Err(LockError::Backend(format!(
                    "{} holds {key} as {held_mode}, not {mode}",
                    self.id
                )))
            }
            None => Err(LockError::Backend(format!(
                "{} does not hold a {mode} lock on {key}",
                self.id
            ))),
        }
    }

    fn lock_exists(&mut self, key: LockKey) -> Result<bool> {
        if self.held.contains_key(&key) {
            return Ok(true);
        }
        let lock_path = self.lock_path(key);
        let probe = match OpenOptions::new().read(true).write(true).open(&lock_path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if try_lock(&probe, LockMode::Exclusive)? {
            if let Err(err) = probe.unlock() {
                warn!("Failed to drop probe lock on {}: {err}", lock_path.display());
            }
            Ok(false)
        } else {
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: LockKey = LockKey::new(0, 7);

    #[test]
    fn exclusive_locks_contend_between_connections() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::new(temp.path());
        let mut one = backend.connect().unwrap();
        let mut two = backend.connect().unwrap();

        assert!(one.try_acquire(KEY, LockMode::Exclusive).unwrap());
        assert!(!two.try_acquire(KEY, LockMode::Exclusive).unwrap());
        assert!(!two.try_acquire(KEY, LockMode::Shared).unwrap());
        one.release(KEY, LockMode::Exclusive).unwrap();
        assert!(two.try_acquire(KEY, LockMode::Exclusive).unwrap());
    }

    #[test]
    fn shared_locks_coexist() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::new(temp.path());
        let mut one = backend.connect().unwrap();
        let mut two = backend.connect().unwrap();
        let mut three = backend.connect().unwrap();

        assert!(one.try_acquire(KEY, LockMode::Shared).unwrap());
        assert!(two.try_acquire(KEY, LockMode::Shared).unwrap());
        assert!(!three.try_acquire(KEY, LockMode::Exclusive).unwrap());
    }

    #[test]
    fn lock_exists_sees_other_and_own_holders() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::new(temp.path());
        let mut one = backend.connect().unwrap();
        let mut two = backend.connect().unwrap();

        assert!(!two.lock_exists(KEY).unwrap());
        assert!(one.try_acquire(KEY, LockMode::Shared).unwrap());
        assert!(one.lock_exists(KEY).unwrap());
        assert!(two.lock_exists(KEY).unwrap());
        one.release(KEY, LockMode::Shared).unwrap();
        assert!(!two.lock_exists(KEY).unwrap());
    }

    #[test]
    fn dropping_connection_releases_os_locks() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::new(temp.path());
        let mut one = backend.connect().unwrap();
        let mut two = backend.connect().unwrap();

        assert!(one.try_acquire(KEY, LockMode::Exclusive).unwrap());
        drop(one);
        assert!(two.try_acquire(KEY, LockMode::Exclusive).unwrap());
    }

    #[test]
    fn release_with_wrong_mode_keeps_lock() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::new(temp.path());
        let mut one = backend.connect().unwrap();

        assert!(one.try_acquire(KEY, LockMode::Exclusive).unwrap());
        assert!(one.release(KEY, LockMode::Shared).is_err());
        one.release(KEY, LockMode::Exclusive).unwrap();
    }

    #[test]
    fn connect_creates_lock_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("nested").join("locks");
        let backend = FileBackend::new(&dir);
        backend.connect().unwrap();
        assert!(dir.is_dir());
    }
}
