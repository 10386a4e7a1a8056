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

//! Acquisition state machine.
//!
//! A request moves `Idle -> CheckingReentrant -> Attempting` and ends in
//! `Held`, `TimedOut` or `Failed`, passing through `Waiting` while it polls.
//! Bookkeeping is only touched on the way into `Held`, so a request that
//! times out or fails leaves neither a stack entry nor a database grant.
//!
//! Waiters are not served in arrival order. Whoever polls or is woken first
//! after a release wins, subject to whatever ordering the database applies to
//! its own blocking waiters.

use crate::backend::AdvisoryConnection;
use crate::error::{LockError, Result};
use crate::locking::acquisition::LockAcquisitionRequest;
use crate::locking::stack::LockStack;
use log::{debug, trace};
use std::fmt;
use std::thread;

/// States a single acquisition request passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    CheckingReentrant,
    Attempting,
    Waiting,
    Held,
    TimedOut,
    Failed,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AcquisitionState::Idle => "idle",
            AcquisitionState::CheckingReentrant => "checking-reentrant",
            AcquisitionState::Attempting => "attempting",
            AcquisitionState::Waiting => "waiting",
            AcquisitionState::Held => "held",
            AcquisitionState::TimedOut => "timed-out",
            AcquisitionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// How a request reached `Held`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    /// Satisfied from the connection's own stack without a database call.
    pub reentrant: bool,
    /// Non-blocking database attempts made; zero for reentrant and natively
    /// blocking paths.
    pub attempts: usize,
    /// Hold count after this acquisition.
    pub hold_count: u32,
}

/// Runs one acquisition request against `connection`, recording success in `stack`.
pub fn acquire<C: AdvisoryConnection + ?Sized>(
    connection: &mut C,
    stack: &mut LockStack,
    request: &mut LockAcquisitionRequest<'_>,
) -> Result<Acquired> {
    let key = request.key();
    let mode = request.mode();
    let capabilities = connection.capabilities();
    let mut state = AcquisitionState::Idle;

    if mode.is_shared() && !capabilities.shared {
        transition(request, &mut state, AcquisitionState::Failed);
        return Err(LockError::Unsupported {
            backend: connection.backend_name(),
            operation: "shared locks",
        });
    }

    transition(request, &mut state, AcquisitionState::CheckingReentrant);
    if stack.entry(key).is_some() {
        // A mode the entry does not cover is rejected by the stack unchanged.
        let hold_count = stack
            .note_acquired(key, request.name(), mode)
            .inspect_err(|_| transition(request, &mut state, AcquisitionState::Failed))?;
        transition(request, &mut state, AcquisitionState::Held);
        return Ok(Acquired {
            reentrant: true,
            attempts: 0,
            hold_count,
        });
    }

    transition(request, &mut state, AcquisitionState::Attempting);
    drive(
        connection,
        request,
        &mut state,
        capabilities.native_blocking,
        |conn| conn.try_acquire(key, mode),
        |conn| conn.blocking_acquire(key, mode),
    )?;

    let hold_count = stack.note_acquired(key, request.name(), mode)?;
    request.notify_acquired();
    debug!(
        "Acquired {mode} lock {} on {} after {:.3}s",
        request.name(),
        connection.connection_id(),
        request.elapsed().as_secs_f64()
    );
    Ok(Acquired {
        reentrant: false,
        attempts: request.attempts(),
        hold_count,
    })
}

/// Waits for the backend to turn a held shared grant into an exclusive one.
/// The caller records the transition in its stack.
pub fn upgrade<C: AdvisoryConnection + ?Sized>(
    connection: &mut C,
    request: &mut LockAcquisitionRequest<'_>,
) -> Result<()> {
    let key = request.key();
    let native_blocking = connection.capabilities().native_blocking;
    let mut state = AcquisitionState::Attempting;
    drive(
        connection,
        request,
        &mut state,
        native_blocking,
        |conn| conn.try_upgrade(key),
        |conn| conn.blocking_upgrade(key),
    )?;
    request.notify_acquired();
    Ok(())
}

fn drive<C, T, B>(
    connection: &mut C,
    request: &mut LockAcquisitionRequest<'_>,
    state: &mut AcquisitionState,
    native_blocking: bool,
    mut attempt: T,
    block: B,
) -> Result<()>
where
    C: AdvisoryConnection + ?Sized,
    T: FnMut(&mut C) -> Result<bool>,
    B: FnOnce(&mut C) -> Result<()>,
{
    if native_blocking && request.timeout_value().is_infinite() {
        request.record_wait_start();
        return match block(connection) {
            Ok(()) => {
                transition(request, state, AcquisitionState::Held);
                Ok(())
            }
            Err(err) => {
                transition(request, state, AcquisitionState::Failed);
                Err(err)
            }
        };
    }

    loop {
        request.record_attempt();
        match attempt(connection) {
            Ok(true) => {
                transition(request, state, AcquisitionState::Held);
                return Ok(());
            }
            Ok(false) => {}
            Err(err) => {
                transition(request, state, AcquisitionState::Failed);
                return Err(err);
            }
        }

        match request.next_sleep_interval() {
            Some(delay) => {
                if *state != AcquisitionState::Waiting {
                    transition(request, state, AcquisitionState::Waiting);
                    request.record_wait_start();
                }
                request.notify_retry();
                thread::sleep(delay);
            }
            None => {
                transition(request, state, AcquisitionState::TimedOut);
                request.notify_timeout();
                return Err(LockError::Timeout {
                    name: request.name().to_string(),
                    waited_secs: request.elapsed().as_secs_f64(),
                    attempts: request.attempts(),
                });
            }
        }
    }
}

fn transition(
    request: &LockAcquisitionRequest<'_>,
    state: &mut AcquisitionState,
    next: AcquisitionState,
) {
    trace!("Lock {} {} -> {}", request.name(), state, next);
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConnectionId, MemoryBackend};
    use crate::locking::acquisition::PollingBackoff;
    use crate::locking::key::{LockMode, LockName};
    use crate::locking::timeout::LockTimeoutValue;
    use std::time::Duration;

    fn request(mode: LockMode, timeout: LockTimeoutValue) -> LockAcquisitionRequest<'static> {
        let name = LockName::from("job:42");
        let key = name.key(0);
        LockAcquisitionRequest::new(name, key, mode, timeout)
            .with_backoff(PollingBackoff::fixed(Duration::from_millis(5)))
    }

    #[test]
    fn fresh_request_reaches_held() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        let mut stack = LockStack::new(ConnectionId::from_raw(1));

        let mut req = request(LockMode::Exclusive, LockTimeoutValue::NO_WAIT);
        let acquired = acquire(&mut conn, &mut stack, &mut req).unwrap();
        assert!(!acquired.reentrant);
        assert_eq!(acquired.attempts, 1);
        assert_eq!(acquired.hold_count, 1);
    }

    #[test]
    fn reentrant_request_skips_backend() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        let mut stack = LockStack::new(ConnectionId::from_raw(1));

        let mut first = request(LockMode::Exclusive, LockTimeoutValue::Infinite);
        acquire(&mut conn, &mut stack, &mut first).unwrap();
        let mut second = request(LockMode::Exclusive, LockTimeoutValue::NO_WAIT);
        let acquired = acquire(&mut conn, &mut stack, &mut second).unwrap();

        assert!(acquired.reentrant);
        assert_eq!(acquired.hold_count, 2);
        assert_eq!(backend.granted_modes(first.key()).unwrap().len(), 1);
    }

    #[test]
    fn zero_timeout_makes_exactly_one_attempt() {
        let backend = MemoryBackend::new();
        let mut holder = backend.connect().unwrap();
        let mut conn = backend.connect().unwrap();
        let mut stack = LockStack::new(ConnectionId::from_raw(2));

        let mut req = request(LockMode::Exclusive, LockTimeoutValue::NO_WAIT);
        assert!(holder.try_acquire(req.key(), LockMode::Exclusive).unwrap());

        let err = acquire(&mut conn, &mut stack, &mut req).unwrap_err();
        match err {
            LockError::Timeout { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("Expected timeout error, got {other:?}"),
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn finite_timeout_polls_until_deadline() {
        let backend = MemoryBackend::new();
        let mut holder = backend.connect().unwrap();
        let mut conn = backend.connect().unwrap();
        let mut stack = LockStack::new(ConnectionId::from_raw(2));

        let mut req = request(
            LockMode::Shared,
            LockTimeoutValue::Finite(Duration::from_millis(60)),
        );
        assert!(holder.try_acquire(req.key(), LockMode::Exclusive).unwrap());

        let err = acquire(&mut conn, &mut stack, &mut req).unwrap_err();
        match err {
            LockError::Timeout {
                attempts,
                waited_secs,
                ..
            } => {
                assert!(attempts > 1);
                assert!(waited_secs >= 0.06);
            }
            other => panic!("Expected timeout error, got {other:?}"),
        }
    }

    #[test]
    fn shared_request_fails_fast_without_support() {
        let backend = MemoryBackend::exclusive_only();
        let mut conn = backend.connect().unwrap();
        let mut stack = LockStack::new(ConnectionId::from_raw(1));

        let mut req = request(LockMode::Shared, LockTimeoutValue::Infinite);
        let err = acquire(&mut conn, &mut stack, &mut req).unwrap_err();
        assert!(err.is_capability());
        assert_eq!(req.attempts(), 0);
    }

    #[test]
    fn exclusive_only_backend_polls_even_without_deadline() {
        let backend = MemoryBackend::exclusive_only();
        let mut conn = backend.connect().unwrap();
        let mut stack = LockStack::new(ConnectionId::from_raw(1));

        let mut req = request(LockMode::Exclusive, LockTimeoutValue::Infinite);
        let acquired = acquire(&mut conn, &mut stack, &mut req).unwrap();
        assert_eq!(acquired.attempts, 1);
    }

    #[test]
    fn mode_mismatch_leaves_entry_untouched() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        let mut stack = LockStack::new(ConnectionId::from_raw(1));

        let mut shared = request(LockMode::Shared, LockTimeoutValue::Infinite);
        acquire(&mut conn, &mut stack, &mut shared).unwrap();
        let mut exclusive = request(LockMode::Exclusive, LockTimeoutValue::NO_WAIT);
        let err = acquire(&mut conn, &mut stack, &mut exclusive).unwrap_err();

        assert_eq!(err.kind(), crate::error::LockErrorKind::Balance);
        assert_eq!(stack.entry(shared.key()).unwrap().count(), 1);
    }

    #[test]
    fn state_labels() {
        assert_eq!(AcquisitionState::CheckingReentrant.to_string(), "checking-reentrant");
        assert_eq!(AcquisitionState::TimedOut.to_string(), "timed-out");
    }
}
