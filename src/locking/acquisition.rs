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

use crate::locking::key::{LockKey, LockMode, LockName};
use crate::locking::timeout::LockTimeoutValue;
use crate::locking::wait_observer::LockWaitObserver;
use std::cmp;
use std::time::{Duration, Instant};

/// Backoff configuration used while polling for locks.
///
/// A factor of 1 yields a fixed polling interval.
#[derive(Debug, Clone)]
pub struct PollingBackoff {
    initial: Duration,
    factor: u32,
    cap: Duration,
    current: Duration,
}

impl PollingBackoff {
    pub fn new(initial: Duration, factor: u32, cap: Duration) -> Self {
        Self {
            initial,
            factor: cmp::max(factor, 1),
            cap: cmp::max(cap, initial),
            current: initial,
        }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, 1, interval)
    }

    /// Returns the current delay and advances the backoff sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.saturating_mul(self.factor);
        self.current = cmp::min(next, self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn peek(&self) -> Duration {
        self.current
    }
}

impl Default for PollingBackoff {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(100))
    }
}

/// Tracks elapsed and remaining time for a lock timeout budget.
#[derive(Debug, Clone)]
pub struct LockTimeoutBudget {
    value: LockTimeoutValue,
    started_at: Instant,
}

impl LockTimeoutBudget {
    pub fn new(value: LockTimeoutValue) -> Self {
        Self {
            value,
            started_at: Instant::now(),
        }
    }

    pub fn value(&self) -> LockTimeoutValue {
        self.value
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self.value {
            LockTimeoutValue::Infinite => None,
            LockTimeoutValue::Finite(limit) => Some(limit.saturating_sub(self.elapsed())),
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.value, LockTimeoutValue::Finite(limit) if self.elapsed() >= limit)
    }
}

/// Carries the state of a single lock acquisition; lives only for the
/// duration of one scheduler run.
pub struct LockAcquisitionRequest<'a> {
    name: LockName,
    key: LockKey,
    mode: LockMode,
    budget: LockTimeoutBudget,
    backoff: PollingBackoff,
    observer: Option<&'a dyn LockWaitObserver>,
    attempts: usize,
    wait_started: bool,
}

impl<'a> LockAcquisitionRequest<'a> {
    pub fn new(name: LockName, key: LockKey, mode: LockMode, timeout: LockTimeoutValue) -> Self {
        Self {
            name,
            key,
            mode,
            budget: LockTimeoutBudget::new(timeout),
            backoff: PollingBackoff::default(),
            observer: None,
            attempts: 0,
            wait_started: false,
        }
    }

    pub fn with_backoff(mut self, backoff: PollingBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_observer(mut self, observer: Option<&'a dyn LockWaitObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn name(&self) -> &LockName {
        &self.name
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn budget(&self) -> &LockTimeoutBudget {
        &self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.budget.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.budget.remaining()
    }

    pub fn timeout_value(&self) -> LockTimeoutValue {
        self.budget.value()
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Delay before the next attempt, clipped to the remaining budget.
    /// `None` means the budget is spent and no further attempt should be made.
    pub fn next_sleep_interval(&mut self) -> Option<Duration> {
        if self.budget.is_expired() {
            return None;
        }
        let remaining = self.remaining();
        let mut delay = self.backoff.next_delay();
        if let Some(remaining_budget) = remaining {
            if remaining_budget < delay {
                delay = remaining_budget;
            }
            if delay.is_zero() {
                return None;
            }
        }
        Some(delay)
    }

    pub fn record_wait_start(&mut self) {
        if !self.wait_started {
            if let Some(observer) = self.observer {
                observer.on_wait_start(&self.name, self.timeout_value());
            }
            self.wait_started = true;
        }
    }

    pub fn notify_retry(&self) {
        if let Some(observer) = self.observer {
            observer.on_retry(&self.name, self.attempts, self.elapsed(), self.remaining());
        }
    }

    pub fn notify_acquired(&self) {
        if let Some(observer) = self.observer {
            observer.on_acquired(&self.name, self.elapsed());
        }
    }

    pub fn notify_timeout(&self) {
        if let Some(observer) = self.observer {
            observer.on_timeout(&self.name, self.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn polling_backoff_doubles_until_cap() {
        let mut backoff =
            PollingBackoff::new(Duration::from_millis(10), 2, Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        backoff.reset();
        assert_eq!(backoff.peek(), Duration::from_millis(10));
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let mut backoff = PollingBackoff::fixed(Duration::from_millis(25));
        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), Duration::from_millis(25));
        }
    }

    #[test]
    fn zero_budget_allows_no_sleep() {
        let mut request = LockAcquisitionRequest::new(
            LockName::from("job:42"),
            LockKey::new(0, 1),
            LockMode::Exclusive,
            LockTimeoutValue::NO_WAIT,
        );
        assert_eq!(request.next_sleep_interval(), None);
    }

    #[test]
    fn sleep_is_clipped_to_remaining_budget() {
        let mut request = LockAcquisitionRequest::new(
            LockName::from("job:42"),
            LockKey::new(0, 1),
            LockMode::Exclusive,
            LockTimeoutValue::Finite(Duration::from_secs(60)),
        )
        .with_backoff(PollingBackoff::fixed(Duration::from_secs(600)));
        let delay = request.next_sleep_interval().unwrap();
        assert!(delay <= Duration::from_secs(60));
    }

    #[test]
    fn infinite_budget_never_expires() {
        let mut request = LockAcquisitionRequest::new(
            LockName::from("job:42"),
            LockKey::new(0, 1),
            LockMode::Shared,
            LockTimeoutValue::Infinite,
        );
        assert_eq!(request.remaining(), None);
        assert_eq!(
            request.next_sleep_interval(),
            Some(Duration::from_millis(100))
        );
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl LockWaitObserver for RecordingObserver {
        fn on_wait_start(&self, name: &LockName, _timeout: LockTimeoutValue) {
            self.events.lock().unwrap().push(format!("start:{name}"));
        }

        fn on_retry(
            &self,
            _name: &LockName,
            attempt: usize,
            _elapsed: Duration,
            _remaining: Option<Duration>,
        ) {
            self.events.lock().unwrap().push(format!("retry:{attempt}"));
        }

        fn on_timeout(&self, name: &LockName, _waited: Duration) {
            self.events.lock().unwrap().push(format!("timeout:{name}"));
        }
    }

    #[test]
    fn request_notifies_observer() {
        let observer = RecordingObserver::default();
        let mut request = LockAcquisitionRequest::new(
            LockName::from("job:42"),
            LockKey::new(0, 1),
            LockMode::Exclusive,
            LockTimeoutValue::from_secs(1),
        )
        .with_observer(Some(&observer));

        request.record_wait_start();
        request.record_wait_start();
        request.record_attempt();
        request.notify_retry();
        request.notify_timeout();

        let events = observer.events.lock().unwrap();
        assert_eq!(
            events.as_slice(),
            ["start:'job:42'", "retry:1", "timeout:'job:42'"]
        );
    }
}
