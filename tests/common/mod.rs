use dblock::LockSettings;
use dblock::locking::PollingBackoff;
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Short polling interval so contended tests finish quickly.
pub fn fast_settings() -> LockSettings {
    LockSettings {
        backoff: PollingBackoff::fixed(Duration::from_millis(5)),
        ..LockSettings::default()
    }
}
