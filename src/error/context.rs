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

use crate::error::LockError;
use std::fmt;

/// Human-oriented rendering of a [`LockError`] for log lines and reports.
pub struct ErrorContext<'a> {
    pub error: &'a LockError,
    pub suggestion: Option<String>,
    pub details: Option<String>,
}

impl<'a> ErrorContext<'a> {
    pub fn new(error: &'a LockError) -> Self {
        let (suggestion, details) = match error {
            LockError::Unsupported { backend, operation } => {
                let suggestion = Some(format!(
                    "Request an exclusive lock instead, or configure a backend that supports \
                     {operation} (the {backend} backend does not)."
                ));
                let details = None;
                (suggestion, details)
            }
            LockError::Timeout {
                name,
                waited_secs,
                attempts,
            } => {
                let suggestion = Some(
                    "Another connection is holding the lock. Retry later or raise the timeout \
                     (DBLOCK_TIMEOUT or per-request timeout)."
                        .to_string(),
                );
                let details = Some(format!(
                    "Lock {name} stayed busy for {waited_secs:.3}s across {attempts} attempts."
                ));
                (suggestion, details)
            }
            LockError::Balance { details, .. } => {
                let suggestion = Some(
                    "Every acquisition must be released exactly once on the connection that \
                     acquired it. Use with_lock or a LockGuard instead of manual release."
                        .to_string(),
                );
                (suggestion, Some(details.clone()))
            }
            LockError::Config(msg) => {
                let suggestion = Some(
                    "Check the lock configuration file and DBLOCK_* environment variables."
                        .to_string(),
                );
                (suggestion, Some(msg.clone()))
            }
            LockError::Backend(msg) => {
                let suggestion = Some(
                    "Verify the database connection is alive and permitted to take advisory locks."
                        .to_string(),
                );
                (suggestion, Some(msg.clone()))
            }
            _ => (None, None),
        };

        ErrorContext {
            error,
            suggestion,
            details,
        }
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }
}

impl<'a> fmt::Display for ErrorContext<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\n\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}
