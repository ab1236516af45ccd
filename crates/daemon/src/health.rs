//! Health tracking for the supervisor
//!
//! Aggregates the current item, session uptime, the retry counter and a
//! bounded error history. The supervisor is the only writer; readers get
//! immutable [`HealthStatus`] snapshots.

use crate::playlist::WorkItem;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Maximum number of errors kept; the oldest is evicted first.
pub const ERROR_LOG_CAPACITY: usize = 50;

/// Milliseconds since the unix epoch, 0 if the clock is before it.
pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp_unix_ms: i64,
    pub message: String,
}

/// Consecutive-failure budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub count: u32,
    pub cap: u32,
    pub base_delay_ms: u64,
}

/// Point-in-time copy of the tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Supervisor phase, e.g. `running` or `backoff`
    pub state: String,
    pub streaming: bool,
    pub current_item: Option<String>,
    pub uptime_ms: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: &'static str,
    retry: RetryState,
    current_item: Option<String>,
    session_started: Option<Instant>,
    errors: VecDeque<ErrorRecord>,
}

impl HealthTracker {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            state: "idle",
            retry: RetryState {
                count: 0,
                cap: max_retries,
                base_delay_ms,
            },
            current_item: None,
            session_started: None,
            errors: VecDeque::with_capacity(ERROR_LOG_CAPACITY),
        }
    }

    pub fn set_state(&mut self, state: &'static str) {
        self.state = state;
    }

    pub fn state(&self) -> &'static str {
        self.state
    }

    /// Append an error, evicting the oldest beyond [`ERROR_LOG_CAPACITY`].
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push_back(ErrorRecord {
            timestamp_unix_ms: now_unix_ms(),
            message: message.into(),
        });
        while self.errors.len() > ERROR_LOG_CAPACITY {
            self.errors.pop_front();
        }
    }

    /// Count one more consecutive failure; returns the new count.
    pub fn increment_retry(&mut self) -> u32 {
        self.retry.count = self.retry.count.saturating_add(1);
        self.retry.count
    }

    pub fn reset_retry(&mut self) {
        self.retry.count = 0;
    }

    pub fn retry_count(&self) -> u32 {
        self.retry.count
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    /// True once the consecutive failures reach the cap.
    pub fn retries_exhausted(&self) -> bool {
        self.retry.count >= self.retry.cap
    }

    pub fn session_started(&mut self, item: &WorkItem) {
        self.current_item = Some(item.display_name.clone());
        self.session_started = Some(Instant::now());
    }

    pub fn session_ended(&mut self) {
        self.current_item = None;
        self.session_started = None;
    }

    pub fn is_streaming(&self) -> bool {
        self.session_started.is_some()
    }

    /// Immutable copy of the current status. Uptime counts from the start of
    /// the live session and is 0 between sessions.
    pub fn snapshot(&self) -> HealthStatus {
        let uptime_ms = self
            .session_started
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        HealthStatus {
            state: self.state.to_string(),
            streaming: self.is_streaming(),
            current_item: self.current_item.clone(),
            uptime_ms,
            retry_count: self.retry.count,
            max_retries: self.retry.cap,
            errors: self.errors.iter().cloned().collect(),
        }
    }
}
