//! Client retry policy

use std::time::Duration;

use crate::types::{CompletionStatus, OrbError};

/// Default number of transmissions per invocation (one retry)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// When a failed transmission may be resent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryMode {
    /// Never resend
    Never,
    /// Resend only when the request is known not to have executed
    Strict,
    /// Resend regardless of completion status
    Always,
}

impl std::str::FromStr for RetryMode {
    type Err = OrbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" | "0" => Ok(RetryMode::Never),
            "strict" | "1" => Ok(RetryMode::Strict),
            "always" | "2" => Ok(RetryMode::Always),
            other => Err(OrbError::InvalidConfig(format!("unknown retry mode '{}'", other))),
        }
    }
}

/// Retry attributes applied to every transmission of an invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub mode: RetryMode,
    /// Pause between transmissions
    pub interval: Duration,
    /// Total transmissions allowed, including the first
    pub max_attempts: u32,
    /// Also retry transient errors reported by the server in a reply
    pub remote: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            mode: RetryMode::Strict,
            interval: Duration::ZERO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            remote: false,
        }
    }
}

/// Outcome of consulting the policy after a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resend after the given pause
    Retry(Duration),
    /// The failure is not retryable under this policy
    GiveUp,
    /// The attempt budget is spent
    Exhausted,
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn never() -> Self {
        Self {
            mode: RetryMode::Never,
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: RetryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    /// Decide what to do after transmission number `attempts` failed with `err`
    ///
    /// `server_reported` marks errors that arrived in a reply rather than
    /// from the local transport.
    pub fn decide(&self, err: &OrbError, attempts: u32, server_reported: bool) -> RetryDecision {
        let completion = match err {
            OrbError::Transient { completion, .. } | OrbError::CommFailure { completion, .. } => {
                *completion
            }
            _ => return RetryDecision::GiveUp,
        };
        if server_reported && !self.remote {
            return RetryDecision::GiveUp;
        }
        match self.mode {
            RetryMode::Never => return RetryDecision::GiveUp,
            RetryMode::Strict if completion != CompletionStatus::No => {
                return RetryDecision::GiveUp
            }
            _ => {}
        }
        if attempts >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry(self.interval)
        }
    }
}
