//! Restart policy.
//!
//! [`RestartPolicy::apply`] is pure: it folds one [`Observation`] about one
//! worker into a [`RuntimeRecord`] and says whether the worker must be
//! restarted or retired. Timeout, health and crash restarts draw from the
//! same `restart_count` budget.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::record::{PluginStatus, RuntimeRecord};

/// How a worker went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashCause {
    /// The process exited.
    Exit {
        /// Exit code, if it exited normally.
        code: Option<i32>,
        /// Terminating signal, if any.
        signal: Option<i32>,
    },
    /// The stdio channel broke or an in-process task panicked.
    Transport(String),
    /// The kernel killed the worker for exceeding `memory.max`.
    OutOfMemory,
}

impl fmt::Display for CrashCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exit {
                code: Some(code), ..
            } => write!(f, "exited with code {code}"),
            Self::Exit {
                signal: Some(signal),
                ..
            } => write!(f, "killed by signal {signal}"),
            Self::Exit { .. } => f.write_str("exited"),
            Self::Transport(message) => write!(f, "transport failed: {message}"),
            Self::OutOfMemory => f.write_str("out of memory"),
        }
    }
}

/// Something the monitor, a call or the exit watcher saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// A health probe succeeded.
    ProbeSucceeded,
    /// A health probe failed or timed out.
    ProbeFailed {
        /// Whether the probe hit its timeout.
        timed_out: bool,
        /// Failure description.
        error: String,
    },
    /// A forwarded call succeeded.
    CallSucceeded,
    /// A forwarded call timed out.
    CallTimedOut {
        /// The method that timed out.
        method: String,
    },
    /// The worker answered a call with an application error.
    CallFailed {
        /// Failure description.
        error: String,
    },
    /// The worker is gone.
    Crashed {
        /// Why.
        cause: CrashCause,
    },
}

/// What the supervisor must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Nothing.
    None,
    /// Replace the worker.
    Restart {
        /// Short reason, e.g. `timeouts`.
        reason: String,
    },
    /// Terminate the worker and leave the plugin disabled.
    Retire {
        /// Budget message.
        reason: String,
    },
}

/// Thresholds and budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Automatic restarts allowed before disabling.
    pub max_restarts: u32,
    /// Crashes allowed before disabling.
    pub max_crashes: u32,
    /// Consecutive timeouts that trigger a restart.
    pub timeout_restart_threshold: u32,
    /// Consecutive failed probes that trigger a restart.
    pub health_restart_threshold: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            max_crashes: 3,
            timeout_restart_threshold: 3,
            health_restart_threshold: 2,
        }
    }
}

impl RestartPolicy {
    /// Fold an observation about `worker_id` into `record`.
    ///
    /// Observations about a worker other than the record's current one are
    /// stale and ignored, as are all observations while the plugin is
    /// disabled or stopped.
    pub fn apply(
        &self,
        record: &mut RuntimeRecord,
        worker_id: u64,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> Directive {
        if record.status.is_terminal() || record.worker_id != Some(worker_id) {
            return Directive::None;
        }

        match observation {
            Observation::ProbeSucceeded => {
                record.consecutive_health_failures = 0;
                record.consecutive_timeouts = 0;
                record.status = PluginStatus::Healthy;
                record.message = "health ok".to_string();
                record.error = None;
                record.updated_at = now;
                Directive::None
            },
            Observation::ProbeFailed { timed_out, error } => {
                record.consecutive_health_failures =
                    record.consecutive_health_failures.saturating_add(1);
                if *timed_out {
                    record.consecutive_timeouts = record.consecutive_timeouts.saturating_add(1);
                }
                record.error = Some(error.clone());
                record.updated_at = now;

                if record.consecutive_health_failures >= self.health_restart_threshold {
                    record.status = PluginStatus::Unresponsive;
                    record.message = format!(
                        "health check failed {} times",
                        record.consecutive_health_failures
                    );
                    self.request_restart(record, "unresponsive")
                } else if record.consecutive_timeouts >= self.timeout_restart_threshold {
                    record.status = PluginStatus::Degraded;
                    record.message = format!("{} consecutive timeouts", record.consecutive_timeouts);
                    self.request_restart(record, "timeouts")
                } else {
                    record.status = PluginStatus::Degraded;
                    record.message = "health check failed".to_string();
                    Directive::None
                }
            },
            Observation::CallSucceeded => {
                record.consecutive_timeouts = 0;
                if record.status == PluginStatus::Degraded && record.consecutive_health_failures == 0
                {
                    record.status = PluginStatus::Healthy;
                    record.message = "recovered".to_string();
                }
                record.updated_at = now;
                Directive::None
            },
            Observation::CallTimedOut { method } => {
                record.consecutive_timeouts = record.consecutive_timeouts.saturating_add(1);
                record.status = PluginStatus::Degraded;
                record.error = Some(format!("call {method} timed out"));
                record.updated_at = now;
                if record.consecutive_timeouts >= self.timeout_restart_threshold {
                    record.message = format!("{} consecutive timeouts", record.consecutive_timeouts);
                    self.request_restart(record, "timeouts")
                } else {
                    record.message = format!("call {method} timed out");
                    Directive::None
                }
            },
            Observation::CallFailed { error } => {
                record.error = Some(error.clone());
                record.updated_at = now;
                Directive::None
            },
            Observation::Crashed { cause } => self.crash(record, &cause.to_string(), now),
        }
    }

    /// A restart attempt failed to bring up a worker. Counts as a crash.
    pub fn restart_failed(
        &self,
        record: &mut RuntimeRecord,
        error: &str,
        now: DateTime<Utc>,
    ) -> Directive {
        if record.status.is_terminal() {
            return Directive::None;
        }
        self.crash(record, &format!("restart failed: {error}"), now)
    }

    fn crash(&self, record: &mut RuntimeRecord, cause: &str, now: DateTime<Utc>) -> Directive {
        record.consecutive_crashes = record.consecutive_crashes.saturating_add(1);
        record.status = PluginStatus::Crashed;
        record.message = format!("worker crashed: {cause}");
        record.error = Some(cause.to_string());
        record.worker_id = None;
        record.updated_at = now;

        if record.consecutive_crashes >= self.max_crashes {
            return retire(record, format!("crash budget exceeded ({})", self.max_crashes));
        }
        self.request_restart(record, "crash")
    }

    fn request_restart(&self, record: &mut RuntimeRecord, reason: &str) -> Directive {
        if record.restart_count >= self.max_restarts {
            return retire(
                record,
                format!("restart budget exceeded ({})", self.max_restarts),
            );
        }
        record.restart_count = record.restart_count.saturating_add(1);
        record.worker_id = None;
        Directive::Restart {
            reason: reason.to_string(),
        }
    }
}

fn retire(record: &mut RuntimeRecord, reason: String) -> Directive {
    record.status = PluginStatus::Disabled;
    record.message = format!("disabled: {reason}");
    record.error = Some(reason.clone());
    record.worker_id = None;
    Directive::Retire { reason }
}
