//! Per-plugin runtime records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Activated; no health probe has succeeded yet.
    Initialized,
    /// Last probe succeeded.
    Healthy,
    /// Probes or calls are failing below the restart thresholds.
    Degraded,
    /// The health-failure threshold was reached.
    Unresponsive,
    /// The worker exited or its transport broke.
    Crashed,
    /// A budget was exhausted or the backend refused; terminal.
    Disabled,
    /// Stopped by an operator; terminal.
    Stopped,
}

impl PluginStatus {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unresponsive => "unresponsive",
            Self::Crashed => "crashed",
            Self::Disabled => "disabled",
            Self::Stopped => "stopped",
        }
    }

    /// Whether only an operator action or a rescan leaves this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disabled | Self::Stopped)
    }

    /// Whether `invoke` may forward calls.
    #[must_use]
    pub fn is_callable(self) -> bool {
        matches!(
            self,
            Self::Initialized | Self::Healthy | Self::Degraded | Self::Unresponsive
        )
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable state the manager keeps for every loaded descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeRecord {
    /// Lifecycle state.
    pub status: PluginStatus,
    /// Calls or probes that timed out in a row.
    pub consecutive_timeouts: u32,
    /// Failed health probes in a row.
    pub consecutive_health_failures: u32,
    /// Crashes since the last operator reset.
    pub consecutive_crashes: u32,
    /// Automatic restarts since the last operator reset.
    pub restart_count: u32,
    /// Last status message.
    pub message: String,
    /// Load-time or runtime warning.
    pub warning: Option<String>,
    /// Last error.
    pub error: Option<String>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// When the current worker finished activating.
    pub initialized_at: Option<DateTime<Utc>>,
    /// Worker whose observations are current. `None` while no worker runs.
    #[serde(skip)]
    pub worker_id: Option<u64>,
}

impl RuntimeRecord {
    /// Fresh record for a newly loaded descriptor.
    #[must_use]
    pub fn new(warning: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: PluginStatus::Initialized,
            consecutive_timeouts: 0,
            consecutive_health_failures: 0,
            consecutive_crashes: 0,
            restart_count: 0,
            message: "loaded".to_string(),
            warning,
            error: None,
            updated_at: now,
            initialized_at: None,
            worker_id: None,
        }
    }

    /// A worker finished its activation handshake.
    pub fn activated(&mut self, worker_id: u64, now: DateTime<Utc>) {
        self.status = PluginStatus::Initialized;
        self.message = "started".to_string();
        self.error = None;
        self.consecutive_timeouts = 0;
        self.consecutive_health_failures = 0;
        self.worker_id = Some(worker_id);
        self.initialized_at = Some(now);
        self.updated_at = now;
    }

    /// Activation failed before a worker came up.
    pub fn activation_failed(&mut self, error: String, backend_refused: bool, now: DateTime<Utc>) {
        if backend_refused {
            self.status = PluginStatus::Disabled;
            self.message = "resource isolation unavailable".to_string();
        } else {
            self.status = PluginStatus::Crashed;
            self.message = "start failed".to_string();
        }
        self.error = Some(error);
        self.worker_id = None;
        self.updated_at = now;
    }

    /// An automatic restart brought up a new worker.
    pub fn restarted(&mut self, worker_id: u64, reason: &str, now: DateTime<Utc>) {
        self.status = PluginStatus::Initialized;
        self.message = format!("restarted after {reason}");
        self.consecutive_timeouts = 0;
        self.consecutive_health_failures = 0;
        self.worker_id = Some(worker_id);
        self.initialized_at = Some(now);
        self.updated_at = now;
    }

    /// An operator stopped the plugin.
    pub fn stopped(&mut self, now: DateTime<Utc>) {
        self.status = PluginStatus::Stopped;
        self.message = "stopped by operator".to_string();
        self.worker_id = None;
        self.updated_at = now;
    }

    /// Operator start or restart: every counter back to zero.
    pub fn operator_reset(&mut self, now: DateTime<Utc>) {
        self.consecutive_timeouts = 0;
        self.consecutive_health_failures = 0;
        self.consecutive_crashes = 0;
        self.restart_count = 0;
        self.error = None;
        self.message = "reset by operator".to_string();
        self.updated_at = now;
    }
}
