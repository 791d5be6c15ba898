//! Periodic health probing, one task per plugin.

use std::sync::Arc;
use std::time::Duration;

use nebula_core::PluginName;
use nebula_core::protocol::methods;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{PluginError, PluginResult};
use crate::policy::{CrashCause, Observation};
use crate::slot::WorkerSlot;
use crate::state::StateHandle;

/// What a call outcome means for the state machine.
///
/// `probe` selects the health-probe observations; otherwise `method` names
/// the forwarded call. A call cut short by teardown says nothing about the
/// worker and yields `None`.
pub(crate) fn observation_for(
    result: &PluginResult<Value>,
    probe: bool,
    method: &str,
) -> Option<Observation> {
    let observation = match result {
        Ok(_) if probe => Observation::ProbeSucceeded,
        Ok(_) => Observation::CallSucceeded,
        Err(PluginError::Cancelled { .. }) => return None,
        Err(PluginError::Timeout { .. }) if probe => Observation::ProbeFailed {
            timed_out: true,
            error: "health probe timed out".to_string(),
        },
        Err(PluginError::Timeout { .. }) => Observation::CallTimedOut {
            method: method.to_string(),
        },
        Err(PluginError::Transport { message, .. }) => Observation::Crashed {
            cause: CrashCause::Transport(message.clone()),
        },
        Err(e) if probe => Observation::ProbeFailed {
            timed_out: false,
            error: e.to_string(),
        },
        Err(e) => Observation::CallFailed {
            error: e.to_string(),
        },
    };
    Some(observation)
}

pub(crate) struct Monitor {
    pub(crate) plugin: PluginName,
    pub(crate) slot: Arc<WorkerSlot>,
    pub(crate) state: StateHandle,
    pub(crate) interval: Duration,
    pub(crate) probe_timeout: Duration,
}

impl Monitor {
    /// Start probing. The first probe fires immediately.
    pub(crate) fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(plugin = %self.plugin, interval = ?self.interval, "health monitor started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {},
            }

            let Some(record) = self.state.snapshot(self.plugin.as_str()) else {
                debug!(plugin = %self.plugin, "record removed, health monitor stops");
                break;
            };
            if record.status.is_terminal() {
                continue;
            }

            let Some(current) = self.slot.current() else {
                continue;
            };
            // Exits are reported by the exit watcher.
            if !current.worker.is_alive() {
                continue;
            }
            let worker_id = current.worker.id();
            let result = current
                .worker
                .call(methods::HEALTH, Value::Null, self.probe_timeout)
                .await;

            trace!(plugin = %self.plugin, worker_id, ok = result.is_ok(), "health probe");
            if let Some(observation) = observation_for(&result, true, methods::HEALTH) {
                self.state.observe(&self.plugin, worker_id, observation).await;
            }
        }
        debug!(plugin = %self.plugin, "health monitor stopped");
    }
}
