//! The single writer of runtime records.
//!
//! Health loops, forwarded calls and exit watchers send observations over a
//! channel; one actor task folds them into the records with the
//! [`RestartPolicy`] and hands restart or retire directives to the manager.
//! Readers take point-in-time copies from the shared map.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use nebula_core::PluginName;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::policy::{Directive, Observation, RestartPolicy};
use crate::record::RuntimeRecord;
use crate::supervisor::{ExitListener, WorkerExit};

/// Records by plugin name.
pub type Records = Arc<DashMap<PluginName, RuntimeRecord>>;

/// Queued messages before senders wait.
const STATE_QUEUE: usize = 1024;

/// A change the manager itself makes to a record.
#[derive(Debug, Clone)]
pub(crate) enum RecordOp {
    /// New or replaced descriptor.
    Insert(RuntimeRecord),
    /// Descriptor removed by a rescan.
    Remove,
    /// A worker finished activation.
    Activated {
        worker_id: u64,
    },
    /// Activation failed.
    ActivationFailed {
        error: String,
        backend_refused: bool,
    },
    /// A restart directive was carried out.
    Restarted {
        worker_id: u64,
        reason: String,
    },
    /// A restart directive could not be carried out.
    RestartFailed {
        error: String,
    },
    /// Operator stop.
    Stopped,
    /// Operator start or restart.
    OperatorReset,
}

enum StateMessage {
    Observe {
        plugin: PluginName,
        worker_id: u64,
        observation: Observation,
    },
    Apply {
        plugin: PluginName,
        op: RecordOp,
        ack: oneshot::Sender<bool>,
    },
}

/// A directive for one plugin.
pub(crate) type DirectiveFor = (PluginName, Directive);

/// Cheap handle to the state actor.
#[derive(Clone)]
pub struct StateHandle {
    tx: mpsc::Sender<StateMessage>,
    records: Records,
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandle")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl StateHandle {
    /// Start the actor. It runs until `shutdown` fires.
    pub(crate) fn spawn(
        policy: RestartPolicy,
        records: Records,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<DirectiveFor>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(STATE_QUEUE);
        let (directives, directive_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            policy,
            records: Arc::clone(&records),
            directives,
        };
        let task = tokio::spawn(actor.run(rx, shutdown));
        (Self { tx, records }, directive_rx, task)
    }

    /// Report an observation about one worker.
    pub async fn observe(&self, plugin: &PluginName, worker_id: u64, observation: Observation) {
        let message = StateMessage::Observe {
            plugin: plugin.clone(),
            worker_id,
            observation,
        };
        if self.tx.send(message).await.is_err() {
            debug!(plugin = %plugin, "state actor gone, observation dropped");
        }
    }

    /// Apply a manager change and wait for it. Returns whether it applied.
    pub(crate) async fn apply(&self, plugin: &PluginName, op: RecordOp) -> bool {
        let (ack, done) = oneshot::channel();
        let message = StateMessage::Apply {
            plugin: plugin.clone(),
            op,
            ack,
        };
        if self.tx.send(message).await.is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Copy of one record.
    #[must_use]
    pub fn snapshot(&self, plugin: &str) -> Option<RuntimeRecord> {
        self.records.get(plugin).map(|r| r.value().clone())
    }

    /// The shared record map.
    #[must_use]
    pub fn records(&self) -> &Records {
        &self.records
    }
}

#[async_trait]
impl ExitListener for StateHandle {
    async fn worker_exited(&self, exit: WorkerExit) {
        self.observe(&exit.plugin, exit.worker_id, Observation::Crashed {
            cause: exit.cause,
        })
        .await;
    }
}

struct Actor {
    policy: RestartPolicy,
    records: Records,
    directives: mpsc::UnboundedSender<DirectiveFor>,
}

impl Actor {
    async fn run(self, mut rx: mpsc::Receiver<StateMessage>, shutdown: CancellationToken) {
        loop {
            let message = tokio::select! {
                () = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            match message {
                StateMessage::Observe {
                    plugin,
                    worker_id,
                    observation,
                } => self.observe(&plugin, worker_id, &observation),
                StateMessage::Apply { plugin, op, ack } => {
                    let applied = self.apply(&plugin, op);
                    let _ = ack.send(applied);
                },
            }
        }
        debug!("state actor stopped");
    }

    fn observe(&self, plugin: &PluginName, worker_id: u64, observation: &Observation) {
        let Some(mut record) = self.records.get_mut(plugin) else {
            debug!(plugin = %plugin, worker_id, "observation for unknown plugin ignored");
            return;
        };
        let before = record.status;
        let directive = self
            .policy
            .apply(&mut record, worker_id, observation, Utc::now());
        let after = record.status;
        let message = record.message.clone();
        drop(record);

        if before != after {
            info!(plugin = %plugin, from = %before, to = %after, message = %message, "plugin state changed");
        }
        self.dispatch(plugin, directive);
    }

    fn apply(&self, plugin: &PluginName, op: RecordOp) -> bool {
        let now = Utc::now();
        match op {
            RecordOp::Insert(record) => {
                self.records.insert(plugin.clone(), record);
                return true;
            },
            RecordOp::Remove => return self.records.remove(plugin).is_some(),
            _ => {},
        }

        let Some(mut record) = self.records.get_mut(plugin) else {
            return false;
        };
        let mut directive = Directive::None;
        let applied = match op {
            RecordOp::Activated { worker_id } => {
                record.activated(worker_id, now);
                true
            },
            RecordOp::ActivationFailed {
                error,
                backend_refused,
            } => {
                record.activation_failed(error, backend_refused, now);
                true
            },
            RecordOp::Restarted { worker_id, reason } => {
                if record.status.is_terminal() {
                    false
                } else {
                    record.restarted(worker_id, &reason, now);
                    true
                }
            },
            RecordOp::RestartFailed { error } => {
                directive = self.policy.restart_failed(&mut record, &error, now);
                true
            },
            RecordOp::Stopped => {
                record.stopped(now);
                true
            },
            RecordOp::OperatorReset => {
                record.operator_reset(now);
                true
            },
            RecordOp::Insert(_) | RecordOp::Remove => false,
        };
        let status = record.status;
        drop(record);

        debug!(plugin = %plugin, status = %status, applied, "record updated");
        self.dispatch(plugin, directive);
        applied
    }

    fn dispatch(&self, plugin: &PluginName, directive: Directive) {
        match &directive {
            Directive::None => return,
            Directive::Restart { reason } => {
                info!(plugin = %plugin, reason = %reason, "restart requested");
            },
            Directive::Retire { reason } => {
                warn!(plugin = %plugin, reason = %reason, "plugin disabled");
            },
        }
        if self.directives.send((plugin.clone(), directive)).is_err() {
            debug!(plugin = %plugin, "directive receiver gone");
        }
    }
}
