//! Per-plugin worker slot.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::task::JoinHandle;

use crate::bridge::ScopedContext;
use crate::supervisor::Worker;

/// The running worker and the bridge it was activated with.
#[derive(Debug, Clone)]
pub(crate) struct Active {
    pub(crate) worker: Arc<dyn Worker>,
    pub(crate) bridge: Arc<ScopedContext>,
}

/// Holds at most one worker per plugin.
///
/// Readers get a cloned [`Active`] and call it with no lock held. Start,
/// stop and replacement hold `lifecycle` for their whole duration and touch
/// `active` only to swap the handle.
#[derive(Debug, Default)]
pub(crate) struct WorkerSlot {
    active: RwLock<Option<Active>>,
    /// Serialises start, stop and restart of this plugin.
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
    /// Serialises invokes.
    pub(crate) invoke_gate: tokio::sync::Mutex<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSlot {
    /// The current worker, if any.
    pub(crate) fn current(&self) -> Option<Active> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn take(&self) -> Option<Active> {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn install(&self, active: Active) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(active);
    }

    pub(crate) fn set_monitor(&self, handle: JoinHandle<()>) {
        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub(crate) fn stop_monitor(&self) {
        if let Some(handle) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    pub(crate) fn has_monitor(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
