//! Marshaling onto the UI thread.
//!
//! Widgets belong to the host's single UI thread. Slot data lives behind its own locks and is
//! updated synchronously; only the widget side effects travel through a [`UiDispatcher`].

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

pub type UiTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs closures on the UI thread.
pub trait UiDispatcher: Send + Sync {
    fn dispatch(&self, task: UiTask);
}

/// Runs every task inline on the calling thread. For callers that are the UI thread already.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateDispatcher;

impl UiDispatcher for ImmediateDispatcher {
    fn dispatch(&self, task: UiTask) {
        task();
    }
}

/// Queues tasks for a [`UiLoop`] running on the UI thread.
#[derive(Debug, Clone)]
pub struct QueuedDispatcher {
    tx: UnboundedSender<UiTask>,
}

/// Receiving end of a [`QueuedDispatcher`].
pub struct UiLoop {
    rx: UnboundedReceiver<UiTask>,
}

impl QueuedDispatcher {
    pub fn new() -> (Self, UiLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UiLoop { rx })
    }
}

impl UiDispatcher for QueuedDispatcher {
    fn dispatch(&self, task: UiTask) {
        // the loop is gone on shutdown; nothing left to update
        if self.tx.send(task).is_err() {
            trace!("ui loop closed, dropping task");
        }
    }
}

impl UiLoop {
    /// Run every queued task without waiting. Returns how many ran.
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Run tasks until every dispatcher is dropped.
    pub async fn run(mut self) {
        while let Some(task) = self.rx.recv().await {
            task();
        }
        debug!("ui loop finished");
    }
}
