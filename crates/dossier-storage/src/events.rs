//! Completion event sinks. Delivery is fire-and-forget.

use dossier_core::CompletionEvent;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub trait CompletionSink: Send + Sync {
    fn emit(&self, event: CompletionEvent);
}

#[derive(Debug, Default)]
pub struct TracingCompletionSink;

impl CompletionSink for TracingCompletionSink {
    fn emit(&self, event: CompletionEvent) {
        info!(
            job_id = %event.job_id,
            user_id = %event.user_id,
            dossier_id = ?event.dossier_id,
            status = %event.status,
            "job reached terminal state"
        );
    }
}

/// Forwards events to an in-process consumer such as a notifier task.
#[derive(Debug, Clone)]
pub struct ChannelCompletionSink {
    tx: mpsc::UnboundedSender<CompletionEvent>,
}

impl ChannelCompletionSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CompletionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CompletionSink for ChannelCompletionSink {
    fn emit(&self, event: CompletionEvent) {
        if let Err(err) = self.tx.send(event) {
            warn!(job_id = %err.0.job_id, "completion event dropped: receiver closed");
        }
    }
}
