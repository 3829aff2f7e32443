//! Streams executor output into a deployment's log
//!
//! Lines are sent over a channel and appended in batches: the pump drains
//! whatever is queued before each write transaction.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::models::deployment::LogStream;
use crate::store::StateStore;

enum LogEntry {
    Line(LogStream, String),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle used to append lines to one deployment's log
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl LogSink {
    pub fn line(&self, stream: LogStream, line: impl Into<String>) {
        // the pump only stops once every sink is gone
        let _ = self.tx.send(LogEntry::Line(stream, line.into()));
    }

    pub fn system(&self, line: impl Into<String>) {
        self.line(LogStream::System, line);
    }

    /// Wait until everything sent so far has been written
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(LogEntry::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// Start the pump task for `deployment_id`
pub fn start(store: StateStore, deployment_id: String) -> (LogSink, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run(store, deployment_id, rx));
    (LogSink { tx }, handle)
}

async fn run(store: StateStore, deployment_id: String, mut rx: mpsc::UnboundedReceiver<LogEntry>) {
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::new();
        let mut acks = Vec::new();
        let mut next = Some(first);
        while let Some(entry) = next {
            match entry {
                LogEntry::Line(stream, line) => batch.push((stream, line)),
                LogEntry::Flush(ack) => acks.push(ack),
            }
            next = rx.try_recv().ok();
        }

        if !batch.is_empty() {
            match store.append_logs(&deployment_id, &batch) {
                Ok(seq) => trace!(deployment_id, seq, lines = batch.len(), "log batch appended"),
                Err(e) => error!(deployment_id, "failed to append {} log lines: {}", batch.len(), e),
            }
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }
}
