//! Background writer that persists raised watermarks.
//!
//! Requests are queued from inside the per-domain critical section and drained
//! by one detached task, so writes reach the store in the order the watermarks
//! were raised. Nothing on the connection path ever awaits a write.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::db::kv::KeyValueStore;

use super::stats::Watermark;

enum WriteRequest {
    Persist { domain: String, watermark: Watermark },
    Flush(oneshot::Sender<()>),
}

/// Handle to the writer task. The task exits once every handle is dropped.
#[derive(Clone)]
pub struct WatermarkWriter {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl WatermarkWriter {
    /// Spawn the writer task on the current tokio runtime.
    pub fn spawn(store: Arc<dyn KeyValueStore>, collection: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(rx, store, collection.into()));
        Self { tx }
    }

    /// Queue a write of `watermark` for `domain`. Never blocks.
    pub fn persist(&self, domain: &str, watermark: Watermark) {
        let request = WriteRequest::Persist {
            domain: domain.to_string(),
            watermark,
        };
        if self.tx.send(request).is_err() {
            tracing::warn!(%domain, "watermark writer has stopped, dropping write");
        }
    }

    /// Wait until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteRequest::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
    store: Arc<dyn KeyValueStore>,
    collection: String,
) {
    while let Some(request) = rx.recv().await {
        match request {
            WriteRequest::Persist { domain, watermark } => {
                persist_watermark(store.as_ref(), &collection, &domain, &watermark).await;
            }
            WriteRequest::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("watermark writer stopped");
}

/// Write one watermark record. Failures are logged and swallowed; the
/// in-memory watermark stays authoritative.
pub async fn persist_watermark(
    store: &dyn KeyValueStore,
    collection: &str,
    domain: &str,
    watermark: &Watermark,
) {
    let record = match watermark.encode() {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(%domain, %err, "failed to encode watermark");
            return;
        }
    };

    match store.set_field(collection, domain, &record).await {
        Ok(()) => tracing::debug!(
            %domain,
            max_current_users = watermark.max_current_users,
            "watermark persisted"
        ),
        Err(err) => tracing::warn!(%domain, %err, "failed to persist watermark"),
    }
}
