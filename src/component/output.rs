//! Serialized output: many producers, one writer task, one write in flight.

use super::error::ComponentError;
use super::{guarded, WeakComponent};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Runs after the bytes of one queue entry were handed to the transport.
pub type WriteCallback = Box<dyn FnOnce() + Send + 'static>;

struct QueueEntry {
    bytes: Vec<u8>,
    on_complete: Option<WriteCallback>,
}

/// Producer side of the output queue of one connection.
#[derive(Clone)]
pub(crate) struct OutputQueue {
    tx: mpsc::UnboundedSender<QueueEntry>,
}

impl OutputQueue {
    /// Create the queue and spawn its writer task. The task ends when every producer
    /// is gone.
    pub fn spawn<W>(writer: W, component: WeakComponent, generation: u64) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(writer, rx, component, generation));
        (Self { tx }, task)
    }

    pub fn enqueue(&self, xml: &str, on_complete: Option<WriteCallback>) -> Result<(), ComponentError> {
        debug!(xml = %xml, "TX");
        self.tx
            .send(QueueEntry {
                bytes: xml.as_bytes().to_vec(),
                on_complete,
            })
            .map_err(|_| ComponentError::NotConnected)
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<QueueEntry>,
    component: WeakComponent,
    generation: u64,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(entry) = rx.recv().await {
        let result = async {
            writer.write_all(&entry.bytes).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            // Everything still queued is lost with the transport.
            rx.close();
            let dropped = std::iter::from_fn(|| rx.try_recv().ok()).count();
            error!(error = %e, error_kind = ?e.kind(), dropped, "Write failed");
            if let Some(component) = component.upgrade() {
                component.connection_failed(generation, ComponentError::Transport(e));
            }
            return;
        }

        if let Some(callback) = entry.on_complete {
            guarded("write completion", callback);
        }
        match component.upgrade() {
            Some(component) => component.refresh_keep_alive(),
            None => break,
        }
    }
    debug!(generation, "Output queue closed");
}
