use crate::cluster::FrameWriter;
use bytes::Bytes;
use futures::SinkExt;
use tokio::sync::mpsc;

/// Frames a connection may have queued but not yet written. A peer that stops reading hits this
/// long before it costs the leader real memory.
pub(crate) const OUTBOX_CAPACITY: usize = 1024;

/// Outbox is the only way to write to a connection. Frames queued from any number of clones go
/// out whole and in queue order, via a dedicated writer task that owns the write half.
#[derive(Clone, Debug)]
pub(crate) struct Outbox {
    sender: mpsc::Sender<Bytes>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum OutboxError {
    #[error("Connection writer has exited")]
    Closed,
    #[error("Connection has {0} frames queued and is not draining them")]
    Full(usize),
}

impl Outbox {
    /// Queues `frame` without waiting for it to be written. Either error means the connection
    /// should be treated as gone.
    pub(crate) fn send(&self, frame: Bytes) -> Result<(), OutboxError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OutboxError::Full(OUTBOX_CAPACITY),
            mpsc::error::TrySendError::Closed(_) => OutboxError::Closed,
        })
    }

    pub(crate) fn send_text(&self, text: &str) -> Result<(), OutboxError> {
        self.send(Bytes::copy_from_slice(text.as_bytes()))
    }

    /// An outbox not attached to any socket. Frames sent to it land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (Outbox, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(OUTBOX_CAPACITY);
        (Outbox { sender }, receiver)
    }
}

/// Spawns the writer task for one connection. The task exits, closing the write half, once every
/// clone of the returned outbox has been dropped or the peer stops accepting writes.
pub(crate) fn spawn_writer(logger: slog::Logger, writer: FrameWriter) -> Outbox {
    let (sender, receiver) = mpsc::channel(OUTBOX_CAPACITY);
    tokio::spawn(run_writer(logger, writer, receiver));

    Outbox { sender }
}

async fn run_writer(logger: slog::Logger, mut writer: FrameWriter, mut receiver: mpsc::Receiver<Bytes>) {
    while let Some(frame) = receiver.recv().await {
        if let Err(e) = writer.send(frame).await {
            slog::debug!(logger, "Connection writer exiting after write failure: {:?}", e);
            return;
        }
    }
    slog::debug!(logger, "Connection writer exiting, no senders left");
}
