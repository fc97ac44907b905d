use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::entry::DecisionEntry;
use crate::writer::{DecisionWriteError, DecisionWriter};

/// Tuning knobs for the background writer.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Entries that may queue before [`DecisionSink::record`] starts
    /// shedding.
    pub queue_depth: usize,
    /// Upper bound on entries folded into one write.
    pub max_batch: usize,
    /// Rotate the active file once it would grow past this many bytes.
    pub rotate_at: Option<u64>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_depth: 4096,
            max_batch: 64,
            rotate_at: None,
        }
    }
}

/// Handle for submitting entries to the background decision-log writer.
///
/// Submission never blocks and never awaits: enforcement runs on the
/// caller's thread, and an audit trail that can stall the decision path
/// is worse than one that sheds load. When the queue is full the entry
/// is dropped and counted; [`dropped`](Self::dropped) exposes the tally
/// so embedders can alarm on it.
///
/// The handle is `Clone + Send + Sync`; clones feed the same writer.
#[derive(Clone)]
pub struct DecisionSink {
    tx: mpsc::Sender<DecisionEntry>,
    dropped: Arc<AtomicU64>,
}

impl DecisionSink {
    /// Open the trail at `path` with default tuning and spawn the writer
    /// task. Returns the sink and the task handle; the task exits after a
    /// final flush once every sink clone is gone.
    pub async fn spawn(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<()>), DecisionWriteError> {
        Self::spawn_with(path, SinkConfig::default()).await
    }

    /// Open the trail with explicit tuning.
    pub async fn spawn_with(
        path: impl AsRef<Path>,
        config: SinkConfig,
    ) -> Result<(Self, JoinHandle<()>), DecisionWriteError> {
        let writer = match config.rotate_at {
            Some(limit) => DecisionWriter::with_rotation(path.as_ref(), limit).await?,
            None => DecisionWriter::create(path.as_ref()).await?,
        };

        let (tx, rx) = mpsc::channel(config.queue_depth);
        let handle = tokio::spawn(drain(writer, rx, config.max_batch));
        Ok((
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        ))
    }

    /// Queue an entry without waiting. Safe to call from synchronous
    /// code, including right where a decision was made.
    pub fn record(&self, entry: DecisionEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event_type = ?entry.event_type,
                    "decision log queue full; entry shed"
                );
            }
            Err(TrySendError::Closed(entry)) => {
                tracing::warn!(
                    event_type = ?entry.event_type,
                    "decision log writer has exited; entry dropped"
                );
            }
        }
    }

    /// How many entries were shed because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Writer-task loop: pull whatever has queued up (up to `max_batch` at a
/// time), land it in one write, and flush whenever the queue runs dry so
/// a quiet period always leaves the trail durable. `recv_many` returning
/// zero means every sink handle is gone; flush once more and stop.
async fn drain(
    mut writer: DecisionWriter,
    mut rx: mpsc::Receiver<DecisionEntry>,
    max_batch: usize,
) {
    let mut batch: Vec<DecisionEntry> = Vec::with_capacity(max_batch);
    loop {
        let received = rx.recv_many(&mut batch, max_batch).await;
        if received == 0 {
            if let Err(error) = writer.flush().await {
                tracing::error!(%error, "final decision log flush failed");
            }
            tracing::debug!("decision log writer task stopping");
            return;
        }

        if let Err(error) = writer.append_batch(&batch).await {
            tracing::error!(%error, discarded = batch.len(), "decision log batch write failed");
        }
        batch.clear();

        if rx.is_empty() {
            if let Err(error) = writer.flush().await {
                tracing::error!(%error, "decision log flush failed");
            }
        }
    }
}
