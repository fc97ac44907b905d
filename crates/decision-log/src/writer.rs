use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::entry::DecisionEntry;

/// Errors raised by decision-log I/O. The `op` field names the step that
/// failed, so one variant covers the whole file lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum DecisionWriteError {
    #[error("failed to serialize decision entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("decision log I/O failed while trying to {op}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(op: &'static str) -> impl FnOnce(std::io::Error) -> DecisionWriteError {
    move |source| DecisionWriteError::Io { op, source }
}

/// Batched JSON-lines writer for the decision audit trail.
///
/// Entries are serialised into one buffer and appended with a single
/// write per batch, which keeps syscall count proportional to decision
/// bursts rather than to individual decisions. An optional size limit
/// rotates the active file: the current file is renamed to `<path>.1`
/// (replacing any earlier rotation) and a fresh file is started, so the
/// trail holds at most two generations on disk.
pub struct DecisionWriter {
    path: PathBuf,
    file: tokio::fs::File,
    written: u64,
    rotate_at: Option<u64>,
}

impl DecisionWriter {
    /// Open the audit trail at `path` with no size limit.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, DecisionWriteError> {
        Self::open(path.into(), None).await
    }

    /// Open the audit trail at `path`, rotating once the active file
    /// would grow past `rotate_at` bytes.
    pub async fn with_rotation(
        path: impl Into<PathBuf>,
        rotate_at: u64,
    ) -> Result<Self, DecisionWriteError> {
        Self::open(path.into(), Some(rotate_at)).await
    }

    async fn open(path: PathBuf, rotate_at: Option<u64>) -> Result<Self, DecisionWriteError> {
        let (file, written) = open_active(&path).await?;
        Ok(Self {
            path,
            file,
            written,
            rotate_at,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended to the active file so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Serialise `entries` as newline-terminated JSON objects and append
    /// them in one write. Returns the number of bytes appended.
    pub async fn append_batch(
        &mut self,
        entries: &[DecisionEntry],
    ) -> Result<usize, DecisionWriteError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::with_capacity(entries.len() * 256);
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        self.rotate_if_full(buf.len() as u64).await?;
        self.file.write_all(&buf).await.map_err(io_err("append"))?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    /// Push buffered bytes down to the file.
    pub async fn flush(&mut self) -> Result<(), DecisionWriteError> {
        self.file.flush().await.map_err(io_err("flush"))
    }

    /// Rotate before a write that would push the active file past its
    /// limit. A batch larger than the limit still lands in one file; the
    /// trail never splits a batch.
    async fn rotate_if_full(&mut self, incoming: u64) -> Result<(), DecisionWriteError> {
        let Some(limit) = self.rotate_at else {
            return Ok(());
        };
        if self.written == 0 || self.written + incoming <= limit {
            return Ok(());
        }

        self.file.flush().await.map_err(io_err("flush before rotation"))?;
        let mut rotated = self.path.clone().into_os_string();
        rotated.push(".1");
        tokio::fs::rename(&self.path, PathBuf::from(rotated))
            .await
            .map_err(io_err("rotate"))?;

        let (file, written) = open_active(&self.path).await?;
        self.file = file;
        self.written = written;
        Ok(())
    }
}

async fn open_active(path: &Path) -> Result<(tokio::fs::File, u64), DecisionWriteError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_err("create parent directory"))?;
    }

    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err("open"))?;
    let written = file.metadata().await.map_err(io_err("stat"))?.len();
    Ok((file, written))
}
