//! # palaver-log: Durable append-only operation log
//!
//! One file per replica, one marshalled operation per line, flushed and
//! synced after every append. The line count *is* the replica's progress:
//! the protocol compares progress numbers during the peer handshake and
//! catch-up, and `slice` serves catch-up reads by position.
//!
//! Only replicated operations are representable here — [`Op`] has no
//! query variants, so `list`/`logs` and the in-memory takeover marker can
//! never touch the file.
//!
//! # File Layout
//!
//! ```text
//! {data_dir}/
//! └── {replica_name}.log    <- "ream@@create\nream@@send@@mark@@hi\n..."
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use palaver_types::Progress;
use palaver_wire::{Op, WireError};

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors from the durable log. `Io` during an append is fatal to the
/// replica process (the callers treat it so); the rest are boot-time or
/// caller errors.
#[derive(Debug, Error)]
pub enum LogError {
    /// Reading or writing the log file failed.
    #[error("log i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A line on disk does not parse as a replicated operation.
    #[error("corrupt log record at line {line}: {source}")]
    Corrupt { line: usize, source: WireError },

    /// An op failed to marshal. Unreachable for codec-delivered ops; kept
    /// as an error so no append path panics.
    #[error("op failed to marshal: {0}")]
    Encode(WireError),

    /// `slice` was asked for positions the log does not hold.
    #[error("slice range [{lo}, {hi}) out of bounds for progress {progress}")]
    BadRange { lo: u64, hi: u64, progress: u64 },
}

/// The durable operation log of one replica.
#[derive(Debug)]
pub struct OpLog {
    path: PathBuf,
    file: File,
    progress: Progress,
}

impl OpLog {
    /// Opens (creating if absent) the log at `path` and rehydrates it.
    ///
    /// Returns the log handle plus every operation already on disk, in
    /// append order, so the caller can replay them through the state
    /// machine before serving.
    pub fn open(path: impl AsRef<Path>) -> LogResult<(OpLog, Vec<Op>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let ops = if path.exists() {
            read_ops(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let progress = Progress::new(ops.len() as u64);
        debug!(path = %path.display(), progress = %progress, "log opened");

        Ok((
            OpLog {
                path,
                file,
                progress,
            },
            ops,
        ))
    }

    /// Appends one operation: writes the marshalled line, flushes, and
    /// syncs to stable storage before advancing progress.
    pub fn append(&mut self, op: &Op) -> LogResult<()> {
        let line = op.marshal().map_err(LogError::Encode)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.progress.advance();
        Ok(())
    }

    /// Count of durably-appended operations.
    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the operations at positions `[lo, hi)`, in append order.
    /// Used to serve catch-up slices.
    pub fn slice(&self, lo: u64, hi: u64) -> LogResult<Vec<Op>> {
        let progress = self.progress.as_u64();
        if lo > hi || hi > progress {
            return Err(LogError::BadRange { lo, hi, progress });
        }
        let ops = read_ops(&self.path)?;
        Ok(ops[lo as usize..hi as usize].to_vec())
    }
}

fn read_ops(path: &Path) -> LogResult<Vec<Op>> {
    let reader = BufReader::new(File::open(path)?);
    let mut ops = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let op = Op::unmarshal(&line).map_err(|source| LogError::Corrupt {
            line: idx + 1,
            source,
        })?;
        ops.push(op);
    }
    Ok(ops)
}
