//! Append-only log of committed writes with group commit.
//!
//! Each entry is framed as `[u32 length BE][u32 CRC32 BE][bincode payload]`.
//! Appends are handed to a dedicated writer thread that batches whatever is queued
//! into one write + `fsync` cycle, so async callers never block on disk.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const LOG_FILE: &str = "wal.bin";
const COMPACT_FILE: &str = "wal.bin.compact";
/// Queued appends accepted before senders wait.
const QUEUE_DEPTH: usize = 1024;
/// Appends written per fsync at most.
const MAX_BATCH: usize = 64;

/// A single durable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntry {
    /// The writes of one committed transaction, applied all-or-nothing on replay.
    Commit { writes: Vec<(String, Vec<u8>)> },
}

/// Diagnostic statistics from a log replay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    /// Entries successfully deserialized.
    pub success: usize,
    /// Entries skipped because they failed to deserialize (CRC was valid).
    pub skipped: usize,
    /// CRC mismatches encountered (replay stopped).
    pub crc_errors: usize,
    /// Whether replay was terminated by a truncated entry.
    pub truncated: bool,
}

impl ReplayStats {
    /// True when every byte of the log was accounted for.
    pub fn is_clean(&self) -> bool {
        self.skipped == 0 && self.crc_errors == 0 && !self.truncated
    }
}

/// One queued append.
struct GroupCommitRequest {
    framed: Vec<u8>,
    /// Runs after the batch is durable, under the file lock. Dropped unrun on failure.
    apply: Box<dyn FnOnce() + Send>,
    result_tx: oneshot::Sender<io::Result<()>>,
}

struct Shared {
    writer: Mutex<BufWriter<File>>,
    dir: PathBuf,
    /// Set when a failed append could not be rolled back; cleared by a rewrite.
    poisoned: AtomicBool,
    /// Bytes of the next frame to write before failing it.
    #[cfg(test)]
    tear_next: Mutex<Option<usize>>,
}

impl Shared {
    fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }
}

/// Append-only log file with CRC32 integrity checks.
pub struct WriteAheadLog {
    submit_tx: mpsc::Sender<GroupCommitRequest>,
    shared: Arc<Shared>,
}

impl WriteAheadLog {
    /// Open or create `<dir>/wal.bin` in append mode and start the writer thread.
    ///
    /// The thread exits once the log is dropped and its queue drains.
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = open_append(&dir.join(LOG_FILE))?;
        let shared = Arc::new(Shared {
            writer: Mutex::new(BufWriter::new(file)),
            dir: dir.to_path_buf(),
            poisoned: AtomicBool::new(false),
            #[cfg(test)]
            tear_next: Mutex::new(None),
        });

        let (submit_tx, submit_rx) = mpsc::channel(QUEUE_DEPTH);
        let task_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("ratekeeper-wal".into())
            .spawn(move || batch_writer_loop(submit_rx, task_shared))?;

        Ok(Self { submit_tx, shared })
    }

    pub fn path(&self) -> PathBuf {
        self.shared.path()
    }

    /// True after a failed append whose partial frame could not be removed.
    /// Appends fail until [`rewrite`](Self::rewrite) succeeds.
    pub fn is_poisoned(&self) -> bool {
        self.shared.poisoned.load(Ordering::Acquire)
    }

    /// Durably append `entry`, then run `apply` with it.
    ///
    /// `apply` runs on the writer thread after `fsync`, before any later append or
    /// rewrite, so a concurrent [`rewrite`](Self::rewrite) never snapshots state
    /// older than the log. Once the entry is queued it is written whether or not
    /// the returned future is still polled; if the append fails `apply` is dropped
    /// without running.
    pub async fn append<F>(&self, entry: WalEntry, apply: F) -> io::Result<()>
    where
        F: FnOnce(WalEntry) + Send + 'static,
    {
        let framed = serialize_and_frame(&entry)?;
        let (result_tx, result_rx) = oneshot::channel();
        self.submit_tx
            .send(GroupCommitRequest {
                framed,
                apply: Box::new(move || apply(entry)),
                result_tx,
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer stopped"))?;

        result_rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "WAL append result lost"))?
    }

    /// Read all entries sequentially, verifying CRC32 checksums.
    ///
    /// Stops at the first truncated or CRC-mismatched frame.
    pub fn replay(&self) -> io::Result<(Vec<WalEntry>, ReplayStats)> {
        let _w = self.shared.writer.lock();
        let file = File::open(self.path())?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut stats = ReplayStats::default();
        let mut header_buf = [0u8; 8];

        loop {
            match read_full(&mut reader, &mut header_buf)? {
                Fill::Empty => break,
                Fill::Partial => {
                    tracing::warn!("WAL truncated mid-header, stopping replay");
                    stats.truncated = true;
                    break;
                }
                Fill::Full => {}
            }
            let len =
                u32::from_be_bytes([header_buf[0], header_buf[1], header_buf[2], header_buf[3]])
                    as usize;
            let stored_crc =
                u32::from_be_bytes([header_buf[4], header_buf[5], header_buf[6], header_buf[7]]);
            let mut data = vec![0u8; len];
            if !matches!(read_full(&mut reader, &mut data)?, Fill::Full) {
                tracing::warn!("WAL truncated mid-entry, stopping replay");
                stats.truncated = true;
                break;
            }
            if crc32fast::hash(&data) != stored_crc {
                tracing::warn!("WAL entry CRC mismatch, stopping replay");
                stats.crc_errors += 1;
                break;
            }
            match bincode::deserialize::<WalEntry>(&data) {
                Ok(entry) => {
                    entries.push(entry);
                    stats.success += 1;
                }
                Err(e) => {
                    tracing::warn!("WAL entry deserialization failed, skipping: {}", e);
                    stats.skipped += 1;
                }
            }
        }

        Ok((entries, stats))
    }

    /// Replace the log with `snapshot`, blocking appends for the duration.
    ///
    /// `snapshot` runs under the writer lock, so it observes every applied append.
    /// The new log is written beside the old one, fsynced, then renamed over it.
    /// A successful rewrite clears the poisoned flag.
    pub fn rewrite<F>(&self, snapshot: F) -> io::Result<()>
    where
        F: FnOnce() -> Vec<WalEntry>,
    {
        let mut writer = self.shared.writer.lock();

        let compact_path = self.shared.dir.join(COMPACT_FILE);
        {
            let mut out = BufWriter::new(
                OpenOptions::new().create(true).write(true).truncate(true).open(&compact_path)?,
            );
            for entry in snapshot() {
                out.write_all(&serialize_and_frame(&entry)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&compact_path, self.path())?;
        #[cfg(unix)]
        File::open(&self.shared.dir)?.sync_all()?;

        // The old file is gone; nothing left in its buffer may reach disk.
        discard(&mut writer, open_append(&self.path())?);
        self.shared.poisoned.store(false, Ordering::Release);
        Ok(())
    }

    /// Fsync the log.
    pub fn sync(&self) -> io::Result<()> {
        if self.is_poisoned() {
            return Err(poisoned());
        }
        let mut w = self.shared.writer.lock();
        w.flush()?;
        w.get_mut().sync_all()
    }

    /// Fail the next append after writing `bytes` of its frame.
    #[cfg(test)]
    pub(crate) fn tear_next_append(&self, bytes: usize) {
        *self.shared.tear_next.lock() = Some(bytes);
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        self.shared.poisoned.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

/// Writer thread: block for one request, drain whatever else is queued, flush.
fn batch_writer_loop(mut rx: mpsc::Receiver<GroupCommitRequest>, shared: Arc<Shared>) {
    let mut batch: Vec<GroupCommitRequest> = Vec::with_capacity(MAX_BATCH);
    while let Some(first) = rx.blocking_recv() {
        batch.push(first);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(req) => batch.push(req),
                Err(_) => break,
            }
        }
        flush_batch(&mut batch, &shared);
    }
    tracing::debug!("WAL writer stopped");
}

/// Write every frame, fsync once, then apply and acknowledge in order.
///
/// On failure the file is cut back to its length before the batch and the
/// buffered bytes are discarded, so the next batch never lands behind a torn
/// frame. If that rollback fails too, the log is poisoned.
fn flush_batch(batch: &mut Vec<GroupCommitRequest>, shared: &Shared) {
    let mut w = shared.writer.lock();

    if shared.poisoned.load(Ordering::Acquire) {
        fail_all(batch, &poisoned());
        return;
    }

    let start = match w.get_ref().metadata() {
        Ok(meta) => meta.len(),
        Err(e) => {
            fail_all(batch, &e);
            return;
        }
    };

    match write_frames(&mut w, batch, shared) {
        Ok(()) => {
            for req in batch.drain(..) {
                (req.apply)();
                let _ = req.result_tx.send(Ok(()));
            }
        }
        Err(e) => {
            tracing::error!(error = %e, entries = batch.len(), "WAL append failed, rolling back");
            if let Err(rollback) = roll_back(&mut w, &shared.path(), start) {
                tracing::error!(error = %rollback, "WAL rollback failed, log poisoned");
                shared.poisoned.store(true, Ordering::Release);
            }
            fail_all(batch, &e);
        }
    }
}

fn write_frames(
    w: &mut BufWriter<File>,
    batch: &[GroupCommitRequest],
    #[allow(unused_variables)] shared: &Shared,
) -> io::Result<()> {
    for req in batch {
        #[cfg(test)]
        if let Some(bytes) = shared.tear_next.lock().take() {
            w.write_all(&req.framed[..bytes.min(req.framed.len())])?;
            w.flush()?;
            return Err(io::Error::other("injected write failure"));
        }
        w.write_all(&req.framed)?;
    }
    w.flush()?;
    w.get_mut().sync_all()
}

fn roll_back(w: &mut BufWriter<File>, path: &Path, len: u64) -> io::Result<()> {
    discard(w, open_append(path)?);
    w.get_ref().set_len(len)?;
    w.get_ref().sync_all()
}

/// Swap in `file` and drop the old writer's buffer without flushing it.
fn discard(w: &mut BufWriter<File>, file: File) {
    let stale = std::mem::replace(w, BufWriter::new(file));
    let (_file, _unwritten) = stale.into_parts();
}

fn fail_all(batch: &mut Vec<GroupCommitRequest>, err: &io::Error) {
    for GroupCommitRequest { apply, result_tx, .. } in batch.drain(..) {
        // Release whatever the caller handed over before it hears back.
        drop(apply);
        let _ = result_tx.send(Err(io::Error::new(err.kind(), err.to_string())));
    }
}

fn poisoned() -> io::Error {
    io::Error::other("WAL is poisoned by an unrecoverable append failure")
}

fn open_append(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

enum Fill {
    Empty,
    Partial,
    Full,
}

/// Like `read_exact`, but distinguishes a clean EOF from a torn frame.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(match filled {
        0 if !buf.is_empty() => Fill::Empty,
        n if n == buf.len() => Fill::Full,
        _ => Fill::Partial,
    })
}

/// Serialize an entry into its on-disk frame format:
/// `[u32 len BE][u32 crc32 BE][bincode payload]`.
fn serialize_and_frame(entry: &WalEntry) -> io::Result<Vec<u8>> {
    let bytes = bincode::serialize(entry).map_err(|e| io::Error::other(e.to_string()))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "WAL entry too large"))?;
    let crc = crc32fast::hash(&bytes);

    let mut framed = Vec::with_capacity(8 + bytes.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&crc.to_be_bytes());
    framed.extend_from_slice(&bytes);
    Ok(framed)
}
