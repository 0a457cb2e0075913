use log::{debug, error, warn};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::libc;
use nix::sys::stat::Mode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{GpioError, WorkerFault, WorkerKind};

const PIPE_WRITE_RETRY: Duration = Duration::from_millis(1);
// PIPE_BUF on Linux: FIFO writes up to this size are never split
const ATOMIC_PIPE_WRITE: usize = 4096;

/// One recorded pin transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub pin: u32,
    pub level: u8,
    pub timestamp_ns: u64,
}

impl LogEvent {
    pub fn now(pin: u32, level: u8) -> Self {
        Self {
            pin,
            level,
            timestamp_ns: epoch_nanos(),
        }
    }
}

/// Renders as `(pin, level, timestamp_ns)`, one record per transport line.
impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.pin, self.level, self.timestamp_ns)
    }
}

impl FromStr for LogEvent {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GpioError::InvalidValue(format!("malformed log record: {s:?}"));
        let inner = s
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(invalid)?;
        let mut fields = inner.split(',').map(str::trim);
        let mut next = || fields.next().ok_or_else(invalid);
        let pin = next()?.parse().map_err(|_| invalid())?;
        let level = next()?.parse().map_err(|_| invalid())?;
        let timestamp_ns = next()?.parse().map_err(|_| invalid())?;
        if fields.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            pin,
            level,
            timestamp_ns,
        })
    }
}

pub(crate) fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Bounded, insertion-ordered buffer of pin transitions.
///
/// Recording never blocks on I/O: the lock is held only to append or to
/// take the whole buffer. Once full, the oldest events are evicted first.
pub struct EventLog {
    buffer: Mutex<VecDeque<LogEvent>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, pin: u32, level: u8) {
        self.push(LogEvent::now(pin, level));
    }

    pub fn push(&self, event: LogEvent) {
        let mut buffer = self.buffer.lock();
        while buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }

    /// Takes every buffered event, leaving the buffer empty.
    pub fn drain(&self) -> Vec<LogEvent> {
        let taken = std::mem::take(&mut *self.buffer.lock());
        taken.into()
    }

    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.buffer.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Named pipe the flush loop streams records into.
pub struct PipeTransport {
    path: PathBuf,
    write_timeout: Duration,
}

impl PipeTransport {
    /// Creates the FIFO at `path` unless something already exists there.
    pub fn create<P: AsRef<Path>>(path: P, write_timeout: Duration) -> Result<Self, GpioError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o666))
                .map_err(|e| GpioError::Driver(format!("mkfifo {}: {e}", path.display())))?;
        }
        Ok(Self {
            path,
            write_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one line per event and returns how many records went out whole.
    ///
    /// Lines are grouped into writes of at most `PIPE_BUF` bytes, which a
    /// FIFO accepts entirely or not at all, so a stalled reader never
    /// sees half a record. Opening is non-blocking: a pipe without a reader
    /// fails fast with `ENXIO` instead of stalling the caller.
    pub fn write_batch(&self, events: &[LogEvent]) -> io::Result<usize> {
        let mut file = OpenOptions::new()
            .write(true)
            .append(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)?;

        let deadline = Instant::now() + self.write_timeout;
        let mut delivered = 0;
        for (chunk, records) in frame_records(events) {
            match write_whole(&mut file, chunk.as_bytes(), deadline) {
                Ok(true) => delivered += records,
                Ok(false) => break,
                Err(e) if delivered > 0 && is_transient(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(delivered)
    }
}

/// Packs newline-terminated records into chunks that each fit one atomic
/// pipe write. Returns every chunk with the number of records it carries.
fn frame_records(events: &[LogEvent]) -> Vec<(String, usize)> {
    let mut chunks = Vec::new();
    let mut chunk = String::new();
    let mut records = 0;
    for event in events {
        let line = format!("{event}\n");
        if !chunk.is_empty() && chunk.len() + line.len() > ATOMIC_PIPE_WRITE {
            chunks.push((std::mem::take(&mut chunk), records));
            records = 0;
        }
        chunk.push_str(&line);
        records += 1;
    }
    if !chunk.is_empty() {
        chunks.push((chunk, records));
    }
    chunks
}

/// Writes all of `bytes`. Returns `Ok(false)` when the reader stayed full
/// past `deadline` before anything was written. Once part of the chunk is
/// out, the rest follows regardless of the deadline.
fn write_whole(file: &mut File, mut bytes: &[u8], deadline: Instant) -> io::Result<bool> {
    let total = bytes.len();
    while !bytes.is_empty() {
        match file.write(bytes) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if bytes.len() == total && Instant::now() >= deadline {
                    return Ok(false);
                }
                thread::sleep(PIPE_WRITE_RETRY);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Conditions that only mean "nobody is listening right now".
fn is_transient(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENXIO)
        || matches!(err.kind(), ErrorKind::BrokenPipe | ErrorKind::WouldBlock)
}

pub(crate) fn flush_once(log: &EventLog, transport: &PipeTransport) -> io::Result<usize> {
    let batch = log.drain();
    if batch.is_empty() {
        return Ok(0);
    }

    match transport.write_batch(&batch) {
        Ok(delivered) => {
            debug!("flushed {delivered} events to {}", transport.path().display());
            if delivered < batch.len() {
                debug!(
                    "dropped {} events, reader is not draining the pipe",
                    batch.len() - delivered
                );
            }
            Ok(delivered)
        }
        Err(e) if is_transient(&e) => {
            debug!("dropped {} events, transport unavailable: {e}", batch.len());
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// Background thread draining an [`EventLog`] into a [`PipeTransport`].
pub(crate) struct LogFlusher {
    handle: Option<JoinHandle<()>>,
}

impl LogFlusher {
    pub(crate) fn spawn(
        log: Arc<EventLog>,
        transport: PipeTransport,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
        faults: broadcast::Sender<WorkerFault>,
    ) -> Result<Self, GpioError> {
        let handle = thread::Builder::new()
            .name("event-log-flush".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    if let Err(e) = flush_once(&log, &transport) {
                        error!("event log flush stopped: {e}");
                        let _ = faults.send(WorkerFault {
                            worker: WorkerKind::LogFlush,
                            message: e.to_string(),
                        });
                        return;
                    }
                }
                if let Err(e) = flush_once(&log, &transport) {
                    warn!("final event log flush failed: {e}");
                }
            })
            .map_err(|e| GpioError::Driver(format!("spawn flush thread: {e}")))?;

        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Joins the thread; the caller must have raised the shutdown flag.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
