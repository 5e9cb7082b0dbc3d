use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::TransferError;

/// Longest single sleep inside [`watch`], so a finished transfer is noticed
/// before the full render interval runs out.
const POLL_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProgressStatus {
    NotStarted = 0,
    InProgress = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl ProgressStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProgressStatus::NotStarted,
            1 => ProgressStatus::InProgress,
            2 => ProgressStatus::Completed,
            3 => ProgressStatus::Failed,
            _ => ProgressStatus::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::Cancelled
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub status: ProgressStatus,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Bytes per second, `None` while no time has elapsed.
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            Some(self.transferred_bytes as f64 / secs)
        } else {
            None
        }
    }
}

/// Byte counters updated by any number of workers and read by a renderer.
#[derive(Debug, Default)]
pub struct TransferProgress {
    total: AtomicU64,
    transferred: AtomicU64,
    status: AtomicU8,
    started: OnceLock<Instant>,
    finished: OnceLock<Duration>,
}

impl TransferProgress {
    pub fn new(total: u64) -> Self {
        let progress = Self::default();
        progress.total.store(total, Ordering::Relaxed);
        progress
    }

    /// Marks the transfer as running; the clock starts on the first call.
    pub fn start(&self) {
        self.started.get_or_init(Instant::now);
        let _ = self.status.compare_exchange(
            ProgressStatus::NotStarted as u8,
            ProgressStatus::InProgress as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn add(&self, bytes: u64) {
        self.start();
        self.transferred.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn add_total(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn complete(&self) {
        self.finish(ProgressStatus::Completed);
    }

    pub fn fail(&self) {
        self.finish(ProgressStatus::Failed);
    }

    pub fn cancel(&self) {
        self.finish(ProgressStatus::Cancelled);
    }

    /// The first terminal status wins.
    fn finish(&self, status: ProgressStatus) {
        self.started.get_or_init(Instant::now);
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if ProgressStatus::from_u8(current).is_terminal() {
                return;
            }
            match self.status.compare_exchange(
                current,
                status as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let _ = self.finished.set(self.elapsed_now());
    }

    fn elapsed_now(&self) -> Duration {
        self.started
            .get()
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn status(&self) -> ProgressStatus {
        ProgressStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let status = self.status();
        let elapsed = match self.finished.get() {
            Some(d) => *d,
            None => self.elapsed_now(),
        };
        ProgressSnapshot {
            status,
            total_bytes: self.total.load(Ordering::Acquire),
            transferred_bytes: self.transferred(),
            elapsed,
        }
    }
}

/// Polls `progress` every `interval` and hands snapshots to `render` until
/// the status is terminal. Ticks without progress are skipped.
pub fn watch<F>(progress: &TransferProgress, interval: Duration, mut render: F) -> ProgressSnapshot
where
    F: FnMut(&ProgressSnapshot),
{
    loop {
        let snap = progress.snapshot();
        if snap.status.is_terminal() {
            render(&snap);
            return snap;
        }
        if snap.transferred_bytes > 0 && snap.throughput().is_some() {
            render(&snap);
        }
        let deadline = Instant::now() + interval;
        loop {
            let now = Instant::now();
            if now >= deadline || progress.status().is_terminal() {
                break;
            }
            thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }
}

/// Shared cancellation signal checked at suspension points.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), TransferError> {
        if self.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Counts bytes read through it.
pub struct ProgressReader<R> {
    inner: R,
    progress: Arc<TransferProgress>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, progress: Arc<TransferProgress>) -> Self {
        Self { inner, progress }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.progress.add(n as u64);
        Ok(n)
    }
}

/// Counts bytes written through it.
pub struct ProgressWriter<W> {
    inner: W,
    progress: Arc<TransferProgress>,
}

impl<W> ProgressWriter<W> {
    pub fn new(inner: W, progress: Arc<TransferProgress>) -> Self {
        Self { inner, progress }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.progress.add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
