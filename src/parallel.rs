use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::error::TransferError;
use crate::models::Entry;
use crate::progress::{CancelFlag, ProgressWriter, TransferProgress};

/// Result of one item.
#[derive(Debug)]
pub struct ItemOutcome {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub result: Result<u64, TransferError>,
}

#[derive(Debug, Default)]
pub struct TransferReport {
    pub outcomes: Vec<ItemOutcome>,
    pub batch_sizes: Vec<usize>,
    /// Bytes of the items that succeeded. The shared progress also counts
    /// whatever a failed item received before it failed.
    pub total_bytes: u64,
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// Bytes per second over the whole run.
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (secs > 0.0).then(|| self.total_bytes as f64 / secs)
    }
}

pub struct ParallelTransferEngine {
    client: ApiClient,
    progress: Arc<TransferProgress>,
    cancel: CancelFlag,
}

impl ParallelTransferEngine {
    pub fn new(client: ApiClient, cancel: CancelFlag) -> Self {
        Self {
            client,
            progress: Arc::new(TransferProgress::new(0)),
            cancel,
        }
    }

    pub fn progress(&self) -> Arc<TransferProgress> {
        Arc::clone(&self.progress)
    }

    /// Downloads every file in `items` into `dest`, `batch_size` at a time.
    ///
    /// Each batch runs to completion before the next one is dispatched.
    /// Per-item failures land in the report; only setup errors are returned.
    pub fn run(
        &self,
        items: &[Entry],
        dest: &Path,
        batch_size: usize,
    ) -> Result<TransferReport, TransferError> {
        let started = Instant::now();
        let batch_size = batch_size.max(1);
        if let Err(e) = fs::create_dir_all(dest) {
            self.progress.fail();
            return Err(e.into());
        }

        let files: Vec<&Entry> = items.iter().filter(|e| !e.is_folder()).collect();
        self.progress
            .add_total(files.iter().map(|e| e.size).sum());
        self.progress.start();

        let mut report = TransferReport::default();
        for (index, batch) in files.chunks(batch_size).enumerate() {
            info!(batch = index, items = batch.len(), "dispatching batch");
            let pool = ThreadPoolBuilder::new()
                .num_threads(batch.len())
                .thread_name(move |i| format!("fetch-{}-{}", index, i))
                .build()
                .map_err(io::Error::other)?;
            let results: Vec<Result<u64, TransferError>> = pool.install(|| {
                batch
                    .par_iter()
                    .map(|entry| fetch_entry(&self.client, entry, dest, &self.progress, &self.cancel))
                    .collect()
            });

            report.batch_sizes.push(batch.len());
            for (entry, result) in batch.iter().zip(results) {
                match &result {
                    Ok(bytes) => report.total_bytes += bytes,
                    Err(e) => warn!(path = %entry.remote_path(), error = %e, "item failed"),
                }
                report.outcomes.push(ItemOutcome {
                    remote_path: entry.remote_path().to_string(),
                    local_path: dest.join(&entry.name),
                    result,
                });
            }
        }

        report.elapsed = started.elapsed();
        if self.cancel.is_cancelled() {
            self.progress.cancel();
        } else if report.failed().next().is_some() {
            self.progress.fail();
        } else {
            self.progress.complete();
        }
        info!(
            files = report.outcomes.len(),
            failed = report.failed().count(),
            bytes = report.total_bytes,
            "parallel transfer finished"
        );
        Ok(report)
    }
}

/// Worker body: downloads one entry to `dest/<name>`.
pub fn fetch_entry(
    client: &ApiClient,
    entry: &Entry,
    dest: &Path,
    progress: &Arc<TransferProgress>,
    cancel: &CancelFlag,
) -> Result<u64, TransferError> {
    cancel.check()?;
    let local = dest.join(&entry.name);
    debug!(path = %entry.remote_path(), local = %local.display(), "fetching");
    fetch_to(client, entry.remote_path(), &local, entry.size, progress)
}

/// Streams `remote_path` into `local`, replacing any existing file, and
/// checks the byte count against `expected`.
///
/// A file that fails while being written is removed again.
pub fn fetch_to(
    client: &ApiClient,
    remote_path: &str,
    local: &Path,
    expected: u64,
    progress: &Arc<TransferProgress>,
) -> Result<u64, TransferError> {
    let resp = client.download(remote_path, None)?;
    let mut body = resp.into_reader();
    let file = File::create(local)?;
    let res = write_body(&mut body, file, progress).and_then(|written| {
        if written == expected {
            Ok(written)
        } else {
            Err(TransferError::SizeMismatch {
                path: remote_path.to_string(),
                expected,
                actual: written,
            })
        }
    });
    if res.is_err() {
        if let Err(e) = fs::remove_file(local) {
            warn!(local = %local.display(), error = %e, "cannot remove partial file");
        }
    }
    res
}

fn write_body(
    body: &mut dyn Read,
    file: File,
    progress: &Arc<TransferProgress>,
) -> Result<u64, TransferError> {
    let mut writer = ProgressWriter::new(BufWriter::new(file), Arc::clone(progress));
    let written = io::copy(body, &mut writer)?;
    writer.flush()?;
    Ok(written)
}
