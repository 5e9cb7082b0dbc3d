use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::constants::PROGRESS_INTERVAL;
use crate::error::TransferError;
use crate::models::TransferJob;
use crate::progress::{watch, CancelFlag, ProgressSnapshot, ProgressWriter, TransferProgress};

/// Splits `[0, size)` into at most `parts` contiguous inclusive ranges.
/// Leading ranges absorb the remainder.
pub fn segments(size: u64, parts: usize) -> Vec<(u64, u64)> {
    if size == 0 {
        return Vec::new();
    }
    let parts = (parts.max(1) as u64).min(size);
    let base = size / parts;
    let extra = size % parts;
    let mut out = Vec::with_capacity(parts as usize);
    let mut first = 0;
    for i in 0..parts {
        let len = base + u64::from(i < extra);
        out.push((first, first + len - 1));
        first += len;
    }
    out
}

pub struct SegmentedDownload<'a> {
    client: &'a ApiClient,
    connections: usize,
    interval: Duration,
    cancel: CancelFlag,
}

impl<'a> SegmentedDownload<'a> {
    pub fn new(client: &'a ApiClient, connections: usize, cancel: CancelFlag) -> Self {
        Self {
            client,
            connections: connections.max(1),
            interval: PROGRESS_INTERVAL,
            cancel,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Fetches `job` and blocks until every segment has finished, feeding
    /// snapshots to `render` in the meantime.
    pub fn download<F>(
        &self,
        job: &TransferJob,
        progress: &Arc<TransferProgress>,
        render: F,
    ) -> Result<ProgressSnapshot, TransferError>
    where
        F: FnMut(&ProgressSnapshot),
    {
        File::create(&job.local_path)?.set_len(job.size)?;
        let ranges = segments(job.size, self.connections);
        info!(
            path = %job.remote_path,
            size = job.size,
            segments = ranges.len(),
            "segmented download"
        );
        progress.start();

        thread::scope(|s| {
            let coordinator = s.spawn(move || {
                let workers: Vec<_> = ranges
                    .iter()
                    .map(|&(first, last)| {
                        s.spawn(move || {
                            let res = self.fetch_range(job, first, last, progress);
                            match &res {
                                Err(TransferError::Cancelled) => progress.cancel(),
                                Err(e) => {
                                    warn!(first, last, error = %e, "segment failed");
                                    progress.fail();
                                }
                                Ok(()) => {}
                            }
                            res
                        })
                    })
                    .collect();
                let mut first_err = None;
                for worker in workers {
                    let res = worker.join().unwrap_or_else(|_| {
                        Err(TransferError::Transport("segment worker panicked".into()))
                    });
                    if let Err(e) = res {
                        first_err.get_or_insert(e);
                    }
                }
                match &first_err {
                    None => progress.complete(),
                    Some(TransferError::Cancelled) => progress.cancel(),
                    Some(_) => progress.fail(),
                }
                first_err
            });

            let last = watch(progress, self.interval, render);
            match coordinator.join() {
                Ok(None) => Ok(last),
                Ok(Some(e)) => Err(e),
                Err(_) => Err(TransferError::Transport(
                    "segment coordinator panicked".into(),
                )),
            }
        })
    }

    fn fetch_range(
        &self,
        job: &TransferJob,
        first: u64,
        last: u64,
        progress: &Arc<TransferProgress>,
    ) -> Result<(), TransferError> {
        self.cancel.check()?;
        let expected = last - first + 1;
        let resp = self.client.download(&job.remote_path, Some((first, last)))?;
        let whole = first == 0 && expected == job.size;
        if resp.status != 206 && !(resp.status == 200 && whole) {
            return Err(TransferError::Protocol {
                endpoint: "files/download".into(),
                status: resp.status,
                body: format!("range {}-{} not honoured", first, last),
            });
        }

        let mut file = OpenOptions::new().write(true).open(&job.local_path)?;
        file.seek(SeekFrom::Start(first))?;
        let mut writer = ProgressWriter::new(BufWriter::new(file), Arc::clone(progress));
        let written = io::copy(&mut resp.into_reader().take(expected), &mut writer)?;
        writer.flush()?;
        debug!(first, last, written, "segment done");
        if written != expected {
            return Err(TransferError::SizeMismatch {
                path: format!("{} [{}-{}]", job.remote_path, first, last),
                expected,
                actual: written,
            });
        }
        Ok(())
    }
}
