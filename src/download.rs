use serde_json::json;
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::constants::FAST_MIN_SIZE;
use crate::error::TransferError;
use crate::models::{Strategy, TransferJob};
use crate::parallel::fetch_to;
use crate::progress::{CancelFlag, ProgressSnapshot, TransferProgress};
use crate::segmented::SegmentedDownload;
use crate::utils::{api_arg, run};

#[derive(Clone, Debug)]
pub struct DownloadOptions {
    pub connections: usize,
    pub aria2c: String,
}

/// Fetches one file with the job's strategy and returns the bytes on disk.
///
/// Files under 1 MiB never use the segmented path.
pub fn download_job<F>(
    client: &ApiClient,
    job: &TransferJob,
    options: &DownloadOptions,
    progress: &Arc<TransferProgress>,
    cancel: &CancelFlag,
    render: F,
) -> Result<u64, TransferError>
where
    F: FnMut(&ProgressSnapshot),
{
    cancel.check()?;
    if let Some(parent) = job.local_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let strategy = match job.strategy {
        Strategy::Fast if job.size < FAST_MIN_SIZE => Strategy::Internal,
        other => other,
    };
    info!(path = %job.remote_path, size = job.size, ?strategy, "downloading");
    let res = match strategy {
        Strategy::Fast => {
            return SegmentedDownload::new(client, options.connections, cancel.clone())
                .download(job, progress, render)
                .map(|snap| snap.transferred_bytes);
        }
        Strategy::Aria => download_aria(client, job, options),
        Strategy::Internal => {
            fetch_to(client, &job.remote_path, &job.local_path, job.size, progress)
        }
    };
    match &res {
        Ok(_) => progress.complete(),
        Err(_) => progress.fail(),
    }
    res
}

/// Command line for handing `job` to aria2c.
pub fn aria_args(
    client: &ApiClient,
    job: &TransferJob,
    connections: usize,
) -> Result<Vec<String>, TransferError> {
    let dir = job
        .local_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| ".".to_string());
    let name = job
        .local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::Command(format!("{} has no file name", job.local_path.display())))?;
    Ok(vec![
        "--file-allocation=falloc".to_string(),
        format!("--max-connection-per-server={}", connections.max(1)),
        "--min-split-size=1M".to_string(),
        "--remote-time=true".to_string(),
        format!("--header=Authorization: {}", client.authorization()),
        format!(
            "--header=Dropbox-API-Arg: {}",
            api_arg(&json!({ "path": job.remote_path }))?
        ),
        "-d".to_string(),
        dir,
        "-o".to_string(),
        name,
        client.content_endpoint("files/download"),
    ])
}

fn download_aria(
    client: &ApiClient,
    job: &TransferJob,
    options: &DownloadOptions,
) -> Result<u64, TransferError> {
    let args = aria_args(client, job, options.connections)?;
    run(&options.aria2c, &args)?;
    let actual = fs::metadata(&job.local_path)?.len();
    if actual != job.size {
        warn!(path = %job.remote_path, expected = job.size, actual, "aria2c size mismatch");
        return Err(TransferError::SizeMismatch {
            path: job.remote_path.clone(),
            expected: job.size,
            actual,
        });
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::client;
    use crate::progress::ProgressStatus;
    use crate::transport::mock::MockTransport;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn job(local: PathBuf, size: u64, strategy: Strategy) -> TransferJob {
        TransferJob {
            local_path: local,
            remote_path: "/Music/a b.flac".into(),
            size,
            strategy,
        }
    }

    fn options() -> DownloadOptions {
        DownloadOptions {
            connections: 4,
            aria2c: "aria2c".into(),
        }
    }

    #[test]
    fn small_fast_jobs_use_one_request() {
        let t = MockTransport::new(|_| Ok((200, vec![1u8; 1000])));
        let api = client(t.clone());
        let dir = TempDir::new().unwrap();
        let job = job(dir.path().join("nested/a.flac"), 1000, Strategy::Fast);
        let progress = Arc::new(TransferProgress::new(1000));

        let n = download_job(&api, &job, &options(), &progress, &CancelFlag::new(), |_| {}).unwrap();

        assert_eq!(n, 1000);
        assert_eq!(t.requests().len(), 1);
        assert!(t.requests()[0].header("Range").is_none());
        assert_eq!(fs::read(&job.local_path).unwrap(), vec![1u8; 1000]);
        assert_eq!(progress.status(), ProgressStatus::Completed);
    }

    #[test]
    fn internal_size_mismatch_fails_progress() {
        let t = MockTransport::new(|_| Ok((200, vec![0u8; 10])));
        let api = client(t);
        let dir = TempDir::new().unwrap();
        let job = job(dir.path().join("a.flac"), 11, Strategy::Internal);
        let progress = Arc::new(TransferProgress::new(11));
        let err = download_job(&api, &job, &options(), &progress, &CancelFlag::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, TransferError::SizeMismatch { .. }));
        assert_eq!(progress.status(), ProgressStatus::Failed);
        assert!(!job.local_path.exists());
    }

    #[test]
    fn aria_command_line() {
        let t = MockTransport::new(|_| unreachable!());
        let api = client(t);
        let job = job(PathBuf::from("/tmp/dl/a b.flac"), 5, Strategy::Aria);
        let args = aria_args(&api, &job, 8).unwrap();
        assert_eq!(args[0], "--file-allocation=falloc");
        assert!(args.contains(&"--max-connection-per-server=8".to_string()));
        assert!(args.contains(&"--header=Authorization: Bearer tok".to_string()));
        assert!(args.contains(&r#"--header=Dropbox-API-Arg: {"path":"/Music/a b.flac"}"#.to_string()));
        let d = args.iter().position(|a| a == "-d").unwrap();
        assert_eq!(args[d + 1], "/tmp/dl");
        let o = args.iter().position(|a| a == "-o").unwrap();
        assert_eq!(args[o + 1], "a b.flac");
        assert_eq!(args.last().unwrap(), "http://content.test/2/files/download");
    }

    #[test]
    fn missing_aria_binary_is_a_command_error() {
        let t = MockTransport::new(|_| unreachable!());
        let api = client(t);
        let dir = TempDir::new().unwrap();
        let job = job(dir.path().join("a.flac"), 5, Strategy::Aria);
        let opts = DownloadOptions {
            connections: 2,
            aria2c: "/nonexistent/aria2c".into(),
        };
        let progress = Arc::new(TransferProgress::new(5));
        let err = download_job(&api, &job, &opts, &progress, &CancelFlag::new(), |_| {}).unwrap_err();
        assert!(matches!(err, TransferError::Command(_)));
    }
}
