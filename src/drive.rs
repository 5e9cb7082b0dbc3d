use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::api::ApiClient;
use crate::config::{AccountRegistry, Config};
use crate::constants::{FAST_MIN_SIZE, MIB, PROGRESS_INTERVAL, SKIPPED_UPLOADS};
use crate::download::{download_job, DownloadOptions};
use crate::error::TransferError;
use crate::models::{Entry, Strategy, TransferJob};
use crate::parallel::ParallelTransferEngine;
use crate::progress::{watch, CancelFlag, ProgressSnapshot, ProgressStatus, TransferProgress};
use crate::session::{upload_large, UploadOptions};
use crate::transport::Transport;
use crate::utils::{human_size, is_audio, join_remote, normalize_path, spawn_detached};

/// Everything a command needs: config, accounts and the shared transport.
pub struct Drive {
    config: Config,
    registry: AccountRegistry,
    transport: Arc<dyn Transport>,
    account: Option<String>,
    cancel: CancelFlag,
}

/// How `download` should fetch files.
#[derive(Clone, Debug)]
pub struct DownloadArgs {
    pub strategy: Strategy,
    pub connections: Option<usize>,
    /// Batch size for concurrent folder download; 0 walks the folder sequentially.
    pub parallel: usize,
    /// Folder levels to descend; 0 is unlimited.
    pub depth: usize,
}

#[derive(Debug, PartialEq)]
pub struct TreeLine {
    pub level: usize,
    pub entry: Entry,
}

/// Remote folders to create and files to send for a directory upload.
#[derive(Debug, Default, PartialEq)]
pub struct UploadPlan {
    pub folders: Vec<String>,
    /// Local file and the remote folder it goes into.
    pub files: Vec<(PathBuf, String)>,
}

impl Drive {
    /// `cancel` is shared with whoever stops transfers, e.g. a Ctrl-C handler.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        account: Option<String>,
        cancel: CancelFlag,
    ) -> Self {
        let registry = config.registry();
        Self {
            config,
            registry,
            transport,
            account,
            cancel,
        }
    }

    fn client(&self, name: &str) -> Result<ApiClient> {
        Ok(ApiClient::for_account(
            Arc::clone(&self.transport),
            &self.config,
            &self.registry,
            name,
        )?)
    }

    /// Client for the account a path names (or the selected one) and the
    /// path with any account prefix removed.
    pub fn resolve(&self, path: &str) -> Result<(ApiClient, String)> {
        let (name, path) = self.registry.resolve(self.account.as_deref(), path)?;
        Ok((self.client(&name)?, path))
    }

    fn upload_options(&self, chunk_mib: Option<u64>) -> UploadOptions {
        let chunk_size = match chunk_mib {
            Some(mib) => mib.max(1) * MIB,
            None => self.config.chunk_size(),
        };
        UploadOptions {
            chunk_size,
            max_retries: self.config.max_retries,
            ..UploadOptions::default()
        }
    }

    pub fn info(&self) -> Result<()> {
        let (client, _) = self.resolve("")?;
        let account = client.current_account()?;
        let usage = client.space_usage()?;
        println!("account: {} ({})", account.name.display_name, client.account());
        println!("email:   {}", account.email);
        if let Some(country) = account.country {
            println!("country: {}", country);
        }
        println!(
            "usage:   {} of {}",
            human_size(usage.used),
            human_size(usage.allocation.allocated)
        );
        Ok(())
    }

    pub fn meta(&self, path: &str) -> Result<()> {
        let (client, path) = self.resolve(path)?;
        let meta = client.get_metadata(&path)?;
        println!("{}", serde_json::to_string_pretty(&meta)?);
        Ok(())
    }

    /// Lists `path` under every configured account, tagging each entry with its owner.
    pub fn list_all_accounts(&self, path: &str) -> Result<Vec<Entry>> {
        let path = normalize_path(path);
        let mut all = Vec::new();
        for name in self.registry.names() {
            let client = self.client(name)?;
            match client.list_folder(&path) {
                Ok(entries) => all.extend(entries.into_iter().map(|mut e| {
                    e.owner = Some(name.to_string());
                    e
                })),
                Err(e) => warn!(account = name, error = %e, "listing failed"),
            }
        }
        all.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(all)
    }

    pub fn ls(&self, path: &str, all_accounts: bool) -> Result<()> {
        if all_accounts {
            for entry in self.list_all_accounts(path)? {
                let id = entry
                    .owner
                    .as_deref()
                    .and_then(|o| self.registry.id_of(o))
                    .unwrap_or("?");
                println!("[{}] {}", id, format_entry(&entry));
            }
            println!("{}", self.registry.legend());
            return Ok(());
        }
        let (client, path) = self.resolve(path)?;
        for entry in client.list_folder(&path)? {
            println!("{}", format_entry(&entry));
        }
        Ok(())
    }

    pub fn tree(&self, path: &str, depth: usize) -> Result<()> {
        let (client, path) = self.resolve(path)?;
        for line in walk_tree(&client, &path, depth)? {
            println!("{}{}", "  ".repeat(line.level), format_entry(&line.entry));
        }
        Ok(())
    }

    pub fn search(&self, path: &str, query: &str, all_accounts: bool) -> Result<()> {
        if all_accounts {
            let path = normalize_path(path);
            for name in self.registry.names() {
                let client = self.client(name)?;
                let id = self.registry.id_of(name).unwrap_or("?");
                for m in client.search(&path, query)? {
                    println!("[{}] {}", id, m.path_display);
                }
            }
            println!("{}", self.registry.legend());
            return Ok(());
        }
        let (client, path) = self.resolve(path)?;
        for m in client.search(&path, query)? {
            println!("{}", m.path_display);
        }
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let (client, path) = self.resolve(path)?;
        if ensure_folder(&client, &path)? {
            println!("created {}", path);
        } else {
            println!("{} already exists", path);
        }
        Ok(())
    }

    pub fn mv(&self, from: &str, to: &str) -> Result<()> {
        let (client, from) = self.resolve(from)?;
        let to = normalize_path(to);
        let meta = client.move_entry(&from, &to)?;
        println!("moved {} -> {}", from, meta.path_display);
        Ok(())
    }

    pub fn rm(&self, path: &str) -> Result<()> {
        let (client, path) = self.resolve(path)?;
        if path.is_empty() {
            bail!("refusing to delete the root folder");
        }
        let meta = client.delete(&path)?;
        println!("deleted {}", meta.path_display);
        Ok(())
    }

    /// One link for a file; `name link` for each file of a folder.
    pub fn link(&self, path: &str) -> Result<()> {
        let (client, path) = self.resolve(path)?;
        let meta = client.get_metadata(&path)?;
        if !meta.is_folder() {
            println!("{}", client.temporary_link(&path)?.link);
            return Ok(());
        }
        for (name, link) in file_links(&client, &path, |_| true)? {
            println!("{} {}", name, link);
        }
        Ok(())
    }

    /// Hands temporary links for `path` (a track, or every track in a folder)
    /// to the configured player.
    pub fn play(&self, path: &str) -> Result<()> {
        let (client, path) = self.resolve(path)?;
        let links: Vec<String> = if client.get_metadata(&path)?.is_folder() {
            file_links(&client, &path, is_audio)?
                .into_iter()
                .map(|(_, link)| link)
                .collect()
        } else {
            vec![client.temporary_link(&path)?.link]
        };
        if links.is_empty() {
            bail!("no audio files in {}", if path.is_empty() { "/" } else { path.as_str() });
        }
        info!(player = %self.config.player, tracks = links.len(), "starting player");
        let mut args = self.config.player_args.clone();
        args.extend(links);
        spawn_detached(&self.config.player, &args)?;
        Ok(())
    }

    pub fn upload(&self, local: &Path, remote_parent: &str, chunk_mib: Option<u64>) -> Result<()> {
        let (client, remote_parent) = self.resolve(remote_parent)?;
        let options = self.upload_options(chunk_mib);
        if local.is_dir() {
            let plan = upload_plan(local, &remote_parent)?;
            let (sent, failed) = self.upload_dir(&client, &plan, &options)?;
            println!("{} files uploaded, {} failed", sent, failed);
            if failed > 0 {
                bail!("{} uploads failed", failed);
            }
            return Ok(());
        }
        let meta = self.upload_file(&client, local, &remote_parent, &options)?;
        println!("uploaded {} ({})", meta, human_size(fs::metadata(local)?.len()));
        Ok(())
    }

    fn upload_file(
        &self,
        client: &ApiClient,
        local: &Path,
        remote_parent: &str,
        options: &UploadOptions,
    ) -> Result<String> {
        let size = fs::metadata(local)
            .with_context(|| format!("cannot stat {}", local.display()))?
            .len();
        let progress = Arc::new(TransferProgress::new(size));
        let label = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let meta = with_progress(&progress, &label, || {
            upload_large(
                client,
                local,
                remote_parent,
                options,
                Arc::clone(&progress),
                &self.cancel,
            )
        })
        .with_context(|| format!("upload of {} failed", local.display()))?;
        Ok(meta.path_display)
    }

    /// Creates the folder tree, then uploads each file. Returns (sent, failed).
    fn upload_dir(
        &self,
        client: &ApiClient,
        plan: &UploadPlan,
        options: &UploadOptions,
    ) -> Result<(usize, usize)> {
        for folder in &plan.folders {
            ensure_folder(client, folder)?;
        }
        let mut sent = 0;
        let mut failed = 0;
        for (local, remote_parent) in &plan.files {
            match self.upload_file(client, local, remote_parent, options) {
                Ok(path) => {
                    println!("uploaded {}", path);
                    sent += 1;
                }
                Err(e) => {
                    eprintln!("{:#}", e);
                    failed += 1;
                }
            }
        }
        Ok((sent, failed))
    }

    pub fn download(&self, remote: &str, local: &Path, args: &DownloadArgs) -> Result<()> {
        let (client, remote) = self.resolve(remote)?;
        let meta = client.get_metadata(&remote)?;
        let options = DownloadOptions {
            connections: args.connections.unwrap_or(self.config.connections),
            aria2c: self.config.aria2c.clone(),
        };

        if !meta.is_folder() {
            let target = if local.is_dir() {
                local.join(&meta.name)
            } else {
                local.to_path_buf()
            };
            let job = TransferJob {
                local_path: target,
                remote_path: meta.path_display.clone(),
                size: meta.size,
                strategy: args.strategy,
            };
            let n = self.run_job(&client, &job, &options)?;
            println!("downloaded {} ({})", job.local_path.display(), human_size(n));
            return Ok(());
        }

        let dest = if meta.name.is_empty() {
            local.to_path_buf()
        } else {
            local.join(&meta.name)
        };
        if args.parallel > 0 {
            return self.download_parallel(&client, &remote, &dest, args.parallel);
        }

        let jobs = plan_download(&client, &remote, &dest, args.depth, args.strategy)?;
        let mut failed = 0;
        for job in &jobs {
            match self.run_job(&client, job, &options) {
                Ok(n) => println!("downloaded {} ({})", job.local_path.display(), human_size(n)),
                Err(e) => {
                    eprintln!("{}: {:#}", job.remote_path, e);
                    failed += 1;
                }
            }
        }
        println!("{} files downloaded, {} failed", jobs.len() - failed, failed);
        if failed > 0 {
            bail!("{} downloads failed", failed);
        }
        Ok(())
    }

    fn run_job(&self, client: &ApiClient, job: &TransferJob, options: &DownloadOptions) -> Result<u64> {
        let progress = Arc::new(TransferProgress::new(job.size));
        let label = job
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let res = match job.strategy {
            // aria2c draws its own progress
            Strategy::Aria => download_job(client, job, options, &progress, &self.cancel, |_| {}),
            // segmented downloads render from the calling thread themselves
            Strategy::Fast if job.size >= FAST_MIN_SIZE => {
                let bar = new_bar(job.size, &label);
                download_job(client, job, options, &progress, &self.cancel, |s| render(&bar, s))
            }
            _ => with_progress(&progress, &label, || {
                download_job(client, job, options, &progress, &self.cancel, |_| {})
            }),
        };
        res.with_context(|| format!("download of {} failed", job.remote_path))
    }

    fn download_parallel(
        &self,
        client: &ApiClient,
        remote: &str,
        dest: &Path,
        batch: usize,
    ) -> Result<()> {
        let entries = client.list_folder(remote)?;
        let engine = ParallelTransferEngine::new(client.clone(), self.cancel.clone());
        let progress = engine.progress();
        let report = with_progress(&progress, "batch", || engine.run(&entries, dest, batch))?;

        for outcome in &report.outcomes {
            match &outcome.result {
                Ok(n) => println!("ok     {} ({})", outcome.local_path.display(), human_size(*n)),
                Err(e) => println!("failed {}: {}", outcome.remote_path, e),
            }
        }
        let rate = report
            .throughput()
            .map(|r| format!("{}/s", human_size(r as u64)))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} ok, {} failed, {} in {:.1}s ({}), batches {:?}",
            report.succeeded().count(),
            report.failed().count(),
            human_size(report.total_bytes),
            report.elapsed.as_secs_f64(),
            rate,
            report.batch_sizes
        );
        if report.failed().next().is_some() {
            bail!("{} downloads failed", report.failed().count());
        }
        Ok(())
    }
}

fn format_entry(entry: &Entry) -> String {
    if entry.is_folder() {
        format!("{}/", entry.name)
    } else {
        format!("{}  {}", entry.name, human_size(entry.size))
    }
}

/// Creates `path`; an existing folder is not an error. Returns whether it was new.
pub fn ensure_folder(client: &ApiClient, path: &str) -> Result<bool, TransferError> {
    match client.create_folder(path) {
        Ok(_) => Ok(true),
        Err(TransferError::Protocol { status: 409, .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Depth-first listing. `max_depth` 0 is unlimited; 1 lists only `path` itself.
pub fn walk_tree(
    client: &ApiClient,
    path: &str,
    max_depth: usize,
) -> Result<Vec<TreeLine>, TransferError> {
    fn walk(
        client: &ApiClient,
        path: &str,
        level: usize,
        max_depth: usize,
        out: &mut Vec<TreeLine>,
    ) -> Result<(), TransferError> {
        let mut entries = client.list_folder(path)?;
        entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        for entry in entries {
            let descend = entry.is_folder() && (max_depth == 0 || level + 1 < max_depth);
            let child = entry.remote_path().to_string();
            out.push(TreeLine { level, entry });
            if descend {
                walk(client, &child, level + 1, max_depth, out)?;
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(client, path, 0, max_depth, &mut out)?;
    Ok(out)
}

/// Jobs for every file under `remote`, mirrored below `local`.
pub fn plan_download(
    client: &ApiClient,
    remote: &str,
    local: &Path,
    max_depth: usize,
    strategy: Strategy,
) -> Result<Vec<TransferJob>, TransferError> {
    let mut jobs = Vec::new();
    let mut dirs = vec![local.to_path_buf()];
    for line in walk_tree(client, remote, max_depth)? {
        // walk_tree is depth-first, so the parent for this level is on the stack
        dirs.truncate(line.level + 1);
        let target = dirs[line.level].join(&line.entry.name);
        if line.entry.is_folder() {
            dirs.push(target);
        } else {
            jobs.push(TransferJob {
                local_path: target,
                remote_path: line.entry.remote_path().to_string(),
                size: line.entry.size,
                strategy,
            });
        }
    }
    Ok(jobs)
}

/// Mirrors the directory `local` (including its own name) under `remote_parent`.
pub fn upload_plan(local: &Path, remote_parent: &str) -> Result<UploadPlan> {
    let root_name = local
        .canonicalize()
        .with_context(|| format!("cannot open {}", local.display()))?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = join_remote(remote_parent, &root_name);
    let mut plan = UploadPlan::default();
    for entry in WalkDir::new(local).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(local)?;
        let rel: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let remote = join_remote(&base, &rel.join("/"));
        if entry.file_type().is_dir() {
            plan.folders.push(remote);
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if SKIPPED_UPLOADS.contains(&name.as_str()) {
            continue;
        }
        let parent = match remote.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        plan.files.push((entry.into_path(), parent));
    }
    Ok(plan)
}

/// Temporary links for the files of folder `path` whose names pass `keep`,
/// sorted by name.
pub fn file_links(
    client: &ApiClient,
    path: &str,
    keep: impl Fn(&str) -> bool,
) -> Result<Vec<(String, String)>, TransferError> {
    let mut files: Vec<Entry> = client
        .list_folder(path)?
        .into_iter()
        .filter(|e| !e.is_folder() && keep(&e.name))
        .collect();
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
        .into_iter()
        .map(|f| {
            let link = client.temporary_link(f.remote_path())?.link;
            Ok((f.name, link))
        })
        .collect()
}

fn new_bar(total: u64, label: &str) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    bar.set_message(label.to_string());
    bar
}

fn render(bar: &ProgressBar, snap: &ProgressSnapshot) {
    bar.set_length(snap.total_bytes);
    bar.set_position(snap.transferred_bytes);
    match snap.status {
        ProgressStatus::Completed => bar.finish(),
        ProgressStatus::Failed => bar.abandon_with_message("failed"),
        ProgressStatus::Cancelled => bar.abandon_with_message("cancelled"),
        _ => {}
    }
}

/// Fails the progress unless it already reached a terminal status.
struct EndOnDrop<'a>(&'a TransferProgress);

impl Drop for EndOnDrop<'_> {
    fn drop(&mut self) {
        self.0.fail();
    }
}

/// Runs `work` on a scoped thread while this thread draws `progress`.
fn with_progress<T, F>(progress: &TransferProgress, label: &str, work: F) -> Result<T, TransferError>
where
    T: Send,
    F: FnOnce() -> Result<T, TransferError> + Send,
{
    let bar = new_bar(progress.snapshot().total_bytes, label);
    thread::scope(|s| {
        let worker = s.spawn(|| {
            // ends the display loop below even if `work` panics
            let _guard = EndOnDrop(progress);
            let res = work();
            if res.is_ok() {
                progress.complete();
            }
            res
        });
        watch(progress, PROGRESS_INTERVAL, |snap| render(&bar, snap));
        worker
            .join()
            .unwrap_or_else(|_| Err(TransferError::Transport("worker thread panicked".into())))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Account;
    use crate::transport::mock::{self, MockTransport, RecordedRequest, API, CONTENT};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn config() -> Config {
        let mut accounts = BTreeMap::new();
        for (name, id) in [("alice", "0"), ("bob", "1")] {
            accounts.insert(
                name.to_string(),
                Account {
                    id: id.to_string(),
                    access_token: format!("tok-{name}"),
                },
            );
        }
        Config {
            current_account: Some("alice".into()),
            accounts,
            api_url: API.into(),
            content_url: CONTENT.into(),
            ..Config::default()
        }
    }

    fn drive(t: &Arc<MockTransport>) -> Drive {
        Drive::new(config(), t.clone(), None, CancelFlag::new())
    }

    fn file(path: &str, size: u64) -> Value {
        json!({ ".tag": "file", "name": path.rsplit('/').next().unwrap(), "path_display": path, "size": size })
    }

    fn dir(path: &str) -> Value {
        json!({ ".tag": "folder", "name": path.rsplit('/').next().unwrap(), "path_display": path })
    }

    /// /top: a.txt, sub/ (b.txt, deep/ (c.txt))
    fn tree_server(req: &RecordedRequest) -> Result<(u16, Vec<u8>), TransferError> {
        let entries = match req.json()["path"].as_str().unwrap() {
            "/top" => json!([file("/top/a.txt", 3), dir("/top/sub")]),
            "/top/sub" => json!([dir("/top/sub/deep"), file("/top/sub/b.txt", 4)]),
            "/top/sub/deep" => json!([file("/top/sub/deep/c.txt", 5)]),
            other => panic!("unexpected listing of {other}"),
        };
        mock::json(json!({ "entries": entries, "cursor": "", "has_more": false }))
    }

    #[test]
    fn path_prefix_selects_account() {
        let t = MockTransport::new(|_| unreachable!());
        let d = drive(&t);
        let (client, path) = d.resolve("bob/Music").unwrap();
        assert_eq!(client.account(), "bob");
        assert_eq!(path, "/Music");
        let (client, path) = d.resolve("1/").unwrap();
        assert_eq!(client.account(), "bob");
        assert_eq!(path, "");
        let (client, _) = d.resolve("/bob").unwrap();
        assert_eq!(client.account(), "alice");
    }

    #[test]
    fn listing_all_accounts_tags_owner() {
        let t = MockTransport::new(|req| {
            let entries = match req.header("Authorization").unwrap() {
                "Bearer tok-alice" => json!([file("/zed", 1), file("/Apple", 1)]),
                _ => json!([file("/mango", 2)]),
            };
            mock::json(json!({ "entries": entries, "cursor": "", "has_more": false }))
        });
        let all = drive(&t).list_all_accounts("/").unwrap();
        let tagged: Vec<_> = all
            .iter()
            .map(|e| (e.name.as_str(), e.owner.as_deref().unwrap()))
            .collect();
        assert_eq!(tagged, [("Apple", "alice"), ("mango", "bob"), ("zed", "alice")]);
    }

    #[test]
    fn tree_respects_depth() {
        let t = MockTransport::new(tree_server);
        let api = drive(&t).resolve("/top").unwrap().0;

        let names = |lines: Vec<TreeLine>| -> Vec<(usize, String)> {
            lines.into_iter().map(|l| (l.level, l.entry.name)).collect()
        };
        assert_eq!(
            names(walk_tree(&api, "/top", 1).unwrap()),
            [(0, "a.txt".to_string()), (0, "sub".to_string())]
        );
        assert_eq!(
            names(walk_tree(&api, "/top", 0).unwrap()),
            [
                (0, "a.txt".to_string()),
                (0, "sub".to_string()),
                (1, "b.txt".to_string()),
                (1, "deep".to_string()),
                (2, "c.txt".to_string()),
            ]
        );
    }

    #[test]
    fn download_plan_mirrors_folders() {
        let t = MockTransport::new(tree_server);
        let api = drive(&t).resolve("/top").unwrap().0;
        let local = Path::new("/dl/top");

        let jobs = plan_download(&api, "/top", local, 0, Strategy::Internal).unwrap();
        let got: Vec<_> = jobs
            .iter()
            .map(|j| (j.remote_path.as_str(), j.local_path.clone(), j.size))
            .collect();
        assert_eq!(
            got,
            [
                ("/top/a.txt", local.join("a.txt"), 3),
                ("/top/sub/b.txt", local.join("sub/b.txt"), 4),
                ("/top/sub/deep/c.txt", local.join("sub/deep/c.txt"), 5),
            ]
        );

        let shallow = plan_download(&api, "/top", local, 2, Strategy::Internal).unwrap();
        assert_eq!(shallow.len(), 2);
    }

    #[test]
    fn sequential_folder_download_continues_past_failures() {
        let t = MockTransport::new(|req| match req.endpoint() {
            "files/get_metadata" => mock::json(dir("/top")),
            "files/list_folder" => tree_server(req),
            "files/download" => match req.arg()["path"].as_str().unwrap() {
                "/top/sub/b.txt" => Ok((200, b"xx".to_vec())),
                p => {
                    let size = if p.ends_with("a.txt") { 3 } else { 5 };
                    Ok((200, vec![b'z'; size]))
                }
            },
            other => panic!("unexpected {other}"),
        });
        let out = TempDir::new().unwrap();
        let args = DownloadArgs {
            strategy: Strategy::Internal,
            connections: None,
            parallel: 0,
            depth: 0,
        };
        let err = drive(&t).download("/top", out.path(), &args).unwrap_err();
        assert!(err.to_string().contains("1 downloads failed"));
        assert_eq!(fs::read(out.path().join("top/a.txt")).unwrap(), b"zzz");
        assert_eq!(fs::read(out.path().join("top/sub/deep/c.txt")).unwrap(), b"zzzzz");
    }

    #[test]
    fn parallel_folder_download_lands_in_folder() {
        let t = MockTransport::new(|req| match req.endpoint() {
            "files/get_metadata" => mock::json(dir("/top")),
            "files/list_folder" => tree_server(req),
            "files/download" => Ok((200, b"abc".to_vec())),
            other => panic!("unexpected {other}"),
        });
        let out = TempDir::new().unwrap();
        let args = DownloadArgs {
            strategy: Strategy::Internal,
            connections: None,
            parallel: 4,
            depth: 0,
        };
        drive(&t).download("/top", out.path(), &args).unwrap();
        assert_eq!(fs::read(out.path().join("top/a.txt")).unwrap(), b"abc");
        assert!(!out.path().join("top/sub").exists());
    }

    #[test]
    fn upload_plan_skips_thumbnails() {
        let root = TempDir::new().unwrap();
        let photos = root.path().join("photos");
        fs::create_dir_all(photos.join("2020")).unwrap();
        fs::write(photos.join("a.jpg"), b"a").unwrap();
        fs::write(photos.join("Thumbs.db"), b"x").unwrap();
        fs::write(photos.join("2020/b.jpg"), b"b").unwrap();

        let plan = upload_plan(&photos, "/backup").unwrap();
        assert_eq!(plan.folders, ["/backup/photos", "/backup/photos/2020"]);
        let files: Vec<_> = plan
            .files
            .iter()
            .map(|(p, r)| (p.file_name().unwrap().to_string_lossy().into_owned(), r.as_str()))
            .collect();
        assert_eq!(
            files,
            [
                ("b.jpg".to_string(), "/backup/photos/2020"),
                ("a.jpg".to_string(), "/backup/photos"),
            ]
        );
    }

    #[test]
    fn directory_upload_tolerates_existing_folders() {
        let t = MockTransport::new(|req| match req.endpoint() {
            "files/create_folder_v2" => Ok((409, br#"{"error_summary": "path/conflict/folder/"}"#.to_vec())),
            "files/upload" => {
                let path = req.arg()["path"].as_str().unwrap().to_string();
                mock::json(json!({ ".tag": "file", "name": "x", "path_display": path, "size": req.body.len() }))
            }
            other => panic!("unexpected {other}"),
        });
        let root = TempDir::new().unwrap();
        let music = root.path().join("music");
        fs::create_dir_all(&music).unwrap();
        fs::write(music.join("one.mp3"), b"111").unwrap();
        fs::write(music.join("two.mp3"), b"2222").unwrap();

        drive(&t).upload(&music, "/", None).unwrap();

        let uploads: Vec<_> = t
            .requests()
            .into_iter()
            .filter(|r| r.endpoint() == "files/upload")
            .map(|r| r.arg()["path"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(uploads, ["/music/one.mp3", "/music/two.mp3"]);
    }

    #[test]
    fn removing_root_is_refused() {
        let t = MockTransport::new(|_| unreachable!());
        assert!(drive(&t).rm("/").is_err());
        assert!(t.requests().is_empty());
    }

    #[test]
    fn ensure_folder_reports_existing() {
        let t = MockTransport::new(|req| {
            if req.json()["path"] == "/new" {
                mock::json(json!({ "metadata": dir("/new") }))
            } else {
                Ok((409, b"{}".to_vec()))
            }
        });
        let api = drive(&t).resolve("").unwrap().0;
        assert!(ensure_folder(&api, "/new").unwrap());
        assert!(!ensure_folder(&api, "/old").unwrap());
    }

    fn album_server(req: &RecordedRequest) -> Result<(u16, Vec<u8>), TransferError> {
        match req.endpoint() {
            "files/get_metadata" => mock::json(dir("/album")),
            "files/list_folder" => mock::json(json!({
                "entries": [
                    file("/album/02.flac", 1),
                    dir("/album/scans"),
                    file("/album/cover.jpg", 1),
                    file("/album/01.mp3", 1)
                ],
                "cursor": "", "has_more": false
            })),
            "files/get_temporary_link" => {
                let path = req.json()["path"].as_str().unwrap().to_string();
                mock::json(json!({ "metadata": file(&path, 1), "link": format!("https://dl.test{path}") }))
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn audio_filter_keeps_tracks_in_name_order() {
        let t = MockTransport::new(album_server);
        let api = drive(&t).resolve("").unwrap().0;
        let links = file_links(&api, "/album", is_audio).unwrap();
        assert_eq!(
            links,
            [
                ("01.mp3".to_string(), "https://dl.test/album/01.mp3".to_string()),
                ("02.flac".to_string(), "https://dl.test/album/02.flac".to_string()),
            ]
        );
    }

    #[test]
    fn link_on_folder_lists_every_file() {
        let t = MockTransport::new(album_server);
        drive(&t).link("/album").unwrap();

        let endpoints = t.endpoints();
        assert_eq!(endpoints[0], "files/get_metadata");
        assert_eq!(endpoints[1], "files/list_folder");
        let linked: Vec<String> = t
            .requests()
            .iter()
            .filter(|r| r.endpoint() == "files/get_temporary_link")
            .map(|r| r.json()["path"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(linked, ["/album/01.mp3", "/album/02.flac", "/album/cover.jpg"]);
    }

    #[test]
    fn link_on_file_is_a_single_request() {
        let t = MockTransport::new(|req| match req.endpoint() {
            "files/get_metadata" => mock::json(file("/a.mp3", 1)),
            "files/get_temporary_link" => {
                mock::json(json!({ "metadata": file("/a.mp3", 1), "link": "https://dl.test/a.mp3" }))
            }
            other => panic!("unexpected {other}"),
        });
        drive(&t).link("/a.mp3").unwrap();
        assert_eq!(t.endpoints(), ["files/get_metadata", "files/get_temporary_link"]);
    }

    #[test]
    fn raised_cancel_flag_stops_uploads_before_any_request() {
        let t = MockTransport::new(|_| unreachable!());
        let cancel = CancelFlag::new();
        let d = Drive::new(config(), t.clone(), None, cancel.clone());
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("a.bin");
        fs::write(&local, b"data").unwrap();

        cancel.cancel();
        let err = d.upload(&local, "/", None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::Cancelled)
        ));
        assert!(t.requests().is_empty());
    }

    #[test]
    fn panicking_work_still_ends_the_display_loop() {
        let progress = TransferProgress::new(10);
        let res: Result<(), TransferError> =
            with_progress(&progress, "boom", || panic!("worker blew up"));
        assert!(matches!(res, Err(TransferError::Transport(_))));
        assert_eq!(progress.status(), ProgressStatus::Failed);
    }

    #[test]
    fn successful_work_completes_progress() {
        let progress = TransferProgress::new(0);
        let n = with_progress(&progress, "ok", || Ok(7)).unwrap();
        assert_eq!(n, 7);
        assert_eq!(progress.status(), ProgressStatus::Completed);
    }
}
