use serde_json::{json, Value};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::chunks::ChunkReader;
use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES};
use crate::error::TransferError;
use crate::models::{Cursor, FileMetadata};
use crate::progress::{CancelFlag, ProgressReader, TransferProgress};
use crate::transport::Body;
use crate::utils::{backoff_delay, content_hash, join_remote};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Started,
    Appending,
    Finished,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct UploadOptions {
    pub chunk_size: u64,
    /// Retries per append/finish after a transient failure. Start is never retried.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Compare the server's content hash with the local file.
    pub verify_hash: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_secs(1),
            verify_hash: true,
        }
    }
}

pub struct UploadSession<'a> {
    client: &'a ApiClient,
    reader: ChunkReader,
    cursor: Option<Cursor>,
    state: SessionState,
    progress: Arc<TransferProgress>,
    cancel: CancelFlag,
}

impl<'a> UploadSession<'a> {
    pub fn new(
        client: &'a ApiClient,
        reader: ChunkReader,
        progress: Arc<TransferProgress>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            client,
            reader,
            cursor: None,
            state: SessionState::NotStarted,
            progress,
            cancel,
        }
    }

    /// Rebuilds a session in `Appending` state from a previously returned cursor.
    pub fn resume(
        client: &'a ApiClient,
        reader: ChunkReader,
        cursor: Cursor,
        progress: Arc<TransferProgress>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            client,
            reader,
            cursor: Some(cursor),
            state: SessionState::Appending,
            progress,
            cancel,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Continues a session from a cursor returned by a failed append or finish.
    pub fn resume_from(&mut self, cursor: Cursor) -> Result<(), TransferError> {
        match self.state {
            SessionState::Failed | SessionState::NotStarted => {
                debug!(session = %cursor.session_id, offset = cursor.offset, "resuming upload session");
                self.cursor = Some(cursor);
                self.state = SessionState::Appending;
                Ok(())
            }
            other => Err(TransferError::InvalidState(format!(
                "cannot resume a session that is {:?}",
                other
            ))),
        }
    }

    /// Sends the first chunk and opens the session.
    pub fn start(&mut self) -> Result<Cursor, TransferError> {
        if self.state != SessionState::NotStarted {
            return Err(TransferError::InvalidState(format!(
                "start called on a session that is {:?}",
                self.state
            )));
        }
        self.check_cancel()?;
        let chunk = self.read(0)?;
        let sent = chunk.len() as u64;
        let res: Result<Cursor, TransferError> = self.client.upload(
            "files/upload_session/start",
            &json!({ "close": false }),
            Body::Bytes(chunk),
        );
        match res {
            Ok(server) => {
                let cursor = Cursor {
                    session_id: server.session_id,
                    offset: server.offset + sent,
                };
                info!(session = %cursor.session_id, offset = cursor.offset, "upload session started");
                self.progress.add(sent);
                self.cursor = Some(cursor.clone());
                self.state = SessionState::Started;
                Ok(cursor)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Sends the chunk at the cursor and advances it by the bytes the server accepted.
    pub fn append(&mut self) -> Result<Cursor, TransferError> {
        let cursor = self.open_cursor("append")?;
        self.check_cancel()?;
        let chunk = self.read(cursor.offset)?;
        if chunk.is_empty() {
            self.state = SessionState::Failed;
            return Err(self.interrupted(
                &cursor,
                TransferError::Io(std::io::ErrorKind::UnexpectedEof.into()),
            ));
        }
        let sent = chunk.len() as u64;
        debug!(session = %cursor.session_id, offset = cursor.offset, len = sent, "appending chunk");
        let res: Result<Value, TransferError> = self.client.upload(
            "files/upload_session/append_v2",
            &json!({ "cursor": cursor, "close": false }),
            Body::Bytes(chunk),
        );
        match res {
            Ok(_) => {
                let next = Cursor {
                    session_id: cursor.session_id,
                    offset: cursor.offset + sent,
                };
                self.progress.add(sent);
                self.cursor = Some(next.clone());
                self.state = SessionState::Appending;
                Ok(next)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(self.interrupted(&cursor, e))
            }
        }
    }

    /// Sends the final chunk and commits the file at `remote_path`.
    pub fn finish(&mut self, remote_path: &str) -> Result<FileMetadata, TransferError> {
        let cursor = self.open_cursor("finish")?;
        self.check_cancel()?;
        let chunk = self.read(cursor.offset)?;
        let sent = chunk.len() as u64;
        if cursor.offset + sent != self.reader.size() {
            return Err(TransferError::InvalidState(format!(
                "finish at offset {} would leave {} bytes unsent",
                cursor.offset,
                self.reader.size().saturating_sub(cursor.offset + sent)
            )));
        }
        let arg = json!({
            "cursor": cursor,
            "commit": {
                "path": remote_path,
                "mode": "add",
                "autorename": true,
                "mute": false,
            },
        });
        let res: Result<FileMetadata, TransferError> =
            self.client
                .upload("files/upload_session/finish", &arg, Body::Bytes(chunk));
        match res {
            Ok(meta) => {
                info!(session = %cursor.session_id, path = %meta.path_display, "upload session finished");
                self.progress.add(sent);
                self.cursor = Some(Cursor {
                    session_id: cursor.session_id,
                    offset: cursor.offset + sent,
                });
                self.state = SessionState::Finished;
                Ok(meta)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(self.interrupted(&cursor, e))
            }
        }
    }

    fn open_cursor(&self, op: &str) -> Result<Cursor, TransferError> {
        match (self.state, &self.cursor) {
            (SessionState::Started | SessionState::Appending, Some(c)) => Ok(c.clone()),
            (state, _) => Err(TransferError::InvalidState(format!(
                "{} called on a session that is {:?}",
                op, state
            ))),
        }
    }

    fn check_cancel(&mut self) -> Result<(), TransferError> {
        if let Err(e) = self.cancel.check() {
            self.state = SessionState::Cancelled;
            return Err(e);
        }
        Ok(())
    }

    fn read(&mut self, offset: u64) -> Result<Vec<u8>, TransferError> {
        self.reader.read_at(offset).inspect_err(|_| {
            self.state = SessionState::Failed;
        })
    }

    /// The server's offset wins: a mismatch is reported, never papered over.
    fn interrupted(&self, cursor: &Cursor, err: TransferError) -> TransferError {
        if let Some(server) = server_offset(&err) {
            warn!(local = cursor.offset, server, "server rejected upload offset");
            return TransferError::OffsetMismatch {
                local: cursor.offset,
                server,
            };
        }
        TransferError::SessionInterrupted {
            cursor: cursor.clone(),
            source: Box::new(err),
        }
    }
}

/// `correct_offset` from an `incorrect_offset` error body, wherever it is nested.
fn server_offset(err: &TransferError) -> Option<u64> {
    fn find(v: &Value) -> Option<u64> {
        match v {
            Value::Object(map) => map
                .get("correct_offset")
                .and_then(Value::as_u64)
                .or_else(|| map.values().find_map(find)),
            _ => None,
        }
    }
    match err {
        TransferError::Protocol {
            status: 409, body, ..
        } => serde_json::from_str::<Value>(body).ok().as_ref().and_then(find),
        _ => None,
    }
}

/// Uploads `local_path` into `remote_parent`, through a session when the file
/// is larger than one chunk and with a single request otherwise.
pub fn upload_large(
    client: &ApiClient,
    local_path: &Path,
    remote_parent: &str,
    options: &UploadOptions,
    progress: Arc<TransferProgress>,
    cancel: &CancelFlag,
) -> Result<FileMetadata, TransferError> {
    let result = upload_inner(client, local_path, remote_parent, options, &progress, cancel);
    match &result {
        Ok(_) => progress.complete(),
        Err(TransferError::Cancelled) => progress.cancel(),
        Err(_) => progress.fail(),
    }
    result
}

fn upload_inner(
    client: &ApiClient,
    local_path: &Path,
    remote_parent: &str,
    options: &UploadOptions,
    progress: &Arc<TransferProgress>,
    cancel: &CancelFlag,
) -> Result<FileMetadata, TransferError> {
    let name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", local_path.display()),
            ))
        })?;
    let remote_path = join_remote(remote_parent, &name);
    let reader = ChunkReader::open(local_path, options.chunk_size)?;
    let size = reader.size();
    let chunk = reader.chunk_size();
    cancel.check()?;

    let meta = if size <= chunk {
        info!(path = %remote_path, size, "single-shot upload");
        upload_single(client, local_path, &remote_path, Arc::clone(progress))?
    } else {
        info!(path = %remote_path, size, chunk, "chunked upload");
        let mut session = UploadSession::new(client, reader, Arc::clone(progress), cancel.clone());
        let mut cursor = session.start()?;
        let mut position = chunk;
        loop {
            if cursor.offset != position {
                return Err(TransferError::OffsetMismatch {
                    local: position,
                    server: cursor.offset,
                });
            }
            if size - position <= chunk {
                break with_retries(&mut session, options, |s| s.finish(&remote_path))?;
            }
            cursor = with_retries(&mut session, options, |s| s.append())?;
            position += chunk;
        }
    };

    if options.verify_hash {
        verify_hash(local_path, &meta)?;
    }
    Ok(meta)
}

fn with_retries<'a, T>(
    session: &mut UploadSession<'a>,
    options: &UploadOptions,
    mut op: impl FnMut(&mut UploadSession<'a>) -> Result<T, TransferError>,
) -> Result<T, TransferError> {
    let mut attempt = 0;
    loop {
        match op(session) {
            Err(TransferError::SessionInterrupted { cursor, source })
                if attempt < options.max_retries && source.is_retryable() =>
            {
                let delay = backoff_delay(options.retry_backoff, attempt);
                warn!(
                    offset = cursor.offset,
                    attempt = attempt + 1,
                    error = %source,
                    "upload chunk failed, retrying in {:?}",
                    delay
                );
                thread::sleep(delay);
                attempt += 1;
                session.resume_from(cursor)?;
            }
            other => return other,
        }
    }
}

/// Streams the whole file in one `files/upload` request.
pub fn upload_single(
    client: &ApiClient,
    local_path: &Path,
    remote_path: &str,
    progress: Arc<TransferProgress>,
) -> Result<FileMetadata, TransferError> {
    let file = File::open(local_path)?;
    let len = file.metadata()?.len();
    progress.start();
    let reader = ProgressReader::new(file, progress);
    client.upload(
        "files/upload",
        &json!({
            "path": remote_path,
            "mode": "add",
            "autorename": true,
            "mute": false,
        }),
        Body::Stream {
            reader: Box::new(reader),
            len,
        },
    )
}

fn verify_hash(local_path: &Path, meta: &FileMetadata) -> Result<(), TransferError> {
    let Some(remote) = &meta.content_hash else {
        return Ok(());
    };
    let local = content_hash(local_path)?;
    if &local != remote {
        return Err(TransferError::HashMismatch {
            path: meta.path_display.clone(),
            local,
            remote: remote.clone(),
        });
    }
    Ok(())
}
