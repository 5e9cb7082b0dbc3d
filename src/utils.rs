use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::constants::{AUDIO_EXTENSIONS, HASH_BLOCK_SIZE, MAX_BACKOFF_SECS};
use crate::error::TransferError;

/// Runs an external program to completion with inherited stdio.
pub fn run(program: &str, args: &[String]) -> Result<(), TransferError> {
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|e| TransferError::Command(format!("{}: {}", program, e)))?;
    if status.success() {
        Ok(())
    } else {
        Err(TransferError::Command(format!("{} exited with {}", program, status)))
    }
}

/// Starts an external program without waiting for it.
pub fn spawn_detached(program: &str, args: &[String]) -> Result<(), TransferError> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| TransferError::Command(format!("{}: {}", program, e)))?;
    Ok(())
}

/// Dropbox content hash: SHA-256 over the SHA-256 digests of each 4 MiB block.
pub fn content_hash(path: &Path) -> Result<String, TransferError> {
    Ok(content_hash_reader(File::open(path)?)?)
}

pub fn content_hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut overall = Sha256::new();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let mut filled = 0;
        while filled < buffer.len() {
            let n = reader.read(&mut buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        overall.update(Sha256::digest(&buffer[..filled]));
        if filled < buffer.len() {
            break;
        }
    }
    Ok(format!("{:x}", overall.finalize()))
}

pub fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{} B", bytes)
    } else if b < MB {
        format!("{:.2} KB", b / KB)
    } else if b < GB {
        format!("{:.2} MB", b / MB)
    } else if b < TB {
        format!("{:.2} GB", b / GB)
    } else {
        format!("{:.2} TB", b / TB)
    }
}

/// Remote paths always start with `/`; the root is the empty string.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

pub fn join_remote(parent: &str, name: &str) -> String {
    normalize_path(&format!("{}/{}", normalize_path(parent), name))
}

/// Serialises a `Dropbox-API-Arg` header value, escaping anything an HTTP
/// header cannot carry.
pub fn api_arg<T: serde::Serialize>(value: &T) -> Result<String, TransferError> {
    let json = serde_json::to_string(value).map_err(|e| TransferError::Decode {
        endpoint: "Dropbox-API-Arg".into(),
        source: e,
    })?;
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() && c != '\x7f' {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(out)
}

pub fn is_audio(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Doubling backoff for retry `attempt` (0-based), capped at a minute.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
        .min(Duration::from_secs(MAX_BACKOFF_SECS))
}
