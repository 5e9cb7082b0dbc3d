use std::time::Duration;

pub const API_URL: &str = "https://api.dropboxapi.com/2";
pub const CONTENT_URL: &str = "https://content.dropboxapi.com/2";
pub const CONFIG_ENV: &str = "DROPCTL_CONFIG";
pub const CONFIG_DIR: &str = "dropctl";
pub const CONFIG_FILE: &str = "config.yaml";

pub const MIB: u64 = 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * MIB; // 8 MiB
pub const DEFAULT_CONNECTIONS: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const MAX_BACKOFF_SECS: u64 = 60;

/// Files below this size are never split into segments.
pub const FAST_MIN_SIZE: u64 = MIB;
/// Block size used by the Dropbox content hash.
pub const HASH_BLOCK_SIZE: usize = 4 * 1024 * 1024;

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ape", "wav", "wv", "mpc", "ogg", "m4a"];
pub const SKIPPED_UPLOADS: &[&str] = &["thumbs.db"];
