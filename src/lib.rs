pub mod api;
pub mod chunks;
pub mod config;
pub mod constants;
pub mod download;
pub mod drive;
pub mod error;
pub mod models;
pub mod parallel;
pub mod progress;
pub mod segmented;
pub mod session;
pub mod transport;
pub mod utils;
