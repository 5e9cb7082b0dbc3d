use dropctl::config::Config;
use dropctl::drive::{DownloadArgs, Drive};
use dropctl::error::TransferError;
use dropctl::models::Strategy;
use dropctl::progress::CancelFlag;
use dropctl::transport::HttpTransport;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ──────────────────────────────────────────────────────────────
// CLI definition
// ──────────────────────────────────────────────────────────────
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Account to use (defaults to current_account from the config)
    #[arg(short, long, global = true)]
    account: Option<String>,

    /// Config file (defaults to $DROPCTL_CONFIG or ~/.config/dropctl/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show account details and space usage
    Info,

    /// Print the metadata of a file or folder as JSON
    Meta { path: String },

    /// List a folder
    Ls {
        #[arg(default_value = "")]
        path: String,
        /// List the same folder under every account
        #[arg(long)]
        all_accounts: bool,
    },

    /// Print a folder recursively
    Tree {
        #[arg(default_value = "")]
        path: String,
        /// Levels to descend, 0 for no limit
        #[arg(short, long, default_value_t = 0)]
        depth: usize,
    },

    /// Download a file or folder: <REMOTE> [LOCAL]
    Download {
        remote: String,
        #[arg(default_value = ".")]
        local: PathBuf,
        /// Hand files to aria2c
        #[arg(long, conflicts_with = "fast")]
        aria: bool,
        /// Fetch each file over several connections
        #[arg(short, long)]
        fast: bool,
        /// Connections for --fast and --aria
        #[arg(short, long)]
        conns: Option<usize>,
        /// Download a folder's files in batches of <N> concurrent workers
        #[arg(short = 'P', long, default_value_t = 0)]
        parallel: usize,
        /// Folder levels to descend, 0 for no limit
        #[arg(short, long, default_value_t = 1)]
        depth: usize,
    },

    /// Upload a file or directory: <LOCAL> [REMOTE_PARENT]
    Upload {
        local: PathBuf,
        #[arg(default_value = "")]
        remote: String,
        /// Upload session chunk size in MiB
        #[arg(long)]
        chunk_size: Option<u64>,
    },

    /// Create a folder
    Mkdir { path: String },

    /// Move or rename a file or folder
    Mv { from: String, to: String },

    /// Delete a file or folder
    Rm { path: String },

    /// Search file names below a folder
    Search {
        query: String,
        #[arg(default_value = "")]
        path: String,
        /// Search every account
        #[arg(long)]
        all_accounts: bool,
    },

    /// Print a temporary download link, or one per file of a folder
    Link { path: String },

    /// Stream a track, or every track in a folder, with the configured player
    Play { path: String },
}

// ──────────────────────────────────────────────────────────────
// Entry point
// ──────────────────────────────────────────────────────────────
fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Logs go to stderr so command output on stdout stays clean.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dropctl={}", level)));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity >= 2)
                .with_line_number(verbosity >= 3),
        )
        .try_init();
}

/// 2 for configuration problems, 1 for everything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<TransferError>() {
        Some(TransferError::Config(_)) | Some(TransferError::UnknownAccount(_)) => 2,
        _ => 1,
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let path = match cli.config {
        Some(p) => p,
        None => Config::default_path()?,
    };
    let config = Config::load(&path)?;
    let transport = Arc::new(HttpTransport::new(config.timeout())?);
    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || on_interrupt.cancel()) {
        warn!(error = %e, "Ctrl-C will not stop transfers cleanly");
    }
    let drive = Drive::new(config, transport, cli.account, cancel);

    match cli.command {
        Commands::Info => drive.info(),
        Commands::Meta { path } => drive.meta(&path),
        Commands::Ls { path, all_accounts } => drive.ls(&path, all_accounts),
        Commands::Tree { path, depth } => drive.tree(&path, depth),
        Commands::Download {
            remote,
            local,
            aria,
            fast,
            conns,
            parallel,
            depth,
        } => {
            let strategy = if aria {
                Strategy::Aria
            } else if fast {
                Strategy::Fast
            } else {
                Strategy::Internal
            };
            let args = DownloadArgs {
                strategy,
                connections: conns,
                parallel,
                depth,
            };
            drive.download(&remote, &local, &args)
        }
        Commands::Upload {
            local,
            remote,
            chunk_size,
        } => drive.upload(&local, &remote, chunk_size),
        Commands::Mkdir { path } => drive.mkdir(&path),
        Commands::Mv { from, to } => drive.mv(&from, &to),
        Commands::Rm { path } => drive.rm(&path),
        Commands::Search {
            query,
            path,
            all_accounts,
        } => drive.search(&path, &query, all_accounts),
        Commands::Link { path } => drive.link(&path),
        Commands::Play { path } => drive.play(&path),
    }
}
