//! pagevault Admin Binary
//!
//! Maintenance commands over a single pagevault file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pagevault::{Config, StorageProvider};
use tracing_subscriber::{fmt, EnvFilter};

/// pagevault admin tool
#[derive(Parser, Debug)]
#[command(name = "pagevault-admin")]
#[command(about = "Inspect and maintain a pagevault storage file")]
#[command(version)]
struct Args {
    /// Storage file
    #[arg(short, long, global = true, default_value = "./pagevault.db")]
    path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print header and usage statistics
    Info,

    /// Read every block back and check the allocator
    Verify,

    /// Flush the registry and allocator, then reset the WAL
    Checkpoint,

    /// Free pages nothing references
    Reclaim,

    /// Print a block to stdout
    Get {
        /// Block name
        name: String,
    },

    /// Store a block from an argument or a file
    Put {
        /// Block name
        name: String,

        /// Block contents
        #[arg(conflicts_with = "file")]
        value: Option<String>,

        /// Read the contents from this file instead
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Remove a block
    Free {
        /// Block name
        name: String,
    },

    /// List block names
    List,
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pagevault=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!("pagevault-admin v{}", pagevault::VERSION);

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> pagevault::Result<ExitCode> {
    let create = matches!(args.command, Commands::Put { .. });
    let config = Config::builder()
        .path(&args.path)
        .create_if_missing(create)
        .build();
    let provider = StorageProvider::open(config)?;

    let code = match args.command {
        Commands::Info => {
            let header = provider.header();
            let stats = provider.stats()?;
            println!("path:              {}", provider.path().display());
            println!("format version:    {}", header.format_version);
            println!("page size:         {}", stats.page_size);
            println!("feature flags:     {:#05b}", header.feature_flags);
            println!("inline threshold:  {} bytes", header.overflow_threshold_bytes);
            println!("compression:       {}", header.compression_algorithm);
            println!("blocks:            {}", stats.block_count);
            println!("total pages:       {}", stats.total_pages);
            println!("free pages:        {}", stats.free_pages);
            println!("file bytes:        {}", stats.file_bytes);
            println!("wal capacity:      {} bytes", stats.wal_capacity_bytes);
            println!("checkpoint lsn:    {}", stats.checkpoint_lsn);
            println!("checkpoints:       {}", stats.checkpoint_count);
            ExitCode::SUCCESS
        }
        Commands::Verify => {
            let report = provider.verify()?;
            println!("blocks checked:    {}", report.blocks_checked);
            println!("overlapping:       {}", report.overlapping_blocks);
            println!("unallocated:       {}", report.unallocated_blocks);
            println!("fsm consistent:    {}", report.fsm_consistent);
            for (name, error) in &report.corrupt_blocks {
                println!("corrupt:           {}: {}", name, error);
            }
            if report.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Checkpoint => {
            provider.checkpoint()?;
            println!("OK");
            ExitCode::SUCCESS
        }
        Commands::Reclaim => {
            let report = provider.reclaim_orphans()?;
            println!("referenced pages:  {}", report.referenced_pages);
            println!("freed pages:       {}", report.freed_pages);
            println!("restored pages:    {}", report.restored_pages);
            println!("unreadable blocks: {}", report.unreadable_blocks);
            ExitCode::SUCCESS
        }
        Commands::Get { name } => match provider.read_block(&name)? {
            Some(bytes) => {
                println!("{}", String::from_utf8_lossy(&bytes));
                ExitCode::SUCCESS
            }
            None => {
                println!("(nil)");
                ExitCode::FAILURE
            }
        },
        Commands::Put { name, value, file } => {
            let bytes = match (value, file) {
                (_, Some(file)) => std::fs::read(file)?,
                (Some(value), None) => value.into_bytes(),
                (None, None) => {
                    return Err(pagevault::VaultError::Config(
                        "put needs a value or --file".to_string(),
                    ))
                }
            };
            let entry = provider.write_block(&name, &bytes)?;
            println!("OK offset={} length={}", entry.offset, entry.length);
            ExitCode::SUCCESS
        }
        Commands::Free { name } => {
            if provider.free_block(&name)? {
                println!("OK");
                ExitCode::SUCCESS
            } else {
                println!("(nil)");
                ExitCode::FAILURE
            }
        }
        Commands::List => {
            for name in provider.block_names() {
                println!("{}", name);
            }
            ExitCode::SUCCESS
        }
    };

    provider.close()?;
    Ok(code)
}
