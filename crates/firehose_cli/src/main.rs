//! Firehose CLI
//!
//! Command-line tools for watching and debugging a relay's firehose.
//!
//! # Commands
//!
//! - `subscribe` - Stream events from a relay
//! - `decode` - Decode a captured binary frame
//! - `cid` - Inspect a content identifier

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::subscribe::SubscribeArgs;

/// Repository firehose tools.
#[derive(Parser)]
#[command(name = "firehose")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream events from a relay
    Subscribe {
        /// Relay endpoint
        #[arg(short, long, default_value = firehose_client::DEFAULT_SERVICE_URL)]
        service: String,

        /// Resume from this sequence number
        #[arg(long)]
        cursor: Option<i64>,

        /// Only deliver operations in this collection (repeatable)
        #[arg(short, long = "collection")]
        collections: Vec<String>,

        /// Skip #commit messages
        #[arg(long)]
        exclude_commit: bool,

        /// Skip #identity messages
        #[arg(long)]
        exclude_identity: bool,

        /// Skip #account messages
        #[arg(long)]
        exclude_account: bool,

        /// Stop after this many events
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Decode a captured binary frame
    Decode {
        /// File holding one binary message
        file: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Inspect a content identifier
    Cid {
        /// CID text form, e.g. bafyrei...
        text: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so event output stays pipeable.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Subscribe {
            service,
            cursor,
            collections,
            exclude_commit,
            exclude_identity,
            exclude_account,
            limit,
            format,
        } => {
            let args = SubscribeArgs {
                service,
                cursor,
                collections,
                exclude_commit,
                exclude_identity,
                exclude_account,
                limit,
                format,
            };
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(commands::subscribe::run(args))?;
        }
        Commands::Decode { file, format } => {
            commands::decode::run(&file, &format)?;
        }
        Commands::Cid { text } => {
            commands::cid::run(&text)?;
        }
        Commands::Version => {
            println!("firehose CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
