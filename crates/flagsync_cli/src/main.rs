//! flagsync CLI
//!
//! Command-line tools for inspecting flagsync streaming traffic.
//!
//! # Commands
//!
//! - `decode-token` - Display the channels and lifetime of an access token
//! - `replay` - Feed a captured event stream through the parser

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// flagsync streaming tools.
#[derive(Parser)]
#[command(name = "flagsync")]
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
    /// Display the channels and lifetime of an access token
    DecodeToken {
        /// The raw JWT
        token: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Feed a captured event stream through the parser
    Replay {
        /// Capture file, one stream line per line
        file: PathBuf,

        /// Only print the summary
        #[arg(short, long)]
        summary: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
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
        Commands::DecodeToken { token, format } => {
            commands::decode_token::run(&token, &format)?;
        }
        Commands::Replay {
            file,
            summary,
            format,
        } => {
            commands::replay::run(&file, summary, &format)?;
        }
        Commands::Version => {
            println!("flagsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Streaming protocol v{}",
                flagsync_protocol::STREAMING_PROTOCOL_VERSION
            );
        }
    }

    Ok(())
}
