//! CLI entry point for Threadline.

pub mod threads;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Threadline CLI
#[derive(Parser, Debug)]
#[command(name = "threadline", version, about = "Threadline: inspect stored agent threads")]
pub struct Cli {
    /// TOML config file; environment variables still override it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stored thread management
    Threads(ThreadsArgs),
}

/// Arguments for the `threads` subcommand group.
#[derive(Parser, Debug)]
pub struct ThreadsArgs {
    #[command(subcommand)]
    pub command: ThreadCommands,
}

#[derive(Subcommand, Debug)]
pub enum ThreadCommands {
    /// List threads, most recently updated first
    List(ListArgs),
    /// Print a thread's metadata and messages
    Show(ShowArgs),
    /// Delete a thread's messages and metadata
    Delete(DeleteArgs),
}

/// Arguments for `threadline threads list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    #[arg(short, long, default_value_t = 20)]
    pub limit: usize,

    #[arg(short, long, default_value_t = 0)]
    pub offset: usize,
}

/// Arguments for `threadline threads show`.
#[derive(Parser, Debug)]
pub struct ShowArgs {
    pub thread_id: String,

    /// Emit raw JSON records instead of a transcript
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `threadline threads delete`.
#[derive(Parser, Debug)]
pub struct DeleteArgs {
    pub thread_id: String,
}
