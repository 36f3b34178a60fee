//! CLI command definitions for project-import
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

pub mod list;
pub mod load;
pub mod user;

use clap::{Parser, Subcommand};
use list::ListArgs;
use load::LoadArgs;
use user::AddUserArgs;

/// Selective project import from SQL dumps
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Directory for staging schema files (overrides config)
    #[arg(long, global = true)]
    pub staging_dir: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text", global = true)]
    pub format: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the projects contained in a dump file
    List(ListArgs),

    /// Load selected projects from a dump file
    Load(LoadArgs),

    /// Remove staging schemas left behind by crashed runs
    Cleanup,

    /// Create a local user to own imported projects
    AddUser(AddUserArgs),
}
