//! List subcommand for project-import CLI
//!
//! Shows the projects contained in a dump file with their descendant
//! counts. Production data is never touched.

use clap::Args;
use std::path::PathBuf;

/// Arguments for the list subcommand
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Path to the dump file (.sql or .dump)
    #[arg(value_name = "DUMP")]
    pub dump: PathBuf,
}
