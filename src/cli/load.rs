//! Load subcommand for project-import CLI
//!
//! Loads selected projects from a dump file into the production database,
//! replacing local projects with the same name.

use crate::service::LoadRequest;
use clap::Args;
use std::path::PathBuf;

/// Arguments for the load subcommand
#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Path to the dump file (.sql or .dump)
    #[arg(value_name = "DUMP")]
    pub dump: PathBuf,

    /// Dump id of a project to load (repeatable)
    #[arg(short, long = "project", value_name = "ID", required = true)]
    pub projects: Vec<i64>,

    /// Local user that will own the loaded projects
    #[arg(short, long, value_name = "ID")]
    pub user: i64,

    /// Local project to replace, one per --project in the same order
    ///
    /// Without it, a project replaces the user's local project with the
    /// same name, if exactly one exists.
    #[arg(long = "local-id", value_name = "ID")]
    pub local_ids: Vec<i64>,

    /// Report what would be loaded without modifying the database
    #[arg(long)]
    pub dry_run: bool,

    /// Create global fields referenced by the loaded templates when missing locally
    #[arg(long)]
    pub include_global_fields: bool,
}

impl LoadArgs {
    /// Build the service request. `include_global_default` comes from config.
    pub fn to_request(&self, include_global_default: bool) -> LoadRequest {
        let mut request = LoadRequest::new(self.dump.clone(), self.projects.clone(), self.user)
            .with_dry_run(self.dry_run)
            .with_global_fields(self.include_global_fields || include_global_default);
        if !self.local_ids.is_empty() {
            request = request.with_local_ids(self.local_ids.clone());
        }
        request
    }

    /// Describe the load mode for logging
    pub fn load_mode(&self) -> &'static str {
        if self.dry_run { "dry-run" } else { "load" }
    }
}
