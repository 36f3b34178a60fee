//! User bootstrap subcommand for project-import CLI

use clap::Args;

/// Arguments for the add-user subcommand
#[derive(Args, Debug)]
pub struct AddUserArgs {
    /// Unique user name
    #[arg(value_name = "NAME")]
    pub name: String,
}
