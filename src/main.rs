//! project-import
//!
//! Command-line front end for listing and loading projects from SQL dumps.

use anyhow::{Result, bail};
use clap::Parser;
use project_import::cli::list::ListArgs;
use project_import::cli::load::LoadArgs;
use project_import::cli::user::AddUserArgs;
use project_import::cli::{Cli, Command};
use project_import::config::{Config, ConfigLoader};
use project_import::db::Database;
use project_import::format::{self, OutputFormat};
use project_import::logging;
use project_import::service::ProjectLoadService;
use tracing::{debug, info};

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log, cli.verbose)?;

    // SAFETY: set at startup before any other threads are spawned
    if let Some(config_path) = &cli.config {
        unsafe {
            std::env::set_var("PROJECT_IMPORT_CONFIG_PATH", config_path);
        }
    }
    let mut loader = ConfigLoader::load()?;
    if let Some(path) = loader.config_path() {
        debug!(path = %path.display(), "Using config file");
    }

    let config = loader.config_mut();
    if let Some(db_path) = &cli.database {
        config.database.path = db_path.into();
    }
    if let Some(staging_dir) = &cli.staging_dir {
        config.staging.dir = staging_dir.into();
    }
    let config = loader.into_config();

    let Some(output) = OutputFormat::from_str(&cli.format) else {
        bail!("unknown output format '{}' (expected text or json)", cli.format);
    };

    match cli.command {
        Command::List(args) => run_list(&config, args, output)?,
        Command::Load(args) => run_load(&config, args, output)?,
        Command::Cleanup => run_cleanup(&config, output)?,
        Command::AddUser(args) => run_add_user(&config, args, output)?,
    }

    Ok(())
}

fn open_service(config: &Config) -> Result<ProjectLoadService> {
    config.ensure_db_dir()?;
    let db = Database::open(&config.database.path)?;
    Ok(ProjectLoadService::from_config(db, &config.staging))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run the list command
fn run_list(config: &Config, args: ListArgs, output: OutputFormat) -> Result<()> {
    let service = open_service(config)?;
    let listing = service.list(&args.dump)?;

    match output {
        OutputFormat::Json => print_json(&format::format_listing_json(&listing))?,
        OutputFormat::Text => print!("{}", format::format_listing_text(&listing)),
    }
    Ok(())
}

/// Run the load command
fn run_load(config: &Config, args: LoadArgs, output: OutputFormat) -> Result<()> {
    let service = open_service(config)?;
    let request = args.to_request(config.load.include_global_fields);
    info!(mode = args.load_mode(), dump = %args.dump.display(), "Running load");

    let report = service.load(&request)?;

    match output {
        OutputFormat::Json => print_json(&format::format_report_json(&report)?)?,
        OutputFormat::Text => print!("{}", format::format_report_text(&report)),
    }

    if report.has_errors() {
        bail!("{} project(s) failed to load", report.error_count());
    }
    Ok(())
}

/// Run the cleanup command
fn run_cleanup(config: &Config, output: OutputFormat) -> Result<()> {
    let service = open_service(config)?;
    let removed = service.cleanup()?;

    match output {
        OutputFormat::Json => print_json(&format::format_cleanup_json(&removed))?,
        OutputFormat::Text => print!("{}", format::format_cleanup_text(&removed)),
    }
    Ok(())
}

/// Run the add-user command
fn run_add_user(config: &Config, args: AddUserArgs, output: OutputFormat) -> Result<()> {
    config.ensure_db_dir()?;
    let db = Database::open(&config.database.path)?;
    let id = db.create_user(&args.name)?;

    match output {
        OutputFormat::Json => print_json(&serde_json::json!({ "id": id, "name": args.name }))?,
        OutputFormat::Text => println!("Created user '{}' with id {}", args.name, id),
    }
    Ok(())
}
