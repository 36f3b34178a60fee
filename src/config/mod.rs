//! Configuration for the project importer.
//!
//! Consolidates configuration from several tiers with field-by-field YAML merging:
//! 1. **Defaults** - Compiled in
//! 2. **Project** - `$CWD/project-import/config.yaml`
//! 3. **User** - `~/.project-import/config.yaml`
//! 4. **Environment** - variables listed below
//!
//! ## Environment Variables
//! - `PROJECT_IMPORT_CONFIG_PATH` - Explicit config file (overrides all tiers)
//! - `PROJECT_IMPORT_DB_PATH` - Production database path
//! - `PROJECT_IMPORT_STAGING_DIR` - Directory holding staging schema files
//! - `PROJECT_IMPORT_USER_DIR` - User config dir (default: `~/.project-import`)
//! - `PROJECT_IMPORT_PROJECT_DIR` - Project config dir (default: `./project-import`)

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::deep_merge;
pub use types::*;
