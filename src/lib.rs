//! Project Import Library
//!
//! Selectively loads projects from a SQL dump into a production SQLite
//! database, remapping ids and the field references embedded in templates.

pub mod cli;
pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod format;
pub mod id_map;
pub mod logging;
pub mod placeholders;
pub mod report;
pub mod service;
