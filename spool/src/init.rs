//! spool initialization - creates directory structure and database.
//!
//! Layout under SPOOL_ROOT:
//! - `config.toml` - persisted [`Config`]
//! - `db/spool.duckdb` - requests, responses, queries, profiles
//! - `profiles/` - sampler blobs (unless `profiler_result_path` points elsewhere)

use std::fs;

use crate::schema::SCHEMA;
use crate::{Config, Error, Result};

/// Initialize a new spool installation.
///
/// Creates the directory structure and the DuckDB schema.
pub fn initialize(config: &Config) -> Result<()> {
    let spool_root = &config.spool_root;

    // Check if already initialized
    if config.db_path().exists() {
        return Err(Error::AlreadyInitialized(spool_root.clone()));
    }

    config.validate()?;

    create_directories(config)?;

    init_database(config)?;

    config.save()?;

    Ok(())
}

/// Whether the store at this root has been initialized.
pub fn is_initialized(config: &Config) -> bool {
    config.db_path().exists()
}

/// Create the spool directory structure.
fn create_directories(config: &Config) -> Result<()> {
    let dirs = [config.spool_root.join("db"), config.profiles_dir()];

    for dir in &dirs {
        fs::create_dir_all(dir)?;
    }

    Ok(())
}

/// Create the tables and sequences.
fn init_database(config: &Config) -> Result<()> {
    let conn = duckdb::Connection::open(config.db_path())?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
