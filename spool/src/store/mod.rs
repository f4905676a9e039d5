//! Store - persists finished request scopes and reads them back.
//!
//! Everything a request produced is written in one DuckDB transaction by
//! [`Store::save_scope`]. Sampler blobs live out of line in a
//! [`BlobStorage`].

pub(crate) mod atomic;
mod finalize;
mod gc;
mod requests;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use duckdb::types::Type;
use duckdb::{Connection, Row};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::schema::{ProfileRecord, QueryRecord, RequestRecord};
use crate::storage::{BlobStorage, FileSystemStorage};
use crate::{Config, Error, Result};

pub use gc::GcStats;
pub use requests::{StoredProfile, StoredQuery};

/// Copy of one scope's buffered records, ready to persist.
#[derive(Debug, Clone)]
pub struct ScopeSnapshot {
    pub request: RequestRecord,
    /// Keyed by temp identifier.
    pub queries: BTreeMap<u64, QueryRecord>,
    /// Keyed by temp identifier.
    pub profiles: BTreeMap<u64, ProfileRecord>,
}

/// A spool store for reading and writing records.
pub struct Store {
    config: Config,
    db: Mutex<Connection>,
    blobs: Arc<dyn BlobStorage>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_path", &self.config.db_path())
            .finish()
    }
}

impl Store {
    /// Open an existing store, with blobs under the configured profiles dir.
    pub fn open(config: Config) -> Result<Self> {
        let blobs = Arc::new(FileSystemStorage::new(config.profiles_dir()));
        Self::open_with_storage(config, blobs)
    }

    /// Open an existing store with a custom blob backend.
    pub fn open_with_storage(config: Config, blobs: Arc<dyn BlobStorage>) -> Result<Self> {
        if !config.db_path().exists() {
            return Err(Error::NotInitialized(config.spool_root.clone()));
        }
        let db = Connection::open(config.db_path())?;
        Ok(Self {
            config,
            db: Mutex::new(db),
            blobs,
        })
    }

    /// Get a DuckDB connection to the store.
    ///
    /// Connections share one database instance, so concurrent writers see
    /// transaction conflicts rather than corrupting the file.
    pub fn connection(&self) -> Result<Connection> {
        Ok(self.db.lock().try_clone()?)
    }

    /// Get config reference.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn blobs(&self) -> &dyn BlobStorage {
        self.blobs.as_ref()
    }

    /// Run `f` inside BEGIN/COMMIT, rolling back if it or the commit fails.
    fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connection()?;
        conn.execute("BEGIN TRANSACTION", [])?;

        match f(&conn) {
            Ok(value) => {
                if let Err(e) = conn.execute("COMMIT", []) {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }
}

/// Timestamp as bound into a TIMESTAMP column.
fn ts_param(dt: &DateTime<Utc>) -> String {
    dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Timestamp read back through `epoch_us(col)`.
fn from_epoch_us(us: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(us).unwrap_or_default()
}

fn uuid_at(row: &Row<'_>, idx: usize) -> duckdb::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text)
        .map_err(|e| duckdb::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
