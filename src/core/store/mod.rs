//! SQLite-backed state store for work orders, parts and quality records
//!
//! Definitions (processes, steps, rule sets) live in YAML files; everything
//! that changes while parts travel lives here:
//! - work orders and their parts (with per-step visit counters)
//! - quality reports and QA sign-offs
//! - sampling trigger states of the fallback loop
//! - the audit event log
//!
//! Every engine operation runs inside one `BEGIN IMMEDIATE` transaction and
//! part rows carry a `revision` for optimistic concurrency checks.

mod queries;
mod schema;

pub use queries::StoredEvent;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use miette::Diagnostic;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::debug;

use crate::core::identity::EntityId;

/// Database file location within a project
pub const STATE_FILE: &str = ".tflow/state.db";

/// Current schema version
const SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Errors raised by the state store
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("database error: {0}")]
    #[diagnostic(code(tflow::store::sqlite))]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode or decode column data: {0}")]
    #[diagnostic(code(tflow::store::serialization))]
    Serialization(#[from] serde_json::Error),

    #[error("concurrent update of {entity} {id} (expected revision {expected})")]
    #[diagnostic(
        code(tflow::store::conflict),
        help("another writer changed the record first; re-issue the request")
    )]
    Conflict {
        entity: &'static str,
        id: String,
        expected: u32,
    },

    #[error("{entity} not found: {id}")]
    #[diagnostic(code(tflow::store::not_found))]
    NotFound { entity: &'static str, id: String },

    #[error("corrupt value in column '{column}': {message}")]
    #[diagnostic(code(tflow::store::corrupt))]
    Corrupt {
        column: &'static str,
        message: String,
    },

    #[error("state database schema version {found} does not match expected {expected}")]
    #[diagnostic(
        code(tflow::store::schema),
        help("the database was written by a different version of tflow")
    )]
    SchemaMismatch { found: i64, expected: i64 },

    #[error("IO error: {0}")]
    #[diagnostic(code(tflow::store::io))]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether re-issuing the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Conflict { .. } => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// The state store backed by SQLite
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create the state database at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        configure_connection(&conn)?;

        let mut store = Self { conn };
        store.ensure_schema()?;
        debug!(path = %path.display(), "opened state store");
        Ok(store)
    }

    /// Open a private in-memory database (tests and dry runs)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn)?;

        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Run `f` inside one immediate (write-locked) transaction
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise,
    /// so a caller never observes a partially applied operation.
    pub fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let store_tx = StoreTx { tx };
        let value = f(&store_tx)?;
        store_tx.tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    fn ensure_schema(&mut self) -> StoreResult<()> {
        match self.schema_version()? {
            None => self.init_schema(),
            Some(found) if found == SCHEMA_VERSION => Ok(()),
            Some(found) => Err(StoreError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION,
            }),
        }
    }
}

/// Apply the connection settings every handle needs
fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// An open store transaction; all reads and writes go through it
pub struct StoreTx<'conn> {
    tx: Transaction<'conn>,
}

/// Fixed-width UTC timestamp so text ordering matches time ordering
pub(crate) fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(column: &'static str, s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            column,
            message: format!("'{}': {}", s, e),
        })
}

pub(crate) fn parse_id(column: &'static str, s: &str) -> StoreResult<EntityId> {
    EntityId::parse(s).map_err(|e| StoreError::Corrupt {
        column,
        message: e.to_string(),
    })
}

pub(crate) fn parse_enum<T>(column: &'static str, s: &str) -> StoreResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    s.parse().map_err(|message| StoreError::Corrupt { column, message })
}
