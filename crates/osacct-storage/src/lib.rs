pub mod accounts;
pub mod attributes;
pub mod instances;
pub mod objects;
pub mod realms;

use osacct_core::{AccountEvent, EventSink, NoopEventSink};
use rusqlite::{ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub use objects::{ObjectIdAllocator, ObjectType, TskObjectAllocator};
pub use rusqlite::Connection;

pub const OS_ACCOUNT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{operation} failed: {source}")]
    Context {
        operation: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("invalid sql identifier {0:?}")]
    InvalidIdentifier(String),
}

impl StorageError {
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sqlite(err) | Self::Context { source: err, .. } => is_unique_violation(err),
            _ => false,
        }
    }
}

pub(crate) trait SqlContext<T> {
    fn context(self, operation: impl FnOnce() -> String) -> Result<T, StorageError>;
}

impl<T> SqlContext<T> for Result<T, rusqlite::Error> {
    fn context(self, operation: impl FnOnce() -> String) -> Result<T, StorageError> {
        self.map_err(|source| StorageError::Context {
            operation: operation(),
            source,
        })
    }
}

pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
    )
}

/// Result of an optimistic insert against a unique constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome<T> {
    Inserted(T),
    AlreadyExists,
}

impl<T> InsertOutcome<T> {
    pub fn inserted(self) -> Option<T> {
        match self {
            Self::Inserted(value) => Some(value),
            Self::AlreadyExists => None,
        }
    }
}

/// Runs `insert` inside a savepoint. A unique violation rolls the savepoint
/// back and reports `AlreadyExists`; the enclosing transaction stays usable.
pub fn try_insert<T>(
    conn: &Connection,
    operation: &'static str,
    insert: impl FnOnce(&Connection) -> Result<T, StorageError>,
) -> Result<InsertOutcome<T>, StorageError> {
    conn.execute_batch("SAVEPOINT try_insert")
        .context(|| format!("{operation}: open savepoint"))?;
    match insert(conn) {
        Ok(value) => {
            conn.execute_batch("RELEASE try_insert")
                .context(|| format!("{operation}: release savepoint"))?;
            Ok(InsertOutcome::Inserted(value))
        }
        Err(err) => {
            conn.execute_batch("ROLLBACK TO try_insert; RELEASE try_insert")
                .context(|| format!("{operation}: rollback savepoint"))?;
            if err.is_unique_violation() {
                debug!(event = "insert_conflict", operation = operation);
                Ok(InsertOutcome::AlreadyExists)
            } else {
                Err(err)
            }
        }
    }
}

pub fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, StorageError> {
    let exists = conn
        .query_row(
            "
            SELECT 1
            FROM sqlite_master
            WHERE type='table' AND name = ?1
            LIMIT 1
            ",
            [table_name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(exists.is_some())
}

/// Accepts plain `[A-Za-z_][A-Za-z0-9_]*` names for tables and columns that
/// have to be interpolated into SQL text.
pub(crate) fn checked_identifier(name: &str) -> Result<&str, StorageError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteLock {
    /// Writers contend at their first write; uniqueness constraints settle races.
    Deferred,
    /// Writers take the database write lock when the transaction begins.
    Immediate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub busy_timeout_ms: u64,
    pub write_lock: WriteLock,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            write_lock: WriteLock::Immediate,
        }
    }
}

/// One connection to a case database. Give each worker thread its own store.
pub struct CaseStore {
    conn: Connection,
    config: StoreConfig,
    events: Arc<dyn EventSink>,
}

impl CaseStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_config(path, StoreConfig::default())
    }

    pub fn open_with_config(
        path: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, config)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, StoreConfig::default())
    }

    fn from_connection(conn: Connection, config: StoreConfig) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let store = Self {
            conn,
            config,
            events: Arc::new(NoopEventSink),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > OS_ACCOUNT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: OS_ACCOUNT_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_os_accounts.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            debug!(event = "schema_migrated", version = 1);
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        table_exists(&self.conn, table_name)
    }

    pub fn begin(&mut self) -> Result<CaseTransaction<'_>, StorageError> {
        let behavior = match self.config.write_lock {
            WriteLock::Deferred => TransactionBehavior::Deferred,
            WriteLock::Immediate => TransactionBehavior::Immediate,
        };
        let tx = self
            .conn
            .transaction_with_behavior(behavior)
            .context(|| "begin transaction".to_string())?;
        Ok(CaseTransaction {
            tx,
            events: Arc::clone(&self.events),
            pending_events: RefCell::new(Vec::new()),
            commit_hooks: RefCell::new(Vec::new()),
        })
    }
}

type CommitHook = Box<dyn FnOnce()>;

/// Caller-controlled unit of work.
///
/// Events and commit hooks queued on the transaction only take effect after
/// a successful [`CaseTransaction::commit`]. Dropping the transaction rolls
/// it back and discards both.
pub struct CaseTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
    events: Arc<dyn EventSink>,
    pending_events: RefCell<Vec<AccountEvent>>,
    commit_hooks: RefCell<Vec<CommitHook>>,
}

impl<'conn> CaseTransaction<'conn> {
    pub fn connection(&self) -> &Connection {
        &self.tx
    }

    pub fn publish(&self, event: AccountEvent) {
        self.pending_events.borrow_mut().push(event);
    }

    pub fn on_commit(&self, hook: impl FnOnce() + 'static) {
        self.commit_hooks.borrow_mut().push(Box::new(hook));
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_events.borrow().len()
    }

    pub fn commit(self) -> Result<(), StorageError> {
        let Self {
            tx,
            events,
            pending_events,
            commit_hooks,
        } = self;
        tx.commit().context(|| "commit transaction".to_string())?;

        for hook in commit_hooks.into_inner() {
            hook();
        }
        let pending = pending_events.into_inner();
        debug!(event = "transaction_committed", published = pending.len());
        for event in pending {
            events.publish(event);
        }
        Ok(())
    }

    pub fn rollback(self) -> Result<(), StorageError> {
        let discarded = self.pending_events.borrow().len();
        self.tx
            .rollback()
            .context(|| "rollback transaction".to_string())?;
        debug!(event = "transaction_rolled_back", discarded = discarded);
        Ok(())
    }
}

impl Deref for CaseTransaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use osacct_core::RecordingEventSink;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::NamedTempFile;

    #[test]
    fn migration_creates_account_tables() {
        let db = CaseStore::open_in_memory().expect("open db");

        for table in [
            "tsk_objects",
            "os_account_realms",
            "os_accounts",
            "os_account_instances",
            "os_account_attributes",
        ] {
            assert!(db.table_exists(table).expect("table check"));
        }

        assert_eq!(
            db.schema_version().expect("schema version"),
            OS_ACCOUNT_SCHEMA_VERSION
        );
    }

    #[test]
    fn reopening_a_file_database_keeps_schema_version() {
        let file = NamedTempFile::new().expect("temp db");
        drop(CaseStore::open(file.path()).expect("first open"));
        let db = CaseStore::open(file.path()).expect("second open");
        assert_eq!(db.schema_version().expect("schema version"), 1);
    }

    #[test]
    fn newer_schema_versions_are_rejected() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let conn = Connection::open(file.path()).expect("raw open");
            conn.execute("PRAGMA user_version = 9", [])
                .expect("bump version");
        }
        let err = match CaseStore::open(file.path()) {
            Ok(_) => panic!("newer schema should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion {
                found: 9,
                supported: 1
            }
        ));
    }

    #[test]
    fn events_and_hooks_fire_only_on_commit() {
        let sink = Arc::new(RecordingEventSink::new());
        let mut db = CaseStore::open_in_memory()
            .expect("open db")
            .with_event_sink(sink.clone());
        let fired = Rc::new(Cell::new(0));

        let tx = db.begin().expect("begin");
        tx.publish(AccountEvent::AccountsAdded { accounts: vec![] });
        let counter = Rc::clone(&fired);
        tx.on_commit(move || counter.set(counter.get() + 1));
        tx.rollback().expect("rollback");
        assert!(sink.events().is_empty());
        assert_eq!(fired.get(), 0);

        let tx = db.begin().expect("begin");
        tx.publish(AccountEvent::AccountsAdded { accounts: vec![] });
        let counter = Rc::clone(&fired);
        tx.on_commit(move || counter.set(counter.get() + 1));
        tx.commit().expect("commit");
        assert_eq!(sink.count("accounts_added"), 1);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn try_insert_reports_unique_violation_and_keeps_transaction_usable() {
        let mut db = CaseStore::open_in_memory().expect("open db");
        let tx = db.begin().expect("begin");

        let insert = |conn: &Connection| -> Result<i64, StorageError> {
            conn.execute(
                "INSERT INTO os_account_realms (realm_signature, scope_confidence) VALUES ('corp_domain', 0)",
                [],
            )?;
            Ok(conn.last_insert_rowid())
        };

        let first = try_insert(&tx, "insert_realm", insert).expect("first insert");
        assert!(matches!(first, InsertOutcome::Inserted(_)));
        let second = try_insert(&tx, "insert_realm", insert).expect("second insert");
        assert_eq!(second, InsertOutcome::AlreadyExists);

        let count: i64 = tx
            .query_row("SELECT COUNT(*) FROM os_account_realms", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
        tx.commit().expect("commit");
    }

    #[test]
    fn identifiers_outside_the_plain_charset_are_rejected() {
        assert_eq!(
            checked_identifier("tsk_files").expect("valid"),
            "tsk_files"
        );
        assert!(checked_identifier("tsk_files; DROP TABLE x").is_err());
        assert!(checked_identifier("1abc").is_err());
        assert!(checked_identifier("").is_err());
    }
}
