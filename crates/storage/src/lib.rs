use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    QueryBuilder, Row, Sqlite, SqlitePool,
};
use thiserror::Error;

use cabinet_portal_core::GroupScope;

pub mod activity;
pub mod catalog;
pub mod contacts;
pub mod customers;
pub mod customizations;
pub mod groups;
pub mod manufacturers;
pub mod notifications;
pub mod proposals;
pub mod taxes;
pub mod users;

pub use activity::{ActivityError, ActivityRepository, NewActivity};
pub use catalog::{CatalogError, CatalogFilter, CatalogRepository};
pub use contacts::{ContactError, ContactRepository, ThreadFilter, Viewer};
pub use customers::{CustomerError, CustomerFilter, CustomerRepository};
pub use customizations::{
    CustomizationError, CustomizationRepository, CONTACT_INFO_KIND, PDF_KIND, UI_KIND,
};
pub use groups::{GroupError, GroupRepository};
pub use manufacturers::{ManufacturerError, ManufacturerRepository};
pub use notifications::{NotificationError, NotificationFilter, NotificationRepository};
pub use proposals::{
    NewProposal, ProposalCounts, ProposalError, ProposalFilter, ProposalRepository, ProposalUpdate,
    StatusTransition,
};
pub use taxes::{TaxError, TaxRepository};
pub use users::{NewUser, UserChanges, UserError, UserRecord, UserRepository};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Every pooled connection gets the same pragmas: foreign keys, WAL,
    /// `synchronous = NORMAL` and a 5 second busy timeout.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(5000));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    pub fn groups(&self) -> GroupRepository {
        GroupRepository::new(self.pool.clone())
    }

    pub fn customers(&self) -> CustomerRepository {
        CustomerRepository::new(self.pool.clone())
    }

    pub fn proposals(&self) -> ProposalRepository {
        ProposalRepository::new(self.pool.clone())
    }

    pub fn manufacturers(&self) -> ManufacturerRepository {
        ManufacturerRepository::new(self.pool.clone())
    }

    pub fn catalog(&self) -> CatalogRepository {
        CatalogRepository::new(self.pool.clone())
    }

    pub fn taxes(&self) -> TaxRepository {
        TaxRepository::new(self.pool.clone())
    }

    pub fn contacts(&self) -> ContactRepository {
        ContactRepository::new(self.pool.clone())
    }

    pub fn notifications(&self) -> NotificationRepository {
        NotificationRepository::new(self.pool.clone())
    }

    pub fn customizations(&self) -> CustomizationRepository {
        CustomizationRepository::new(self.pool.clone())
    }

    pub fn activity(&self) -> ActivityRepository {
        ActivityRepository::new(self.pool.clone())
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and reports the frame counters.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;
        Ok(CheckpointStats {
            busy_frames: row.try_get::<i64, _>(0)?,
            log_frames: row.try_get::<i64, _>(1)?,
            checkpointed_frames: row.try_get::<i64, _>(2)?,
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Result of a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Returns `true` when SQLite reported `SQLITE_BUSY` or `SQLITE_LOCKED`.
pub fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("2067"),
        _ => false,
    }
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("787"),
        _ => false,
    }
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Appends the owner-group restriction for `scope` to a `WHERE` clause.
pub(crate) fn push_scope(builder: &mut QueryBuilder<'_, Sqlite>, scope: GroupScope, column: &str) {
    match scope {
        GroupScope::All => {}
        GroupScope::Group(id) => {
            builder.push(format!(" AND {column} = ")).push_bind(id);
        }
        GroupScope::Unowned => {
            builder.push(format!(" AND {column} IS NULL"));
        }
    }
}

/// Appends a case-insensitive `LIKE` over several columns.
pub(crate) fn push_search(builder: &mut QueryBuilder<'_, Sqlite>, pattern: &str, columns: &[&str]) {
    builder.push(" AND (");
    for (index, column) in columns.iter().enumerate() {
        if index > 0 {
            builder.push(" OR ");
        }
        builder
            .push(format!("LOWER(COALESCE({column}, '')) LIKE "))
            .push_bind(pattern.to_string())
            .push(" ESCAPE '\\'");
    }
    builder.push(")");
}
