use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use cabinet_portal_core::types::{Id, Tax, TaxInput};

use crate::to_rfc3339;

#[derive(Debug, Error)]
pub enum TaxError {
    #[error("tax not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct TaxRow {
    id: i64,
    label: String,
    value: f64,
    is_default: bool,
    created_at: DateTime<Utc>,
}

impl TaxRow {
    fn into_domain(self) -> Tax {
        Tax {
            id: self.id,
            label: self.label,
            value: self.value,
            is_default: self.is_default,
            created_at: self.created_at,
        }
    }
}

/// Repository for sales tax rates. At most one rate is the default.
#[derive(Clone)]
pub struct TaxRepository {
    pool: SqlitePool,
}

impl TaxRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Tax>, TaxError> {
        let rows = sqlx::query_as::<_, TaxRow>(
            "SELECT id, label, value, is_default, created_at FROM taxes ORDER BY is_default DESC, label",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TaxRow::into_domain).collect())
    }

    pub async fn create(&self, input: &TaxInput, now: DateTime<Utc>) -> Result<Tax, TaxError> {
        let mut tx = self.pool.begin().await?;
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM taxes")
            .fetch_one(&mut *tx)
            .await?;
        // The first rate becomes the default automatically.
        let is_default = input.is_default || existing == 0;
        if is_default {
            sqlx::query("UPDATE taxes SET is_default = 0")
                .execute(&mut *tx)
                .await?;
        }
        let row = sqlx::query_as::<_, TaxRow>(
            "INSERT INTO taxes (label, value, is_default, created_at) VALUES (?, ?, ?, ?) \
             RETURNING id, label, value, is_default, created_at",
        )
        .bind(input.label.trim())
        .bind(input.value)
        .bind(is_default)
        .bind(to_rfc3339(now))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row.into_domain())
    }

    pub async fn delete(&self, id: Id) -> Result<(), TaxError> {
        let result = sqlx::query("DELETE FROM taxes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TaxError::NotFound);
        }
        Ok(())
    }

    pub async fn set_default(&self, id: Id) -> Result<Tax, TaxError> {
        let mut tx = self.pool.begin().await?;
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM taxes WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(TaxError::NotFound);
        }
        sqlx::query("UPDATE taxes SET is_default = CASE WHEN id = ? THEN 1 ELSE 0 END")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query_as::<_, TaxRow>(
            "SELECT id, label, value, is_default, created_at FROM taxes WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row.into_domain())
    }

    /// Percentage of the default rate, or `0` when none is configured.
    pub async fn default_rate(&self) -> Result<f64, TaxError> {
        let value: Option<f64> =
            sqlx::query_scalar("SELECT value FROM taxes WHERE is_default = 1 LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.unwrap_or(0.0))
    }
}
