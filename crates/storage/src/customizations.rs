use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;

use cabinet_portal_core::types::Id;

use crate::to_rfc3339;

pub const UI_KIND: &str = "ui";
pub const PDF_KIND: &str = "pdf";
pub const CONTACT_INFO_KIND: &str = "contact_info";

#[derive(Debug, Error)]
pub enum CustomizationError {
    #[error("stored settings for {kind} are not valid json: {source}")]
    Json {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Key/value store for singleton settings documents (UI branding, PDF layout, contact info).
#[derive(Clone)]
pub struct CustomizationRepository {
    pool: SqlitePool,
}

impl CustomizationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Loads the document stored under `kind`, falling back to `T::default()`.
    pub async fn get<T>(&self, kind: &str) -> Result<T, CustomizationError>
    where
        T: DeserializeOwned + Default,
    {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT settings_json FROM customizations WHERE kind = ?")
                .bind(kind)
                .fetch_optional(&self.pool)
                .await?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| CustomizationError::Json {
                kind: kind.to_string(),
                source,
            }),
            None => Ok(T::default()),
        }
    }

    pub async fn put<T>(
        &self,
        kind: &str,
        settings: &T,
        updated_by: Option<Id>,
        now: DateTime<Utc>,
    ) -> Result<(), CustomizationError>
    where
        T: Serialize,
    {
        let raw = serde_json::to_string(settings).map_err(|source| CustomizationError::Json {
            kind: kind.to_string(),
            source,
        })?;
        sqlx::query(
            "INSERT INTO customizations (kind, settings_json, updated_by, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(kind) DO UPDATE SET settings_json = excluded.settings_json, \
             updated_by = excluded.updated_by, updated_at = excluded.updated_at",
        )
        .bind(kind)
        .bind(raw)
        .bind(updated_by)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cabinet_portal_core::types::{ContactInfo, PdfCustomization, UiCustomization};

    use super::*;
    use crate::test_support::setup_db;

    #[tokio::test]
    async fn missing_documents_use_defaults() {
        let db = setup_db().await;
        let repo = db.customizations();
        let ui: UiCustomization = repo.get(UI_KIND).await.expect("ui");
        assert_eq!(ui, UiCustomization::default());
        let info: ContactInfo = repo.get(CONTACT_INFO_KIND).await.expect("info");
        assert!(info.email.is_none());
    }

    #[tokio::test]
    async fn put_overwrites_previous_document() {
        let db = setup_db().await;
        let repo = db.customizations();
        let mut pdf = PdfCustomization {
            company_name: Some("Acme Cabinets".into()),
            ..PdfCustomization::default()
        };
        repo.put(PDF_KIND, &pdf, None, Utc::now()).await.expect("put");
        pdf.show_prices = false;
        repo.put(PDF_KIND, &pdf, None, Utc::now()).await.expect("put again");

        let stored: PdfCustomization = repo.get(PDF_KIND).await.expect("get");
        assert_eq!(stored.company_name.as_deref(), Some("Acme Cabinets"));
        assert!(!stored.show_prices);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM customizations")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(rows, 1);
    }
}
