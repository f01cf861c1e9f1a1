use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use cabinet_portal_core::types::{Id, Manufacturer, ManufacturerInput};

use crate::to_rfc3339;

const MANUFACTURER_COLUMNS: &str = "id, name, email, phone, address, website, is_price_msrp, \
    cost_multiplier, delivery_fee, instructions, image, enabled, created_at, updated_at";

#[derive(Debug, Error)]
pub enum ManufacturerError {
    #[error("manufacturer not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct ManufacturerRow {
    id: i64,
    name: String,
    email: Option<String>,
    phone: Option<String>,
    address: Option<String>,
    website: Option<String>,
    is_price_msrp: bool,
    cost_multiplier: f64,
    delivery_fee: f64,
    instructions: Option<String>,
    image: Option<String>,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ManufacturerRow {
    fn into_domain(self) -> Manufacturer {
        Manufacturer {
            id: self.id,
            name: self.name,
            email: self.email,
            phone: self.phone,
            address: self.address,
            website: self.website,
            is_price_msrp: self.is_price_msrp,
            cost_multiplier: self.cost_multiplier,
            delivery_fee: self.delivery_fee,
            instructions: self.instructions,
            image: self.image,
            enabled: self.enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Repository for cabinet manufacturers.
#[derive(Clone)]
pub struct ManufacturerRepository {
    pool: SqlitePool,
}

impl ManufacturerRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        input: &ManufacturerInput,
        now: DateTime<Utc>,
    ) -> Result<Manufacturer, ManufacturerError> {
        let now = to_rfc3339(now);
        let id = sqlx::query(
            "INSERT INTO manufacturers (name, email, phone, address, website, is_price_msrp, \
             cost_multiplier, delivery_fee, instructions, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(input.name.trim())
        .bind(&input.email)
        .bind(&input.phone)
        .bind(&input.address)
        .bind(&input.website)
        .bind(input.is_price_msrp)
        .bind(input.cost_multiplier)
        .bind(input.delivery_fee)
        .bind(&input.instructions)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.find(id).await?.ok_or(ManufacturerError::NotFound)
    }

    pub async fn find(&self, id: Id) -> Result<Option<Manufacturer>, ManufacturerError> {
        let row = sqlx::query_as::<_, ManufacturerRow>(&format!(
            "SELECT {MANUFACTURER_COLUMNS} FROM manufacturers WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ManufacturerRow::into_domain))
    }

    /// All manufacturers ordered by name; disabled ones only when requested.
    pub async fn list(&self, include_disabled: bool) -> Result<Vec<Manufacturer>, ManufacturerError> {
        let rows = sqlx::query_as::<_, ManufacturerRow>(&format!(
            "SELECT {MANUFACTURER_COLUMNS} FROM manufacturers \
             WHERE enabled = 1 OR ? ORDER BY name COLLATE NOCASE ASC"
        ))
        .bind(include_disabled)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ManufacturerRow::into_domain).collect())
    }

    pub async fn update(
        &self,
        id: Id,
        input: &ManufacturerInput,
        now: DateTime<Utc>,
    ) -> Result<Manufacturer, ManufacturerError> {
        let result = sqlx::query(
            "UPDATE manufacturers SET name = ?, email = ?, phone = ?, address = ?, website = ?, \
             is_price_msrp = ?, cost_multiplier = ?, delivery_fee = ?, instructions = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(input.name.trim())
        .bind(&input.email)
        .bind(&input.phone)
        .bind(&input.address)
        .bind(&input.website)
        .bind(input.is_price_msrp)
        .bind(input.cost_multiplier)
        .bind(input.delivery_fee)
        .bind(&input.instructions)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ManufacturerError::NotFound);
        }
        self.find(id).await?.ok_or(ManufacturerError::NotFound)
    }

    pub async fn set_enabled(
        &self,
        id: Id,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<Manufacturer, ManufacturerError> {
        let result =
            sqlx::query("UPDATE manufacturers SET enabled = ?, updated_at = ? WHERE id = ?")
                .bind(enabled)
                .bind(to_rfc3339(now))
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(ManufacturerError::NotFound);
        }
        self.find(id).await?.ok_or(ManufacturerError::NotFound)
    }

    /// Stores the uploaded logo path and returns the previous one.
    pub async fn set_image(
        &self,
        id: Id,
        image: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, ManufacturerError> {
        let previous = self.find(id).await?.ok_or(ManufacturerError::NotFound)?.image;
        sqlx::query("UPDATE manufacturers SET image = ?, updated_at = ? WHERE id = ?")
            .bind(image)
            .bind(to_rfc3339(now))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;

    fn input(name: &str) -> ManufacturerInput {
        ManufacturerInput {
            name: name.to_string(),
            cost_multiplier: 1.5,
            delivery_fee: 95.0,
            ..ManufacturerInput::default()
        }
    }

    #[tokio::test]
    async fn create_and_toggle_status() {
        let db = setup_db().await;
        let repo = db.manufacturers();
        let manufacturer = repo.create(&input("Fabuwood"), Utc::now()).await.expect("create");
        assert!(manufacturer.enabled);
        assert!(manufacturer.is_price_msrp);
        assert_eq!(manufacturer.cost_multiplier, 1.5);

        let disabled = repo
            .set_enabled(manufacturer.id, false, Utc::now())
            .await
            .expect("disable");
        assert!(!disabled.enabled);

        assert!(repo.list(false).await.expect("enabled").is_empty());
        assert_eq!(repo.list(true).await.expect("all").len(), 1);
    }

    #[tokio::test]
    async fn update_and_image() {
        let db = setup_db().await;
        let repo = db.manufacturers();
        let manufacturer = repo.create(&input("Fabuwood"), Utc::now()).await.expect("create");

        let mut changes = input("Fabuwood Cabinetry");
        changes.is_price_msrp = false;
        let updated = repo
            .update(manufacturer.id, &changes, Utc::now())
            .await
            .expect("update");
        assert_eq!(updated.name, "Fabuwood Cabinetry");
        assert!(!updated.is_price_msrp);

        let previous = repo
            .set_image(manufacturer.id, "uploads/logo-a.png", Utc::now())
            .await
            .expect("image");
        assert_eq!(previous, None);
        let previous = repo
            .set_image(manufacturer.id, "uploads/logo-b.png", Utc::now())
            .await
            .expect("image");
        assert_eq!(previous.as_deref(), Some("uploads/logo-a.png"));

        assert!(matches!(
            repo.update(404, &changes, Utc::now()).await,
            Err(ManufacturerError::NotFound)
        ));
    }
}
