use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use cabinet_portal_core::pagination::like_pattern;
use cabinet_portal_core::types::{
    AssemblyCost, AssemblyFeeKind, CatalogItem, CatalogItemInput, CatalogModification,
    CatalogModificationInput, Id, StyleSummary,
};
use cabinet_portal_core::{Page, PageRequest};

use crate::{is_foreign_key_violation, push_search, to_rfc3339};

const ITEM_COLUMNS: &str = "id, manufacturer_id, code, style, description, color, item_type, \
    price, discontinued, assembly_type, assembly_price, created_at, updated_at";

/// Filters for a manufacturer's catalog listing.
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub search: Option<String>,
    pub style: Option<String>,
    pub include_discontinued: bool,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog item not found")]
    NotFound,
    #[error("manufacturer does not exist")]
    MissingManufacturer,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for CatalogError {
    fn from(err: sqlx::Error) -> Self {
        if is_foreign_key_violation(&err) {
            Self::MissingManufacturer
        } else {
            Self::Database(err)
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CatalogItemRow {
    id: i64,
    manufacturer_id: i64,
    code: String,
    style: Option<String>,
    description: Option<String>,
    color: Option<String>,
    item_type: Option<String>,
    price: f64,
    discontinued: bool,
    assembly_type: Option<String>,
    assembly_price: Option<f64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CatalogItemRow {
    fn into_domain(self) -> CatalogItem {
        let assembly_cost = self.assembly_price.map(|price| AssemblyCost {
            kind: self
                .assembly_type
                .as_deref()
                .map(AssemblyFeeKind::parse)
                .unwrap_or(AssemblyFeeKind::Legacy),
            price,
        });
        CatalogItem {
            id: self.id,
            manufacturer_id: self.manufacturer_id,
            code: self.code,
            style: self.style,
            description: self.description,
            color: self.color,
            item_type: self.item_type,
            price: self.price,
            discontinued: self.discontinued,
            assembly_cost,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ModificationRow {
    id: i64,
    catalog_item_id: i64,
    name: String,
    description: Option<String>,
    price: f64,
    created_at: DateTime<Utc>,
}

impl ModificationRow {
    fn into_domain(self) -> CatalogModification {
        CatalogModification {
            id: self.id,
            catalog_item_id: self.catalog_item_id,
            name: self.name,
            description: self.description,
            price: self.price,
            created_at: self.created_at,
        }
    }
}

/// Repository for manufacturer catalogs and their modification options.
#[derive(Clone)]
pub struct CatalogRepository {
    pool: SqlitePool,
}

impl CatalogRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(
        &self,
        manufacturer_id: Id,
        request: PageRequest,
        filter: &CatalogFilter,
    ) -> Result<Page<CatalogItem>, CatalogError> {
        let pattern = like_pattern(filter.search.as_deref());

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM catalog_items WHERE 1 = 1");
        push_filters(&mut count, manufacturer_id, filter, pattern.as_deref());
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        let request = request.clamped(total as u64);

        let mut query =
            QueryBuilder::<Sqlite>::new(format!("SELECT {ITEM_COLUMNS} FROM catalog_items WHERE 1 = 1"));
        push_filters(&mut query, manufacturer_id, filter, pattern.as_deref());
        query
            .push(" ORDER BY style COLLATE NOCASE ASC, code COLLATE NOCASE ASC, id ASC LIMIT ")
            .push_bind(request.limit as i64)
            .push(" OFFSET ")
            .push_bind(request.offset());
        let rows: Vec<CatalogItemRow> = query.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page::new(
            rows.into_iter().map(CatalogItemRow::into_domain).collect(),
            request,
            total as u64,
        ))
    }

    /// Distinct styles of a manufacturer with item counts and the cheapest price.
    pub async fn styles(&self, manufacturer_id: Id) -> Result<Vec<StyleSummary>, CatalogError> {
        let rows: Vec<(String, i64, f64)> = sqlx::query_as(
            "SELECT style, COUNT(*), CAST(MIN(price) AS REAL) FROM catalog_items \
             WHERE manufacturer_id = ? AND style IS NOT NULL AND style != '' AND discontinued = 0 \
             GROUP BY style ORDER BY style COLLATE NOCASE ASC",
        )
        .bind(manufacturer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(style, item_count, min_price)| StyleSummary {
                style,
                item_count,
                min_price,
            })
            .collect())
    }

    pub async fn find(&self, id: Id) -> Result<Option<CatalogItem>, CatalogError> {
        let row = sqlx::query_as::<_, CatalogItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM catalog_items WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CatalogItemRow::into_domain))
    }

    pub async fn create(
        &self,
        manufacturer_id: Id,
        input: &CatalogItemInput,
        now: DateTime<Utc>,
    ) -> Result<CatalogItem, CatalogError> {
        let id = insert_item(&self.pool, manufacturer_id, input, &to_rfc3339(now)).await?;
        self.find(id).await?.ok_or(CatalogError::NotFound)
    }

    pub async fn update(
        &self,
        id: Id,
        input: &CatalogItemInput,
        now: DateTime<Utc>,
    ) -> Result<CatalogItem, CatalogError> {
        let result = sqlx::query(
            "UPDATE catalog_items SET code = ?, style = ?, description = ?, color = ?, item_type = ?, \
             price = ?, discontinued = ?, updated_at = ? WHERE id = ?",
        )
        .bind(input.code.trim())
        .bind(&input.style)
        .bind(&input.description)
        .bind(&input.color)
        .bind(&input.item_type)
        .bind(input.price)
        .bind(input.discontinued)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound);
        }
        self.find(id).await?.ok_or(CatalogError::NotFound)
    }

    /// Replaces the whole catalog of a manufacturer in one transaction.
    pub async fn replace_all(
        &self,
        manufacturer_id: Id,
        rows: &[CatalogItemInput],
        now: DateTime<Utc>,
    ) -> Result<u64, CatalogError> {
        let now = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM catalog_items WHERE manufacturer_id = ?")
            .bind(manufacturer_id)
            .execute(&mut *tx)
            .await?;
        for row in rows {
            insert_item(&mut *tx, manufacturer_id, row, &now).await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    /// Sets the assembly fee on one item.
    pub async fn set_assembly_cost(
        &self,
        item_id: Id,
        cost: &AssemblyCost,
        now: DateTime<Utc>,
    ) -> Result<u64, CatalogError> {
        let result = sqlx::query(
            "UPDATE catalog_items SET assembly_type = ?, assembly_price = ?, updated_at = ? WHERE id = ?",
        )
        .bind(cost.kind.as_str())
        .bind(cost.price)
        .bind(to_rfc3339(now))
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound);
        }
        Ok(result.rows_affected())
    }

    /// Sets the assembly fee on every item of a manufacturer, optionally only one style.
    pub async fn set_assembly_cost_for_manufacturer(
        &self,
        manufacturer_id: Id,
        style: Option<&str>,
        cost: &AssemblyCost,
        now: DateTime<Utc>,
    ) -> Result<u64, CatalogError> {
        let result = sqlx::query(
            "UPDATE catalog_items SET assembly_type = ?, assembly_price = ?, updated_at = ? \
             WHERE manufacturer_id = ? AND (? IS NULL OR style = ?)",
        )
        .bind(cost.kind.as_str())
        .bind(cost.price)
        .bind(to_rfc3339(now))
        .bind(manufacturer_id)
        .bind(style)
        .bind(style)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn modifications(&self, item_id: Id) -> Result<Vec<CatalogModification>, CatalogError> {
        let rows = sqlx::query_as::<_, ModificationRow>(
            "SELECT id, catalog_item_id, name, description, price, created_at \
             FROM catalog_modifications WHERE catalog_item_id = ? ORDER BY name COLLATE NOCASE, id",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ModificationRow::into_domain).collect())
    }

    pub async fn add_modification(
        &self,
        item_id: Id,
        input: &CatalogModificationInput,
        now: DateTime<Utc>,
    ) -> Result<CatalogModification, CatalogError> {
        let row = sqlx::query_as::<_, ModificationRow>(
            "INSERT INTO catalog_modifications (catalog_item_id, name, description, price, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, catalog_item_id, name, description, price, created_at",
        )
        .bind(item_id)
        .bind(input.name.trim())
        .bind(&input.description)
        .bind(input.price)
        .bind(to_rfc3339(now))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                CatalogError::NotFound
            } else {
                CatalogError::Database(err)
            }
        })?;
        Ok(row.into_domain())
    }
}

async fn insert_item<'e, E>(
    executor: E,
    manufacturer_id: Id,
    input: &CatalogItemInput,
    now: &str,
) -> Result<Id, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "INSERT INTO catalog_items (manufacturer_id, code, style, description, color, item_type, \
         price, discontinued, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(manufacturer_id)
    .bind(input.code.trim())
    .bind(&input.style)
    .bind(&input.description)
    .bind(&input.color)
    .bind(&input.item_type)
    .bind(input.price)
    .bind(input.discontinued)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(result.last_insert_rowid())
}

fn push_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    manufacturer_id: Id,
    filter: &CatalogFilter,
    pattern: Option<&str>,
) {
    builder.push(" AND manufacturer_id = ").push_bind(manufacturer_id);
    if !filter.include_discontinued {
        builder.push(" AND discontinued = 0");
    }
    if let Some(style) = filter.style.as_deref().filter(|style| !style.trim().is_empty()) {
        builder.push(" AND style = ").push_bind(style.trim().to_string());
    }
    if let Some(pattern) = pattern {
        push_search(builder, pattern, &["code", "description", "style"]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;
    use cabinet_portal_core::types::ManufacturerInput;

    async fn manufacturer(db: &crate::Database) -> Id {
        db.manufacturers()
            .create(
                &ManufacturerInput {
                    name: "Fabuwood".into(),
                    ..ManufacturerInput::default()
                },
                Utc::now(),
            )
            .await
            .expect("manufacturer")
            .id
    }

    fn row(code: &str, style: &str, price: f64) -> CatalogItemInput {
        CatalogItemInput {
            code: code.to_string(),
            style: Some(style.to_string()),
            description: Some(format!("{code} cabinet")),
            price,
            ..CatalogItemInput::default()
        }
    }

    #[tokio::test]
    async fn replace_all_swaps_catalog_and_lists_styles() {
        let db = setup_db().await;
        let manufacturer_id = manufacturer(&db).await;
        let repo = db.catalog();
        repo.create(manufacturer_id, &row("OLD1", "Legacy", 10.0), Utc::now())
            .await
            .expect("old");

        let imported = repo
            .replace_all(
                manufacturer_id,
                &[
                    row("B12", "Shaker", 120.0),
                    row("B15", "Shaker", 150.0),
                    row("W3030", "Slab", 99.5),
                ],
                Utc::now(),
            )
            .await
            .expect("replace");
        assert_eq!(imported, 3);

        let styles = repo.styles(manufacturer_id).await.expect("styles");
        assert_eq!(styles.len(), 2);
        assert_eq!(styles[0].style, "Shaker");
        assert_eq!(styles[0].item_count, 2);
        assert_eq!(styles[0].min_price, 120.0);

        let page = repo
            .list(
                manufacturer_id,
                PageRequest::default(),
                &CatalogFilter {
                    style: Some("Shaker".into()),
                    search: Some("b1".into()),
                    ..CatalogFilter::default()
                },
            )
            .await
            .expect("list");
        assert_eq!(page.pagination.total, 2);
        assert_eq!(page.data[0].code, "B12");
    }

    #[tokio::test]
    async fn assembly_cost_for_one_or_all_items() {
        let db = setup_db().await;
        let manufacturer_id = manufacturer(&db).await;
        let repo = db.catalog();
        let first = repo
            .create(manufacturer_id, &row("B12", "Shaker", 120.0), Utc::now())
            .await
            .expect("first");
        repo.create(manufacturer_id, &row("B15", "Slab", 150.0), Utc::now())
            .await
            .expect("second");

        let flat = AssemblyCost {
            kind: AssemblyFeeKind::Flat,
            price: 25.0,
        };
        repo.set_assembly_cost(first.id, &flat, Utc::now())
            .await
            .expect("one");
        let item = repo.find(first.id).await.expect("find").expect("item");
        assert_eq!(item.assembly_cost, Some(flat));

        let percentage = AssemblyCost {
            kind: AssemblyFeeKind::Percentage,
            price: 10.0,
        };
        let updated = repo
            .set_assembly_cost_for_manufacturer(manufacturer_id, None, &percentage, Utc::now())
            .await
            .expect("all");
        assert_eq!(updated, 2);

        let only_slab = repo
            .set_assembly_cost_for_manufacturer(manufacturer_id, Some("Slab"), &flat, Utc::now())
            .await
            .expect("style");
        assert_eq!(only_slab, 1);
    }

    #[tokio::test]
    async fn modifications_belong_to_items() {
        let db = setup_db().await;
        let manufacturer_id = manufacturer(&db).await;
        let repo = db.catalog();
        let item = repo
            .create(manufacturer_id, &row("B12", "Shaker", 120.0), Utc::now())
            .await
            .expect("item");

        let modification = repo
            .add_modification(
                item.id,
                &CatalogModificationInput {
                    name: "Finished end".into(),
                    description: None,
                    price: 35.0,
                },
                Utc::now(),
            )
            .await
            .expect("modification");
        assert_eq!(modification.catalog_item_id, item.id);
        assert_eq!(repo.modifications(item.id).await.expect("list").len(), 1);

        let err = repo
            .add_modification(
                9_999,
                &CatalogModificationInput {
                    name: "Orphan".into(),
                    description: None,
                    price: 1.0,
                },
                Utc::now(),
            )
            .await
            .expect_err("missing item");
        assert!(matches!(err, CatalogError::NotFound));
    }

    #[tokio::test]
    async fn creating_for_unknown_manufacturer_fails() {
        let db = setup_db().await;
        let err = db
            .catalog()
            .create(404, &row("B12", "Shaker", 1.0), Utc::now())
            .await
            .expect_err("fk");
        assert!(matches!(err, CatalogError::MissingManufacturer));
    }
}
