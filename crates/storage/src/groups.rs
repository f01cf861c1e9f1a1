use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use cabinet_portal_core::pagination::like_pattern;
use cabinet_portal_core::types::{
    ContractorGroup, ContractorSummary, GroupInput, GroupModules, GroupType, Id,
};
use cabinet_portal_core::{Page, PageRequest};

use crate::{push_search, to_rfc3339};

const GROUP_COLUMNS: &str =
    "g.id, g.name, g.group_type, g.modules_json, g.multiplier, g.multiplier_enabled, g.created_at, g.updated_at";

const COUNT_COLUMNS: &str = "\
    (SELECT COUNT(*) FROM users u WHERE u.group_id = g.id AND u.is_deleted = 0) AS user_count, \
    (SELECT COUNT(*) FROM customers c WHERE c.group_id = g.id AND c.deleted_at IS NULL) AS customer_count, \
    (SELECT COUNT(*) FROM proposals p WHERE p.owner_group_id = g.id AND p.is_deleted = 0) AS proposal_count";

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("group not found")]
    NotFound,
    #[error("failed to encode group modules: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct GroupRow {
    id: i64,
    name: String,
    group_type: String,
    modules_json: String,
    multiplier: Option<f64>,
    multiplier_enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GroupRow {
    fn into_domain(self) -> ContractorGroup {
        // Malformed module JSON disables every module rather than failing the request.
        let modules = serde_json::from_str::<GroupModules>(&self.modules_json).unwrap_or_default();
        ContractorGroup {
            id: self.id,
            name: self.name,
            group_type: GroupType::parse(&self.group_type),
            modules,
            multiplier: self.multiplier,
            multiplier_enabled: self.multiplier_enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GroupSummaryRow {
    #[sqlx(flatten)]
    group: GroupRow,
    user_count: i64,
    customer_count: i64,
    proposal_count: i64,
}

impl GroupSummaryRow {
    fn into_domain(self) -> ContractorSummary {
        ContractorSummary {
            group: self.group.into_domain(),
            user_count: self.user_count,
            customer_count: self.customer_count,
            proposal_count: self.proposal_count,
        }
    }
}

/// Repository for user groups and contractor tenants.
#[derive(Clone)]
pub struct GroupRepository {
    pool: SqlitePool,
}

impl GroupRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        input: &GroupInput,
        now: DateTime<Utc>,
    ) -> Result<ContractorGroup, GroupError> {
        let now = to_rfc3339(now);
        let id = sqlx::query(
            "INSERT INTO user_groups (name, group_type, modules_json, multiplier, multiplier_enabled, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(input.name.trim())
        .bind(input.group_type.as_str())
        .bind(serde_json::to_string(&input.modules)?)
        .bind(input.multiplier)
        .bind(input.multiplier_enabled)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.find(id).await?.ok_or(GroupError::NotFound)
    }

    pub async fn find(&self, id: Id) -> Result<Option<ContractorGroup>, GroupError> {
        let row = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {GROUP_COLUMNS} FROM user_groups g WHERE g.id = ? AND g.is_deleted = 0"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(GroupRow::into_domain))
    }

    /// Loads a group with its user, customer and proposal counts.
    pub async fn summary(&self, id: Id) -> Result<Option<ContractorSummary>, GroupError> {
        let row = sqlx::query_as::<_, GroupSummaryRow>(&format!(
            "SELECT {GROUP_COLUMNS}, {COUNT_COLUMNS} FROM user_groups g WHERE g.id = ? AND g.is_deleted = 0"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(GroupSummaryRow::into_domain))
    }

    /// Lists groups, optionally restricted to one type, with usage counts.
    pub async fn list(
        &self,
        request: PageRequest,
        search: Option<&str>,
        group_type: Option<GroupType>,
    ) -> Result<Page<ContractorSummary>, GroupError> {
        let pattern = like_pattern(search);

        let mut count =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM user_groups g WHERE g.is_deleted = 0");
        push_filters(&mut count, group_type, pattern.as_deref());
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        let request = request.clamped(total as u64);

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {GROUP_COLUMNS}, {COUNT_COLUMNS} FROM user_groups g WHERE g.is_deleted = 0"
        ));
        push_filters(&mut query, group_type, pattern.as_deref());
        query
            .push(" ORDER BY g.name COLLATE NOCASE ASC LIMIT ")
            .push_bind(request.limit as i64)
            .push(" OFFSET ")
            .push_bind(request.offset());
        let rows: Vec<GroupSummaryRow> = query.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page::new(
            rows.into_iter().map(GroupSummaryRow::into_domain).collect(),
            request,
            total as u64,
        ))
    }

    pub async fn update(
        &self,
        id: Id,
        input: &GroupInput,
        now: DateTime<Utc>,
    ) -> Result<ContractorGroup, GroupError> {
        let result = sqlx::query(
            "UPDATE user_groups SET name = ?, group_type = ?, modules_json = ?, multiplier = ?, \
             multiplier_enabled = ?, updated_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(input.name.trim())
        .bind(input.group_type.as_str())
        .bind(serde_json::to_string(&input.modules)?)
        .bind(input.multiplier)
        .bind(input.multiplier_enabled)
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GroupError::NotFound);
        }
        self.find(id).await?.ok_or(GroupError::NotFound)
    }

    /// Soft-deletes the group and detaches its members.
    pub async fn soft_delete(&self, id: Id, now: DateTime<Utc>) -> Result<(), GroupError> {
        let now = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE user_groups SET is_deleted = 1, updated_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GroupError::NotFound);
        }
        sqlx::query("UPDATE users SET group_id = NULL, updated_at = ? WHERE group_id = ?")
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn push_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    group_type: Option<GroupType>,
    pattern: Option<&str>,
) {
    if let Some(group_type) = group_type {
        builder.push(" AND g.group_type = ").push_bind(group_type.as_str());
    }
    if let Some(pattern) = pattern {
        push_search(builder, pattern, &["g.name"]);
    }
}
