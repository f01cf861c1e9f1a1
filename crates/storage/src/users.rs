use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use cabinet_portal_core::pagination::like_pattern;
use cabinet_portal_core::permissions::is_admin_role;
use cabinet_portal_core::types::{Id, Role, User};
use cabinet_portal_core::{Page, PageRequest};

use crate::{is_foreign_key_violation, is_unique_violation, push_search, to_rfc3339};

const USER_COLUMNS: &str =
    "id, name, email, password_hash, role, group_id, created_at, updated_at";

/// User together with its password hash, used by login.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user: User,
    pub password_hash: String,
}

/// Parameters required to insert a user.
pub struct NewUser<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub role: Role,
    pub group_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}

/// Fields an admin may change on a user. `None` leaves the column untouched.
#[derive(Debug, Default)]
pub struct UserChanges<'a> {
    pub name: Option<&'a str>,
    pub email: Option<&'a str>,
    pub password_hash: Option<&'a str>,
    pub role: Option<Role>,
    pub group_id: Option<Option<Id>>,
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("user not found")]
    NotFound,
    #[error("email address is already registered")]
    EmailTaken,
    #[error("group does not exist")]
    MissingGroup,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for UserError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            Self::EmailTaken
        } else if is_foreign_key_violation(&err) {
            Self::MissingGroup
        } else {
            Self::Database(err)
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    name: String,
    email: String,
    password_hash: String,
    role: String,
    group_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    fn into_record(self) -> UserRecord {
        UserRecord {
            user: User {
                id: self.id,
                name: self.name,
                email: self.email,
                role: Role::parse(&self.role),
                group_id: self.group_id,
                created_at: self.created_at,
                updated_at: self.updated_at,
            },
            password_hash: self.password_hash,
        }
    }

    fn into_domain(self) -> User {
        self.into_record().user
    }
}

/// Repository for user accounts.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewUser<'_>) -> Result<User, UserError> {
        let now = to_rfc3339(new.created_at);
        let id = sqlx::query(
            "INSERT INTO users (name, email, password_hash, role, group_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.name.trim())
        .bind(new.email.trim())
        .bind(new.password_hash)
        .bind(new.role.as_str())
        .bind(new.group_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.find(id).await?.ok_or(UserError::NotFound)
    }

    pub async fn find(&self, id: Id) -> Result<Option<User>, UserError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ? AND is_deleted = 0"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRow::into_domain))
    }

    /// Looks up an active account by email, case-insensitively.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, UserError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower(?) AND is_deleted = 0"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRow::into_record))
    }

    pub async fn list(
        &self,
        request: PageRequest,
        search: Option<&str>,
    ) -> Result<Page<User>, UserError> {
        let pattern = like_pattern(search);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM users WHERE is_deleted = 0");
        if let Some(pattern) = &pattern {
            push_search(&mut count, pattern, &["name", "email"]);
        }
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        let request = request.clamped(total as u64);

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {USER_COLUMNS} FROM users WHERE is_deleted = 0"
        ));
        if let Some(pattern) = &pattern {
            push_search(&mut query, pattern, &["name", "email"]);
        }
        query
            .push(" ORDER BY name COLLATE NOCASE ASC LIMIT ")
            .push_bind(request.limit as i64)
            .push(" OFFSET ")
            .push_bind(request.offset());
        let rows: Vec<UserRow> = query.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page::new(
            rows.into_iter().map(UserRow::into_domain).collect(),
            request,
            total as u64,
        ))
    }

    pub async fn update(
        &self,
        id: Id,
        changes: UserChanges<'_>,
        now: DateTime<Utc>,
    ) -> Result<User, UserError> {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE users SET updated_at = ");
        query.push_bind(to_rfc3339(now));
        if let Some(name) = changes.name {
            query.push(", name = ").push_bind(name.trim().to_string());
        }
        if let Some(email) = changes.email {
            query.push(", email = ").push_bind(email.trim().to_string());
        }
        if let Some(hash) = changes.password_hash {
            query.push(", password_hash = ").push_bind(hash.to_string());
        }
        if let Some(role) = changes.role {
            query.push(", role = ").push_bind(role.as_str());
        }
        if let Some(group_id) = changes.group_id {
            query.push(", group_id = ").push_bind(group_id);
        }
        query
            .push(" WHERE is_deleted = 0 AND id = ")
            .push_bind(id);

        let result = query.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(UserError::NotFound);
        }
        self.find(id).await?.ok_or(UserError::NotFound)
    }

    pub async fn soft_delete(&self, id: Id, now: DateTime<Utc>) -> Result<(), UserError> {
        let result = sqlx::query(
            "UPDATE users SET is_deleted = 1, updated_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(UserError::NotFound);
        }
        Ok(())
    }

    pub async fn count_active(&self) -> Result<i64, UserError> {
        let total = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE is_deleted = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    /// Active accounts whose role bypasses group scoping.
    pub async fn admin_ids(&self) -> Result<Vec<Id>, UserError> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, role FROM users WHERE is_deleted = 0 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .filter(|(_, role)| is_admin_role(Role::parse(role)))
            .map(|(id, _)| id)
            .collect())
    }

    /// Active non-admin members of a group.
    pub async fn member_ids(&self, group_id: Id) -> Result<Vec<Id>, UserError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, role FROM users WHERE is_deleted = 0 AND group_id = ? ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter(|(_, role)| !is_admin_role(Role::parse(role)))
            .map(|(id, _)| id)
            .collect())
    }
}
