use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use cabinet_portal_core::pagination::like_pattern;
use cabinet_portal_core::types::{ContactMessage, ContactThread, Id, ThreadStatus};
use cabinet_portal_core::{Page, PageRequest};

use crate::{push_search, to_rfc3339};

/// Which side of a conversation is looking at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: Id,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadFilter {
    pub status: Option<ThreadStatus>,
    pub search: Option<String>,
}

#[derive(Debug, Error)]
pub enum ContactError {
    #[error("thread not found")]
    NotFound,
    #[error("thread is closed")]
    Closed,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct ThreadRow {
    id: i64,
    user_id: i64,
    subject: String,
    status: String,
    last_message_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    owner_name: Option<String>,
    unread_count: i64,
}

impl ThreadRow {
    fn into_domain(self) -> ContactThread {
        ContactThread {
            id: self.id,
            user_id: self.user_id,
            subject: self.subject,
            status: ThreadStatus::parse(&self.status).unwrap_or(ThreadStatus::Open),
            last_message_at: self.last_message_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            owner_name: self.owner_name,
            unread_count: self.unread_count,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    thread_id: i64,
    author_user_id: i64,
    author_name: Option<String>,
    is_admin: bool,
    body: String,
    read_by_recipient: bool,
    read_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn into_domain(self) -> ContactMessage {
        ContactMessage {
            id: self.id,
            thread_id: self.thread_id,
            author_user_id: self.author_user_id,
            author_name: self.author_name,
            is_admin: self.is_admin,
            body: self.body,
            read_by_recipient: self.read_by_recipient,
            read_at: self.read_at,
            created_at: self.created_at,
        }
    }
}

fn thread_select(builder: &mut QueryBuilder<'_, Sqlite>, viewer: Viewer) {
    builder
        .push(
            "SELECT t.id, t.user_id, t.subject, t.status, t.last_message_at, t.created_at, t.updated_at, \
             u.name AS owner_name, \
             (SELECT COUNT(*) FROM contact_messages m WHERE m.thread_id = t.id \
              AND m.read_by_recipient = 0 AND m.is_admin != ",
        )
        .push_bind(viewer.is_admin)
        .push(") AS unread_count FROM contact_threads t LEFT JOIN users u ON u.id = t.user_id WHERE 1 = 1");
}

fn push_visibility(builder: &mut QueryBuilder<'_, Sqlite>, viewer: Viewer) {
    if !viewer.is_admin {
        builder.push(" AND t.user_id = ").push_bind(viewer.user_id);
    }
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.thread_id, m.author_user_id, u.name AS author_name, \
    m.is_admin, m.body, m.read_by_recipient, m.read_at, m.created_at \
    FROM contact_messages m LEFT JOIN users u ON u.id = m.author_user_id";

/// Repository for contact threads and their messages.
#[derive(Clone)]
pub struct ContactRepository {
    pool: SqlitePool,
}

impl ContactRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens a thread with its first message written by the thread owner.
    pub async fn create_thread(
        &self,
        user_id: Id,
        subject: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<(ContactThread, ContactMessage), ContactError> {
        let now_text = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;
        let thread_id = sqlx::query(
            "INSERT INTO contact_threads (user_id, subject, status, last_message_at, created_at, updated_at) \
             VALUES (?, ?, 'open', ?, ?, ?)",
        )
        .bind(user_id)
        .bind(subject.trim())
        .bind(&now_text)
        .bind(&now_text)
        .bind(&now_text)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        let message_id = sqlx::query(
            "INSERT INTO contact_messages (thread_id, author_user_id, is_admin, body, created_at) \
             VALUES (?, ?, 0, ?, ?)",
        )
        .bind(thread_id)
        .bind(user_id)
        .bind(body.trim())
        .bind(&now_text)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;

        let viewer = Viewer {
            user_id,
            is_admin: false,
        };
        let thread = self
            .find_thread(thread_id, viewer)
            .await?
            .ok_or(ContactError::NotFound)?;
        let message = self.find_message(message_id).await?.ok_or(ContactError::NotFound)?;
        Ok((thread, message))
    }

    /// Threads visible to the viewer, most recent activity first.
    pub async fn list_threads(
        &self,
        viewer: Viewer,
        request: PageRequest,
        filter: &ThreadFilter,
    ) -> Result<Page<ContactThread>, ContactError> {
        let pattern = like_pattern(filter.search.as_deref());

        let mut count = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM contact_threads t LEFT JOIN users u ON u.id = t.user_id WHERE 1 = 1",
        );
        push_thread_filters(&mut count, viewer, filter, pattern.as_deref());
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        let request = request.clamped(total as u64);

        let mut query = QueryBuilder::<Sqlite>::new("");
        thread_select(&mut query, viewer);
        push_thread_filters(&mut query, viewer, filter, pattern.as_deref());
        query
            .push(" ORDER BY COALESCE(t.last_message_at, t.created_at) DESC, t.id DESC LIMIT ")
            .push_bind(request.limit as i64)
            .push(" OFFSET ")
            .push_bind(request.offset());
        let rows: Vec<ThreadRow> = query.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page::new(
            rows.into_iter().map(ThreadRow::into_domain).collect(),
            request,
            total as u64,
        ))
    }

    /// Loads a thread if the viewer may see it.
    pub async fn find_thread(
        &self,
        id: Id,
        viewer: Viewer,
    ) -> Result<Option<ContactThread>, ContactError> {
        let mut query = QueryBuilder::<Sqlite>::new("");
        thread_select(&mut query, viewer);
        push_visibility(&mut query, viewer);
        query.push(" AND t.id = ").push_bind(id);
        let row: Option<ThreadRow> = query.build_query_as().fetch_optional(&self.pool).await?;
        Ok(row.map(ThreadRow::into_domain))
    }

    pub async fn messages(&self, thread_id: Id) -> Result<Vec<ContactMessage>, ContactError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "{MESSAGE_SELECT} WHERE m.thread_id = ? ORDER BY m.created_at ASC, m.id ASC"
        ))
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MessageRow::into_domain).collect())
    }

    async fn find_message(&self, id: Id) -> Result<Option<ContactMessage>, ContactError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!("{MESSAGE_SELECT} WHERE m.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(MessageRow::into_domain))
    }

    /// Appends a reply. Closed threads reject new messages.
    pub async fn post_message(
        &self,
        thread_id: Id,
        author: Viewer,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<ContactMessage, ContactError> {
        let now_text = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM contact_threads WHERE id = ?")
                .bind(thread_id)
                .fetch_optional(&mut *tx)
                .await?;
        match status.as_deref().and_then(ThreadStatus::parse) {
            None => return Err(ContactError::NotFound),
            Some(ThreadStatus::Closed) => return Err(ContactError::Closed),
            Some(ThreadStatus::Open) => {}
        }

        let message_id = sqlx::query(
            "INSERT INTO contact_messages (thread_id, author_user_id, is_admin, body, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(thread_id)
        .bind(author.user_id)
        .bind(author.is_admin)
        .bind(body.trim())
        .bind(&now_text)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        sqlx::query("UPDATE contact_threads SET last_message_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now_text)
            .bind(&now_text)
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.find_message(message_id).await?.ok_or(ContactError::NotFound)
    }

    /// Marks every message from the other side as read. Returns the number updated.
    pub async fn mark_read(
        &self,
        thread_id: Id,
        viewer: Viewer,
        now: DateTime<Utc>,
    ) -> Result<u64, ContactError> {
        let result = sqlx::query(
            "UPDATE contact_messages SET read_by_recipient = 1, read_at = ? \
             WHERE thread_id = ? AND is_admin != ? AND read_by_recipient = 0",
        )
        .bind(to_rfc3339(now))
        .bind(thread_id)
        .bind(viewer.is_admin)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self, thread_id: Id, now: DateTime<Utc>) -> Result<(), ContactError> {
        let result =
            sqlx::query("UPDATE contact_threads SET status = 'closed', updated_at = ? WHERE id = ?")
                .bind(to_rfc3339(now))
                .bind(thread_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(ContactError::NotFound);
        }
        Ok(())
    }
}

fn push_thread_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    viewer: Viewer,
    filter: &ThreadFilter,
    pattern: Option<&str>,
) {
    push_visibility(builder, viewer);
    if let Some(status) = filter.status {
        builder.push(" AND t.status = ").push_bind(status.as_str());
    }
    if let Some(pattern) = pattern {
        push_search(builder, pattern, &["t.subject", "u.name"]);
    }
}
