use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use cabinet_portal_core::types::{Id, NewNotification, Notification, NotificationPriority};
use cabinet_portal_core::{Page, PageRequest};

use crate::to_rfc3339;

const NOTIFICATION_COLUMNS: &str = "id, recipient_user_id, type, title, message, payload_json, \
    priority, action_url, is_read, read_at, created_by, created_at";

#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub unread_only: bool,
    pub read_only: bool,
    pub kind: Option<String>,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification not found")]
    NotFound,
    #[error("failed to encode notification payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: i64,
    recipient_user_id: i64,
    #[sqlx(rename = "type")]
    kind: String,
    title: String,
    message: String,
    payload_json: Option<String>,
    priority: String,
    action_url: Option<String>,
    is_read: bool,
    read_at: Option<DateTime<Utc>>,
    created_by: Option<i64>,
    created_at: DateTime<Utc>,
}

impl NotificationRow {
    fn into_domain(self) -> Result<Notification, NotificationError> {
        let payload = match self.payload_json {
            Some(raw) => Some(serde_json::from_str::<Value>(&raw)?),
            None => None,
        };
        Ok(Notification {
            id: self.id,
            recipient_user_id: self.recipient_user_id,
            kind: self.kind,
            title: self.title,
            message: self.message,
            payload,
            priority: NotificationPriority::parse(&self.priority),
            action_url: self.action_url,
            is_read: self.is_read,
            read_at: self.read_at,
            created_by: self.created_by,
            created_at: self.created_at,
        })
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, recipient: Id, filter: &NotificationFilter) {
    builder.push(" WHERE recipient_user_id = ").push_bind(recipient);
    if filter.unread_only {
        builder.push(" AND is_read = 0");
    } else if filter.read_only {
        builder.push(" AND is_read = 1");
    }
    if let Some(kind) = filter.kind.as_deref().filter(|kind| !kind.is_empty()) {
        builder.push(" AND type = ").push_bind(kind.to_string());
    }
}

/// Repository for per-recipient notifications.
#[derive(Clone)]
pub struct NotificationRepository {
    pool: SqlitePool,
}

impl NotificationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fans a notification out to every recipient.
    ///
    /// When `dedupe_key` is set a recipient who already received the same key is
    /// skipped. Only the rows actually inserted are returned.
    pub async fn create_for(
        &self,
        recipients: &[Id],
        notification: &NewNotification,
        dedupe_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>, NotificationError> {
        let payload = notification
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = to_rfc3339(now);

        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let row = sqlx::query_as::<_, NotificationRow>(&format!(
                "INSERT INTO notifications (recipient_user_id, type, title, message, payload_json, \
                 priority, action_url, created_by, dedupe_key, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT DO NOTHING RETURNING {NOTIFICATION_COLUMNS}"
            ))
            .bind(recipient)
            .bind(&notification.kind)
            .bind(&notification.title)
            .bind(&notification.message)
            .bind(&payload)
            .bind(notification.priority.as_str())
            .bind(&notification.action_url)
            .bind(notification.created_by)
            .bind(dedupe_key)
            .bind(&now)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = row {
                created.push(row.into_domain()?);
            }
        }
        tx.commit().await?;
        Ok(created)
    }

    /// Newest first.
    pub async fn list(
        &self,
        recipient: Id,
        request: PageRequest,
        filter: &NotificationFilter,
    ) -> Result<Page<Notification>, NotificationError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM notifications");
        push_filters(&mut count, recipient, filter);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        let request = request.clamped(total as u64);

        let mut query =
            QueryBuilder::<Sqlite>::new(format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications"));
        push_filters(&mut query, recipient, filter);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(request.limit as i64)
            .push(" OFFSET ")
            .push_bind(request.offset());
        let rows: Vec<NotificationRow> = query.build_query_as().fetch_all(&self.pool).await?;

        let data = rows
            .into_iter()
            .map(NotificationRow::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(data, request, total as u64))
    }

    pub async fn unread_count(&self, recipient: Id) -> Result<i64, NotificationError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM notifications WHERE recipient_user_id = ? AND is_read = 0",
        )
        .bind(recipient)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Marks one of the recipient's notifications as read. Already read rows keep their `read_at`.
    pub async fn mark_read(
        &self,
        id: Id,
        recipient: Id,
        now: DateTime<Utc>,
    ) -> Result<Notification, NotificationError> {
        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            "UPDATE notifications SET is_read = 1, read_at = COALESCE(read_at, ?) \
             WHERE id = ? AND recipient_user_id = ? RETURNING {NOTIFICATION_COLUMNS}"
        ))
        .bind(to_rfc3339(now))
        .bind(id)
        .bind(recipient)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(NotificationError::NotFound)?.into_domain()
    }

    pub async fn mark_all_read(
        &self,
        recipient: Id,
        now: DateTime<Utc>,
    ) -> Result<u64, NotificationError> {
        let result = sqlx::query(
            "UPDATE notifications SET is_read = 1, read_at = ? \
             WHERE recipient_user_id = ? AND is_read = 0",
        )
        .bind(to_rfc3339(now))
        .bind(recipient)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deletes up to `limit` read notifications created before `threshold`.
    pub async fn delete_read_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM notifications WHERE id IN (\
             SELECT id FROM notifications WHERE is_read = 1 AND created_at < ? \
             ORDER BY created_at ASC LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
