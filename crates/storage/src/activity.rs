use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;

use cabinet_portal_core::types::{ActivityEntry, Id};

use crate::to_rfc3339;

#[derive(Debug, Clone)]
pub struct NewActivity<'a> {
    pub actor_id: Option<Id>,
    pub action: &'a str,
    pub target_type: &'a str,
    pub target_id: Option<Id>,
    pub diff: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("failed to encode activity diff: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct ActivityRow {
    id: i64,
    actor_id: Option<i64>,
    action: String,
    target_type: String,
    target_id: Option<i64>,
    diff_json: Option<String>,
    created_at: DateTime<Utc>,
}

impl ActivityRow {
    fn into_domain(self) -> Result<ActivityEntry, ActivityError> {
        Ok(ActivityEntry {
            id: self.id,
            actor_id: self.actor_id,
            action: self.action,
            target_type: self.target_type,
            target_id: self.target_id,
            diff: self.diff_json.as_deref().map(serde_json::from_str).transpose()?,
            created_at: self.created_at,
        })
    }
}

/// Append-only audit log.
#[derive(Clone)]
pub struct ActivityRepository {
    pool: SqlitePool,
}

impl ActivityRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: NewActivity<'_>) -> Result<Id, ActivityError> {
        let diff = entry.diff.as_ref().map(serde_json::to_string).transpose()?;
        let id = sqlx::query(
            "INSERT INTO activity_log (actor_id, action, target_type, target_id, diff_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.actor_id)
        .bind(entry.action)
        .bind(entry.target_type)
        .bind(entry.target_id)
        .bind(diff)
        .bind(to_rfc3339(entry.created_at))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Entries for one target, oldest first.
    pub async fn list_for_target(
        &self,
        target_type: &str,
        target_id: Id,
    ) -> Result<Vec<ActivityEntry>, ActivityError> {
        let rows = sqlx::query_as::<_, ActivityRow>(
            "SELECT id, actor_id, action, target_type, target_id, diff_json, created_at \
             FROM activity_log WHERE target_type = ? AND target_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(target_type)
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ActivityRow::into_domain).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::setup_db;

    #[tokio::test]
    async fn append_and_list_in_order() {
        let db = setup_db().await;
        let repo = db.activity();
        for action in ["proposal.sent", "proposal.accepted"] {
            repo.append(NewActivity {
                actor_id: Some(1),
                action,
                target_type: "proposal",
                target_id: Some(9),
                diff: Some(json!({ "action": action })),
                created_at: Utc::now(),
            })
            .await
            .expect("append");
        }
        repo.append(NewActivity {
            actor_id: None,
            action: "proposal.accepted",
            target_type: "proposal",
            target_id: Some(10),
            diff: None,
            created_at: Utc::now(),
        })
        .await
        .expect("append other");

        let entries = repo.list_for_target("proposal", 9).await.expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "proposal.sent");
        assert_eq!(entries[1].diff, Some(json!({ "action": "proposal.accepted" })));
    }
}
