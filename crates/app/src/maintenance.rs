use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use serde_json::json;
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use cabinet_portal_core::ProposalStatus;
use cabinet_portal_storage::{is_busy, Database, NewActivity};
use cabinet_portal_util::MaintenanceConfig;

use crate::events::{EventHub, PortalEvent};

const BATCH_LIMIT: i64 = 500;

/// Background worker that expires overdue proposals, prunes old read
/// notifications and truncates the WAL.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    events: EventHub,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    interval: Duration,
    retention: ChronoDuration,
}

impl MaintenanceWorker {
    pub fn new(database: Database, events: EventHub, config: MaintenanceConfig) -> Self {
        Self {
            database,
            events,
            clock: Arc::new(Utc::now),
            interval: config.interval,
            retention: ChronoDuration::days(i64::from(config.notification_retention_days)),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "maintenance", error = %err, "maintenance run failed");
            }
        }
    }

    /// One full cycle: proposal expiry, notification pruning, checkpoint.
    pub async fn run_once(&self) -> Result<MaintenanceReport, MaintenanceError> {
        let now = (self.clock)();
        let mut report = MaintenanceReport::default();

        let (expired, expire_busy) = self.expire_proposals(now).await?;
        report.expired_proposals = expired;
        report.busy |= expire_busy;

        let threshold = now - self.retention;
        let (pruned, prune_busy) = self.prune_notifications(threshold).await?;
        report.pruned_notifications = pruned;
        report.busy |= prune_busy;
        info!(
            stage = "maintenance",
            expired,
            pruned,
            threshold = %threshold.to_rfc3339(),
            "maintenance sweep completed"
        );

        report.checkpoint_busy = self.run_checkpoint().await?;
        Ok(report)
    }

    async fn expire_proposals(&self, now: DateTime<Utc>) -> Result<(u64, bool), MaintenanceError> {
        let proposals = self.database.proposals();
        let mut total = 0u64;
        loop {
            let ids = match proposals.expire_overdue(now, BATCH_LIMIT).await {
                Ok(ids) => ids,
                Err(err) if is_busy(&err) => {
                    counter!("db_busy_total", "op" => "expire").increment(1);
                    warn!(stage = "maintenance", error = %err, "proposal expiry hit busy timeout");
                    return Ok((total, true));
                }
                Err(err) => return Err(MaintenanceError::Expire { source: err }),
            };
            if ids.is_empty() {
                break;
            }
            total += ids.len() as u64;
            counter!("maintenance_rows_total", "task" => "expire_proposals").increment(ids.len() as u64);
            counter!("proposal_transitions_total", "to" => ProposalStatus::Expired.as_str())
                .increment(ids.len() as u64);

            for id in &ids {
                self.announce_expiry(*id, now).await;
            }
            if (ids.len() as i64) < BATCH_LIMIT {
                break;
            }
        }
        Ok((total, false))
    }

    /// Publishes the status change and writes the audit entry for one expired proposal.
    async fn announce_expiry(&self, proposal_id: i64, now: DateTime<Utc>) {
        let owner_group_id = match self.database.proposals().find(proposal_id).await {
            Ok(found) => found.and_then(|proposal| proposal.owner_group_id),
            Err(err) => {
                warn!(stage = "maintenance", proposal_id, error = %err, "failed to reload expired proposal");
                None
            }
        };
        self.events.publish(PortalEvent::ProposalStatusChanged {
            proposal_id,
            owner_group_id,
            from: ProposalStatus::Sent,
            to: ProposalStatus::Expired,
            at: now,
        });
        let entry = NewActivity {
            actor_id: None,
            action: "proposal.status",
            target_type: "proposal",
            target_id: Some(proposal_id),
            diff: Some(json!({ "from": ProposalStatus::Sent, "to": ProposalStatus::Expired })),
            created_at: now,
        };
        if let Err(err) = self.database.activity().append(entry).await {
            warn!(stage = "maintenance", proposal_id, error = %err, "failed to record expiry");
        }
    }

    async fn prune_notifications(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<(u64, bool), MaintenanceError> {
        let notifications = self.database.notifications();
        let mut total = 0u64;
        loop {
            match notifications
                .delete_read_older_than_batch(threshold, BATCH_LIMIT)
                .await
            {
                Ok(0) => break,
                Ok(deleted) => {
                    total += deleted;
                    counter!("maintenance_rows_total", "task" => "prune_notifications").increment(deleted);
                }
                Err(err) if is_busy(&err) => {
                    counter!("db_busy_total", "op" => "prune").increment(1);
                    warn!(stage = "maintenance", error = %err, "notification prune hit busy timeout");
                    return Ok((total, true));
                }
                Err(err) => return Err(MaintenanceError::Prune { source: err }),
            }
        }
        Ok((total, false))
    }

    /// Returns `true` when the checkpoint could not finish because of readers.
    async fn run_checkpoint(&self) -> Result<bool, MaintenanceError> {
        let start = std::time::Instant::now();
        match self.database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                let busy = stats.busy_frames > 0;
                if busy {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "maintenance",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    info!(
                        stage = "maintenance",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
                Ok(busy)
            }
            Err(err) if is_busy(&err) => {
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "maintenance", error = %err, "WAL checkpoint hit busy timeout");
                Ok(true)
            }
            Err(err) => Err(MaintenanceError::Checkpoint { source: err }),
        }
    }
}

/// What a single maintenance cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_proposals: u64,
    pub pruned_notifications: u64,
    pub busy: bool,
    pub checkpoint_busy: bool,
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to expire overdue proposals")]
    Expire {
        #[source]
        source: SqlxError,
    },
    #[error("failed to prune read notifications")]
    Prune {
        #[source]
        source: SqlxError,
    },
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use tokio::time::timeout;

    use cabinet_portal_core::types::{NewNotification, NotificationPriority, Role};
    use cabinet_portal_storage::{NewProposal, NewUser};

    use super::*;
    use crate::telemetry;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn sent_proposal(expires_at: DateTime<Utc>, created_at: DateTime<Utc>) -> NewProposal {
        NewProposal {
            customer_id: None,
            owner_group_id: None,
            created_by: None,
            title: Some("Kitchen".into()),
            description: None,
            designer: None,
            sales_rep: None,
            lead_source: None,
            status: ProposalStatus::Sent,
            date: None,
            follow_up_dates: Vec::new(),
            manufacturers_data: Vec::new(),
            grand_total_cents: 0,
            sent_at: Some(created_at),
            expires_at: Some(expires_at),
            created_at,
        }
    }

    fn config() -> MaintenanceConfig {
        MaintenanceConfig {
            interval: Duration::from_secs(60),
            notification_retention_days: 30,
        }
    }

    #[tokio::test]
    async fn run_once_expires_proposals_and_prunes_notifications() {
        telemetry::init_metrics().expect("metrics");
        let db = setup_db().await;
        let now = Utc::now();
        let long_ago = now - ChronoDuration::days(60);

        let overdue = db
            .proposals()
            .create(&sent_proposal(now - ChronoDuration::days(1), long_ago))
            .await
            .expect("overdue");
        let current = db
            .proposals()
            .create(&sent_proposal(now + ChronoDuration::days(7), long_ago))
            .await
            .expect("current");

        let user = db
            .users()
            .create(NewUser {
                name: "Owner",
                email: "owner@example.com",
                password_hash: "hash",
                role: Role::User,
                group_id: None,
                created_at: long_ago,
            })
            .await
            .expect("user");
        let note = NewNotification {
            kind: "proposal.accepted".to_string(),
            title: "Old".to_string(),
            message: "Old news".to_string(),
            payload: None,
            priority: NotificationPriority::Low,
            action_url: None,
            created_by: None,
        };
        let notifications = db.notifications();
        notifications
            .create_for(&[user.id], &note, None, long_ago)
            .await
            .expect("old");
        notifications
            .mark_all_read(user.id, long_ago)
            .await
            .expect("mark read");
        notifications
            .create_for(&[user.id], &note, None, long_ago)
            .await
            .expect("old unread");

        let events = EventHub::new();
        let mut rx = events.subscribe();
        let worker = MaintenanceWorker::new(db.clone(), events.clone(), config())
            .with_clock(Arc::new(move || now));
        let report = worker.run_once().await.expect("run_once");

        assert_eq!(report.expired_proposals, 1);
        assert_eq!(report.pruned_notifications, 1);
        assert!(!report.busy);

        let expired = db.proposals().find(overdue.id).await.expect("find").expect("exists");
        assert_eq!(expired.status, ProposalStatus::Expired);
        let untouched = db.proposals().find(current.id).await.expect("find").expect("exists");
        assert_eq!(untouched.status, ProposalStatus::Sent);

        assert_eq!(notifications.unread_count(user.id).await.expect("count"), 1);

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event in time")
            .expect("event");
        match event {
            PortalEvent::ProposalStatusChanged { proposal_id, to, .. } => {
                assert_eq!(proposal_id, overdue.id);
                assert_eq!(to, ProposalStatus::Expired);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let history = db
            .activity()
            .list_for_target("proposal", overdue.id)
            .await
            .expect("activity");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, "proposal.status");

        let second = worker.run_once().await.expect("second run");
        assert_eq!(second.expired_proposals, 0);
        assert_eq!(second.pruned_notifications, 0);
    }
}
