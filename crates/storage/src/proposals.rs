use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{query::Query, sqlite::SqliteArguments, QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use cabinet_portal_core::pagination::like_pattern;
use cabinet_portal_core::types::{CustomerRef, Id, ManufacturerVersion, Proposal, ProposalKind};
use cabinet_portal_core::{GroupScope, Page, PageRequest, ProposalStatus};

use crate::{is_foreign_key_violation, push_scope, push_search, to_rfc3339};

const PROPOSAL_SELECT: &str = "SELECT p.id, p.customer_id, p.owner_group_id, p.created_by, \
    p.title, p.description, p.designer, p.sales_rep, p.lead_source, p.kind, p.status, p.date, \
    p.follow_up_dates_json, p.manufacturers_data_json, p.grand_total_cents, p.sent_at, \
    p.accepted_at, p.accepted_by, p.expires_at, p.created_at, p.updated_at, \
    c.name AS customer_name, c.email AS customer_email \
    FROM proposals p LEFT JOIN customers c ON c.id = p.customer_id";

const SEARCHABLE: &[&str] = &[
    "p.title",
    "p.description",
    "p.designer",
    "p.sales_rep",
    "c.name",
    "c.email",
];

/// Filters accepted by the proposal and order lists.
#[derive(Debug, Clone, Default)]
pub struct ProposalFilter {
    pub status: Option<ProposalStatus>,
    pub kind: Option<ProposalKind>,
    pub search: Option<String>,
}

/// Parameters required to insert a proposal.
#[derive(Debug, Clone)]
pub struct NewProposal {
    pub customer_id: Option<Id>,
    pub owner_group_id: Option<Id>,
    pub created_by: Option<Id>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub designer: Option<String>,
    pub sales_rep: Option<String>,
    pub lead_source: Option<String>,
    pub status: ProposalStatus,
    pub date: Option<NaiveDate>,
    pub follow_up_dates: Vec<NaiveDate>,
    pub manufacturers_data: Vec<ManufacturerVersion>,
    pub grand_total_cents: i64,
    pub sent_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A status change the caller already validated against the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: ProposalStatus,
    pub to: ProposalStatus,
}

/// Editable proposal fields. Status changes go through [`ProposalRepository::set_status`].
#[derive(Debug, Clone)]
pub struct ProposalUpdate {
    pub customer_id: Option<Id>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub designer: Option<String>,
    pub sales_rep: Option<String>,
    pub lead_source: Option<String>,
    pub date: Option<NaiveDate>,
    pub follow_up_dates: Vec<NaiveDate>,
    pub manufacturers_data: Vec<ManufacturerVersion>,
    pub grand_total_cents: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Dashboard counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProposalCounts {
    pub total: i64,
    pub draft: i64,
    pub sent: i64,
    pub accepted: i64,
    pub rejected: i64,
    pub expired: i64,
    pub orders: i64,
}

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("proposal not found")]
    NotFound,
    #[error("proposal has been accepted and can no longer be modified")]
    Locked,
    #[error("proposal is {actual}, expected {expected}")]
    StatusConflict {
        expected: ProposalStatus,
        actual: ProposalStatus,
    },
    #[error("referenced customer does not exist")]
    MissingCustomer,
    #[error("failed to encode or decode proposal data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for ProposalError {
    fn from(err: sqlx::Error) -> Self {
        if is_foreign_key_violation(&err) {
            Self::MissingCustomer
        } else {
            Self::Database(err)
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProposalRow {
    id: i64,
    customer_id: Option<i64>,
    owner_group_id: Option<i64>,
    created_by: Option<i64>,
    title: Option<String>,
    description: Option<String>,
    designer: Option<String>,
    sales_rep: Option<String>,
    lead_source: Option<String>,
    kind: String,
    status: String,
    date: Option<NaiveDate>,
    follow_up_dates_json: String,
    manufacturers_data_json: String,
    grand_total_cents: i64,
    sent_at: Option<DateTime<Utc>>,
    accepted_at: Option<DateTime<Utc>>,
    accepted_by: Option<i64>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    customer_name: Option<String>,
    customer_email: Option<String>,
}

impl ProposalRow {
    fn into_domain(self) -> Result<Proposal, ProposalError> {
        let customer = match (self.customer_id, self.customer_name) {
            (Some(id), Some(name)) => Some(CustomerRef {
                id,
                name,
                email: self.customer_email,
            }),
            _ => None,
        };
        Ok(Proposal {
            id: self.id,
            customer_id: self.customer_id,
            owner_group_id: self.owner_group_id,
            created_by: self.created_by,
            title: self.title,
            description: self.description,
            designer: self.designer,
            sales_rep: self.sales_rep,
            lead_source: self.lead_source,
            kind: ProposalKind::parse(&self.kind).unwrap_or(ProposalKind::Quote),
            status: ProposalStatus::parse(&self.status).unwrap_or(ProposalStatus::Draft),
            date: self.date,
            follow_up_dates: serde_json::from_str(&self.follow_up_dates_json)?,
            manufacturers_data: serde_json::from_str(&self.manufacturers_data_json)?,
            grand_total_cents: self.grand_total_cents,
            sent_at: self.sent_at,
            accepted_at: self.accepted_at,
            accepted_by: self.accepted_by,
            expires_at: self.expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            customer,
        })
    }
}

fn collect(rows: Vec<ProposalRow>) -> Result<Vec<Proposal>, ProposalError> {
    rows.into_iter().map(ProposalRow::into_domain).collect()
}

/// Repository for proposals and orders.
#[derive(Clone)]
pub struct ProposalRepository {
    pool: SqlitePool,
}

impl ProposalRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewProposal) -> Result<Proposal, ProposalError> {
        let now = to_rfc3339(new.created_at);
        let id = sqlx::query(
            "INSERT INTO proposals (customer_id, owner_group_id, created_by, title, description, designer, \
             sales_rep, lead_source, kind, status, date, follow_up_dates_json, manufacturers_data_json, \
             grand_total_cents, sent_at, expires_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.customer_id)
        .bind(new.owner_group_id)
        .bind(new.created_by)
        .bind(&new.title)
        .bind(&new.description)
        .bind(&new.designer)
        .bind(&new.sales_rep)
        .bind(&new.lead_source)
        .bind(ProposalKind::Quote.as_str())
        .bind(new.status.as_str())
        .bind(new.date)
        .bind(serde_json::to_string(&new.follow_up_dates)?)
        .bind(serde_json::to_string(&new.manufacturers_data)?)
        .bind(new.grand_total_cents)
        .bind(new.sent_at.map(to_rfc3339))
        .bind(new.expires_at.map(to_rfc3339))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.find(id).await?.ok_or(ProposalError::NotFound)
    }

    /// Loads a live proposal with its customer. Ownership is checked by the caller.
    pub async fn find(&self, id: Id) -> Result<Option<Proposal>, ProposalError> {
        let row = sqlx::query_as::<_, ProposalRow>(&format!(
            "{PROPOSAL_SELECT} WHERE p.id = ? AND p.is_deleted = 0"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProposalRow::into_domain).transpose()
    }

    /// Lists proposals visible in `scope`, most recently updated first.
    pub async fn list(
        &self,
        scope: GroupScope,
        request: PageRequest,
        filter: &ProposalFilter,
    ) -> Result<Page<Proposal>, ProposalError> {
        let pattern = like_pattern(filter.search.as_deref());

        let mut count = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM proposals p LEFT JOIN customers c ON c.id = p.customer_id \
             WHERE p.is_deleted = 0",
        );
        push_filters(&mut count, scope, filter, pattern.as_deref());
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        let request = request.clamped(total as u64);

        let mut query = QueryBuilder::<Sqlite>::new(format!("{PROPOSAL_SELECT} WHERE p.is_deleted = 0"));
        push_filters(&mut query, scope, filter, pattern.as_deref());
        query
            .push(" ORDER BY p.updated_at DESC, p.id DESC LIMIT ")
            .push_bind(request.limit as i64)
            .push(" OFFSET ")
            .push_bind(request.offset());
        let rows: Vec<ProposalRow> = query.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page::new(collect(rows)?, request, total as u64))
    }

    /// Most recently updated proposals for the dashboard.
    pub async fn latest(&self, scope: GroupScope, limit: u32) -> Result<Vec<Proposal>, ProposalError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!("{PROPOSAL_SELECT} WHERE p.is_deleted = 0"));
        push_scope(&mut query, scope, "p.owner_group_id");
        query
            .push(" ORDER BY p.updated_at DESC, p.id DESC LIMIT ")
            .push_bind(limit as i64);
        let rows: Vec<ProposalRow> = query.build_query_as().fetch_all(&self.pool).await?;
        collect(rows)
    }

    pub async fn counts(&self, scope: GroupScope) -> Result<ProposalCounts, ProposalError> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT p.status, p.kind, COUNT(*) FROM proposals p WHERE p.is_deleted = 0",
        );
        push_scope(&mut query, scope, "p.owner_group_id");
        query.push(" GROUP BY p.status, p.kind");
        let rows: Vec<(String, String, i64)> = query.build_query_as().fetch_all(&self.pool).await?;

        let mut counts = ProposalCounts::default();
        for (status, kind, count) in rows {
            counts.total += count;
            if ProposalKind::parse(&kind) == Some(ProposalKind::Order) {
                counts.orders += count;
            }
            match ProposalStatus::parse(&status).unwrap_or(ProposalStatus::Draft) {
                ProposalStatus::Draft => counts.draft += count,
                ProposalStatus::Sent => counts.sent += count,
                ProposalStatus::Accepted => counts.accepted += count,
                ProposalStatus::Rejected => counts.rejected += count,
                ProposalStatus::Expired => counts.expired += count,
            }
        }
        Ok(counts)
    }

    /// Replaces the editable fields and, when `status` is given, moves the status in the
    /// same transaction. Accepted proposals are rejected with [`ProposalError::Locked`].
    pub async fn update(
        &self,
        id: Id,
        update: &ProposalUpdate,
        status: Option<StatusTransition>,
        now: DateTime<Utc>,
    ) -> Result<Proposal, ProposalError> {
        let now = to_rfc3339(now);
        let follow_up_dates = serde_json::to_string(&update.follow_up_dates)?;
        let manufacturers_data = serde_json::to_string(&update.manufacturers_data)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE proposals SET customer_id = ?, title = ?, description = ?, designer = ?, sales_rep = ?, \
             lead_source = ?, date = ?, follow_up_dates_json = ?, manufacturers_data_json = ?, \
             grand_total_cents = ?, expires_at = ?, updated_at = ? \
             WHERE id = ? AND is_deleted = 0 AND accepted_at IS NULL AND status != 'accepted'",
        )
        .bind(update.customer_id)
        .bind(&update.title)
        .bind(&update.description)
        .bind(&update.designer)
        .bind(&update.sales_rep)
        .bind(&update.lead_source)
        .bind(update.date)
        .bind(follow_up_dates)
        .bind(manufacturers_data)
        .bind(update.grand_total_cents)
        .bind(update.expires_at.map(to_rfc3339))
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.guard_failure(id, None).await);
        }

        if let Some(change) = status {
            let moved = status_query(change, &now, id).execute(&mut *tx).await?;
            if moved.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(self.guard_failure(id, Some(change.from)).await);
            }
        }
        tx.commit().await?;

        self.find(id).await?.ok_or(ProposalError::NotFound)
    }

    /// Writes a new status if the proposal is still in `change.from`. `sent_at` is only
    /// recorded the first time a proposal is sent.
    pub async fn set_status(
        &self,
        id: Id,
        change: StatusTransition,
        now: DateTime<Utc>,
    ) -> Result<Proposal, ProposalError> {
        let now = to_rfc3339(now);
        let result = status_query(change, &now, id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(self.guard_failure(id, Some(change.from)).await);
        }
        self.find(id).await?.ok_or(ProposalError::NotFound)
    }

    /// Accepts the proposal and converts it into an order. Only the first call succeeds,
    /// and only while the proposal is still in `from`.
    pub async fn accept(
        &self,
        id: Id,
        from: ProposalStatus,
        accepted_by: Option<Id>,
        now: DateTime<Utc>,
    ) -> Result<Proposal, ProposalError> {
        let now = to_rfc3339(now);
        let result = sqlx::query(
            "UPDATE proposals SET status = 'accepted', kind = 'order', accepted_at = ?, accepted_by = ?, \
             sent_at = COALESCE(sent_at, ?), updated_at = ? \
             WHERE id = ? AND is_deleted = 0 AND accepted_at IS NULL AND status = ?",
        )
        .bind(&now)
        .bind(accepted_by)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.guard_failure(id, Some(from)).await);
        }
        self.find(id).await?.ok_or(ProposalError::NotFound)
    }

    /// Explains why a guarded write touched no rows.
    async fn guard_failure(&self, id: Id, expected: Option<ProposalStatus>) -> ProposalError {
        match self.find(id).await {
            Ok(None) => ProposalError::NotFound,
            Ok(Some(proposal)) if proposal.is_locked() => ProposalError::Locked,
            Ok(Some(proposal)) => match expected {
                Some(expected) if expected != proposal.status => ProposalError::StatusConflict {
                    expected,
                    actual: proposal.status,
                },
                _ => ProposalError::Locked,
            },
            Err(err) => err,
        }
    }

    pub async fn soft_delete(&self, id: Id, now: DateTime<Utc>) -> Result<(), ProposalError> {
        let result = sqlx::query(
            "UPDATE proposals SET is_deleted = 1, updated_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ProposalError::NotFound);
        }
        Ok(())
    }

    /// Moves up to `limit` sent proposals past their `expires_at` to expired and
    /// returns their ids.
    pub async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Id>, sqlx::Error> {
        let now = to_rfc3339(now);
        sqlx::query_scalar(
            "UPDATE proposals SET status = 'expired', updated_at = ? \
             WHERE id IN (SELECT id FROM proposals WHERE status = 'sent' AND is_deleted = 0 \
                          AND expires_at IS NOT NULL AND expires_at < ? ORDER BY expires_at LIMIT ?) \
             RETURNING id",
        )
        .bind(&now)
        .bind(&now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}

fn status_query<'q>(
    change: StatusTransition,
    now: &'q str,
    id: Id,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let sent_at = (change.to == ProposalStatus::Sent).then_some(now);
    sqlx::query(
        "UPDATE proposals SET status = ?, sent_at = COALESCE(sent_at, ?), updated_at = ? \
         WHERE id = ? AND is_deleted = 0 AND accepted_at IS NULL AND status = ?",
    )
    .bind(change.to.as_str())
    .bind(sent_at)
    .bind(now)
    .bind(id)
    .bind(change.from.as_str())
}

fn push_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    scope: GroupScope,
    filter: &ProposalFilter,
    pattern: Option<&str>,
) {
    push_scope(builder, scope, "p.owner_group_id");
    if let Some(status) = filter.status {
        builder.push(" AND p.status = ").push_bind(status.as_str());
    }
    if let Some(kind) = filter.kind {
        builder.push(" AND p.kind = ").push_bind(kind.as_str());
    }
    if let Some(pattern) = pattern {
        push_search(builder, pattern, SEARCHABLE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_group, setup_db};
    use chrono::Duration;
    use cabinet_portal_core::types::{CustomerInput, LineItem};

    fn moving(from: ProposalStatus, to: ProposalStatus) -> StatusTransition {
        StatusTransition { from, to }
    }

    fn edit(title: &str) -> ProposalUpdate {
        ProposalUpdate {
            customer_id: None,
            title: Some(title.into()),
            description: None,
            designer: None,
            sales_rep: None,
            lead_source: None,
            date: None,
            follow_up_dates: Vec::new(),
            manufacturers_data: Vec::new(),
            grand_total_cents: 0,
            expires_at: None,
        }
    }

    fn new_proposal(owner: Option<Id>, customer_id: Option<Id>) -> NewProposal {
        NewProposal {
            customer_id,
            owner_group_id: owner,
            created_by: None,
            title: Some("Kitchen remodel".into()),
            description: None,
            designer: None,
            sales_rep: Some("Sam".into()),
            lead_source: None,
            status: ProposalStatus::Draft,
            date: NaiveDate::from_ymd_opt(2024, 5, 1),
            follow_up_dates: Vec::new(),
            manufacturers_data: vec![ManufacturerVersion {
                manufacturer_id: 1,
                version_name: "Shaker".into(),
                selected_style: Some("Shaker White".into()),
                is_assembled: true,
                discount_percent: 0.0,
                items: vec![LineItem {
                    code: "B12".into(),
                    description: None,
                    qty: 2,
                    price: 100.0,
                    include_assembly_fee: true,
                    assembly_cost: None,
                    modifications: Vec::new(),
                }],
                custom_items: Vec::new(),
                summary: None,
            }],
            grand_total_cents: 20_000,
            sent_at: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_round_trips_line_items_and_customer() {
        let db = setup_db().await;
        let customer = db
            .customers()
            .create(
                &CustomerInput {
                    name: "Jane".into(),
                    email: Some("jane@example.com".into()),
                    ..CustomerInput::default()
                },
                None,
                None,
                Utc::now(),
            )
            .await
            .expect("customer");

        let proposal = db
            .proposals()
            .create(&new_proposal(None, Some(customer.id)))
            .await
            .expect("create");
        assert_eq!(proposal.kind, ProposalKind::Quote);
        assert_eq!(proposal.status, ProposalStatus::Draft);
        assert_eq!(proposal.manufacturers_data[0].items[0].qty, 2);
        assert_eq!(proposal.customer.as_ref().map(|c| c.name.as_str()), Some("Jane"));
        assert_eq!(proposal.date, NaiveDate::from_ymd_opt(2024, 5, 1));
    }

    #[tokio::test]
    async fn unknown_customer_is_reported() {
        let db = setup_db().await;
        let err = db
            .proposals()
            .create(&new_proposal(None, Some(404)))
            .await
            .expect_err("fk");
        assert!(matches!(err, ProposalError::MissingCustomer));
    }

    #[tokio::test]
    async fn list_filters_by_scope_status_and_search() {
        let db = setup_db().await;
        let group = insert_group(&db, "Acme", "contractor").await;
        let repo = db.proposals();
        let mine = repo.create(&new_proposal(Some(group), None)).await.expect("mine");
        let mut other = new_proposal(None, None);
        other.title = Some("Bathroom vanity".into());
        repo.create(&other).await.expect("other");
        repo.set_status(mine.id, moving(ProposalStatus::Draft, ProposalStatus::Sent), Utc::now())
            .await
            .expect("send");

        let scoped = repo
            .list(GroupScope::Group(group), PageRequest::default(), &ProposalFilter::default())
            .await
            .expect("scoped");
        assert_eq!(scoped.pagination.total, 1);
        assert_eq!(scoped.data[0].id, mine.id);

        let sent = repo
            .list(
                GroupScope::All,
                PageRequest::default(),
                &ProposalFilter {
                    status: Some(ProposalStatus::Sent),
                    ..ProposalFilter::default()
                },
            )
            .await
            .expect("sent");
        assert_eq!(sent.pagination.total, 1);

        let search = repo
            .list(
                GroupScope::All,
                PageRequest::default(),
                &ProposalFilter {
                    search: Some("VANITY".into()),
                    ..ProposalFilter::default()
                },
            )
            .await
            .expect("search");
        assert_eq!(search.pagination.total, 1);
        assert_eq!(search.data[0].title.as_deref(), Some("Bathroom vanity"));
    }

    #[tokio::test]
    async fn accept_locks_and_converts_to_order() {
        let db = setup_db().await;
        let repo = db.proposals();
        let proposal = repo.create(&new_proposal(None, None)).await.expect("create");
        repo.set_status(proposal.id, moving(ProposalStatus::Draft, ProposalStatus::Sent), Utc::now())
            .await
            .expect("send");

        let accepted = repo
            .accept(proposal.id, ProposalStatus::Sent, None, Utc::now())
            .await
            .expect("accept");
        assert_eq!(accepted.status, ProposalStatus::Accepted);
        assert_eq!(accepted.kind, ProposalKind::Order);
        assert!(accepted.is_locked());

        assert!(matches!(
            repo.accept(proposal.id, ProposalStatus::Sent, None, Utc::now()).await,
            Err(ProposalError::Locked)
        ));
        let update = edit("changed");
        assert!(matches!(
            repo.update(proposal.id, &update, None, Utc::now()).await,
            Err(ProposalError::Locked)
        ));
        assert!(matches!(
            repo.update(9_999, &update, None, Utc::now()).await,
            Err(ProposalError::NotFound)
        ));

        let counts = repo.counts(GroupScope::All).await.expect("counts");
        assert_eq!(counts.total, 1);
        assert_eq!(counts.accepted, 1);
        assert_eq!(counts.orders, 1);
    }

    #[tokio::test]
    async fn stale_status_writes_are_refused() {
        let db = setup_db().await;
        let repo = db.proposals();
        let proposal = repo.create(&new_proposal(None, None)).await.expect("create");
        repo.set_status(proposal.id, moving(ProposalStatus::Draft, ProposalStatus::Rejected), Utc::now())
            .await
            .expect("reject");

        let err = repo
            .set_status(proposal.id, moving(ProposalStatus::Draft, ProposalStatus::Sent), Utc::now())
            .await
            .expect_err("stale");
        assert!(matches!(
            err,
            ProposalError::StatusConflict {
                expected: ProposalStatus::Draft,
                actual: ProposalStatus::Rejected,
            }
        ));
        assert!(matches!(
            repo.accept(proposal.id, ProposalStatus::Draft, None, Utc::now()).await,
            Err(ProposalError::StatusConflict { .. })
        ));
        let reloaded = repo.find(proposal.id).await.expect("find").expect("exists");
        assert_eq!(reloaded.status, ProposalStatus::Rejected);
        assert!(reloaded.accepted_at.is_none());
    }

    #[tokio::test]
    async fn update_with_stale_status_rolls_back_fields() {
        let db = setup_db().await;
        let repo = db.proposals();
        let proposal = repo.create(&new_proposal(None, None)).await.expect("create");

        let err = repo
            .update(
                proposal.id,
                &edit("Changed"),
                Some(moving(ProposalStatus::Sent, ProposalStatus::Expired)),
                Utc::now(),
            )
            .await
            .expect_err("stale");
        assert!(matches!(err, ProposalError::StatusConflict { .. }));
        let reloaded = repo.find(proposal.id).await.expect("find").expect("exists");
        assert_eq!(reloaded.title.as_deref(), Some("Kitchen remodel"));

        let sent = repo
            .update(
                proposal.id,
                &edit("Changed"),
                Some(moving(ProposalStatus::Draft, ProposalStatus::Sent)),
                Utc::now(),
            )
            .await
            .expect("update and send");
        assert_eq!(sent.title.as_deref(), Some("Changed"));
        assert_eq!(sent.status, ProposalStatus::Sent);
        assert!(sent.sent_at.is_some());
    }

    #[tokio::test]
    async fn sent_at_is_kept_from_first_send() {
        let db = setup_db().await;
        let repo = db.proposals();
        let proposal = repo.create(&new_proposal(None, None)).await.expect("create");
        let first = Utc::now() - Duration::days(2);
        let sent = repo
            .set_status(proposal.id, moving(ProposalStatus::Draft, ProposalStatus::Sent), first)
            .await
            .expect("send");
        repo.set_status(proposal.id, moving(ProposalStatus::Sent, ProposalStatus::Draft), Utc::now())
            .await
            .expect("back to draft");
        let resent = repo
            .set_status(proposal.id, moving(ProposalStatus::Draft, ProposalStatus::Sent), Utc::now())
            .await
            .expect("resend");
        assert_eq!(resent.sent_at, sent.sent_at);
    }

    #[tokio::test]
    async fn expire_overdue_only_touches_sent_proposals() {
        let db = setup_db().await;
        let repo = db.proposals();
        let now = Utc::now();

        let mut overdue = new_proposal(None, None);
        overdue.status = ProposalStatus::Sent;
        overdue.expires_at = Some(now - Duration::days(1));
        let overdue = repo.create(&overdue).await.expect("overdue");

        let mut draft = new_proposal(None, None);
        draft.expires_at = Some(now - Duration::days(1));
        repo.create(&draft).await.expect("draft");

        let mut future = new_proposal(None, None);
        future.status = ProposalStatus::Sent;
        future.expires_at = Some(now + Duration::days(1));
        repo.create(&future).await.expect("future");

        let expired = repo.expire_overdue(now, 100).await.expect("expire");
        assert_eq!(expired, vec![overdue.id]);
        let reloaded = repo.find(overdue.id).await.expect("find").expect("exists");
        assert_eq!(reloaded.status, ProposalStatus::Expired);
    }

    #[tokio::test]
    async fn latest_orders_by_update_time() {
        let db = setup_db().await;
        let repo = db.proposals();
        let first = repo.create(&new_proposal(None, None)).await.expect("first");
        let second = repo.create(&new_proposal(None, None)).await.expect("second");
        repo.set_status(
            first.id,
            moving(ProposalStatus::Draft, ProposalStatus::Sent),
            Utc::now() + Duration::minutes(5),
        )
            .await
            .expect("touch first");

        let latest = repo.latest(GroupScope::All, 10).await.expect("latest");
        let ids: Vec<_> = latest.iter().map(|proposal| proposal.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);

        repo.soft_delete(second.id, Utc::now()).await.expect("delete");
        assert_eq!(repo.latest(GroupScope::All, 10).await.expect("latest").len(), 1);
    }
}
