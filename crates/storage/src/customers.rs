use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use cabinet_portal_core::pagination::like_pattern;
use cabinet_portal_core::types::{Customer, CustomerInput, CustomerListItem, Id};
use cabinet_portal_core::{GroupScope, Page, PageRequest, SortConfig, SortDirection};

use crate::{is_unique_violation, push_scope, push_search, to_rfc3339};

const CUSTOMER_COLUMNS: &str = "c.id, c.name, c.email, c.mobile, c.home_phone, c.address, \
    c.apt_or_suite, c.city, c.state, c.zip_code, c.company_name, c.customer_type, c.lead_source, \
    c.default_discount, c.note, c.group_id, c.created_at, c.updated_at";

const SORTABLE: &[(&str, &str)] = &[
    ("name", "c.name COLLATE NOCASE"),
    ("email", "c.email COLLATE NOCASE"),
    ("city", "c.city COLLATE NOCASE"),
    ("created_at", "c.created_at"),
    ("updated_at", "c.updated_at"),
    ("proposal_count", "proposal_count"),
];

const SEARCHABLE: &[&str] = &["c.name", "c.email", "c.mobile", "c.home_phone", "c.company_name"];

/// Query-string options of the customer list.
#[derive(Debug, Clone, Default)]
pub struct CustomerFilter {
    pub search: Option<String>,
    pub sort: Option<String>,
    pub dir: Option<String>,
}

#[derive(Debug, Error)]
pub enum CustomerError {
    #[error("customer not found")]
    NotFound,
    #[error("a customer with this email already exists")]
    DuplicateEmail,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for CustomerError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            Self::DuplicateEmail
        } else {
            Self::Database(err)
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: i64,
    name: String,
    email: Option<String>,
    mobile: Option<String>,
    home_phone: Option<String>,
    address: Option<String>,
    apt_or_suite: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<String>,
    company_name: Option<String>,
    customer_type: Option<String>,
    lead_source: Option<String>,
    default_discount: Option<f64>,
    note: Option<String>,
    group_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CustomerRow {
    fn into_domain(self) -> Customer {
        Customer {
            id: self.id,
            name: self.name,
            email: self.email,
            mobile: self.mobile,
            home_phone: self.home_phone,
            address: self.address,
            apt_or_suite: self.apt_or_suite,
            city: self.city,
            state: self.state,
            zip_code: self.zip_code,
            company_name: self.company_name,
            customer_type: self.customer_type,
            lead_source: self.lead_source,
            default_discount: self.default_discount,
            note: self.note,
            group_id: self.group_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CustomerListRow {
    #[sqlx(flatten)]
    customer: CustomerRow,
    proposal_count: i64,
}

/// Blank optional strings are stored as `NULL`.
fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Repository for end customers.
#[derive(Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        input: &CustomerInput,
        group_id: Option<Id>,
        created_by: Option<Id>,
        now: DateTime<Utc>,
    ) -> Result<Customer, CustomerError> {
        let now = to_rfc3339(now);
        let id = sqlx::query(
            "INSERT INTO customers (name, email, mobile, home_phone, address, apt_or_suite, city, state, \
             zip_code, company_name, customer_type, lead_source, default_discount, note, group_id, \
             created_by, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(input.name.trim())
        .bind(clean(&input.email))
        .bind(clean(&input.mobile))
        .bind(clean(&input.home_phone))
        .bind(clean(&input.address))
        .bind(clean(&input.apt_or_suite))
        .bind(clean(&input.city))
        .bind(clean(&input.state))
        .bind(clean(&input.zip_code))
        .bind(clean(&input.company_name))
        .bind(clean(&input.customer_type))
        .bind(clean(&input.lead_source))
        .bind(input.default_discount)
        .bind(clean(&input.note))
        .bind(group_id)
        .bind(created_by)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.find(id).await?.ok_or(CustomerError::NotFound)
    }

    /// Loads a live customer. Ownership is checked by the caller.
    pub async fn find(&self, id: Id) -> Result<Option<Customer>, CustomerError> {
        let row = sqlx::query_as::<_, CustomerRow>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers c WHERE c.id = ? AND c.deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CustomerRow::into_domain))
    }

    /// Finds a live customer with the given email inside one owner group.
    pub async fn find_by_email(
        &self,
        email: &str,
        group_id: Option<Id>,
    ) -> Result<Option<Customer>, CustomerError> {
        let row = sqlx::query_as::<_, CustomerRow>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers c \
             WHERE lower(c.email) = lower(?) AND COALESCE(c.group_id, 0) = COALESCE(?, 0) \
             AND c.deleted_at IS NULL"
        ))
        .bind(email.trim())
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CustomerRow::into_domain))
    }

    pub async fn list(
        &self,
        scope: GroupScope,
        request: PageRequest,
        filter: &CustomerFilter,
    ) -> Result<Page<CustomerListItem>, CustomerError> {
        let pattern = like_pattern(filter.search.as_deref());

        let mut count =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM customers c WHERE c.deleted_at IS NULL");
        push_scope(&mut count, scope, "c.group_id");
        if let Some(pattern) = &pattern {
            push_search(&mut count, pattern, SEARCHABLE);
        }
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        let request = request.clamped(total as u64);

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {CUSTOMER_COLUMNS}, \
             (SELECT COUNT(*) FROM proposals p WHERE p.customer_id = c.id AND p.is_deleted = 0) AS proposal_count \
             FROM customers c WHERE c.deleted_at IS NULL"
        ));
        push_scope(&mut query, scope, "c.group_id");
        if let Some(pattern) = &pattern {
            push_search(&mut query, pattern, SEARCHABLE);
        }
        let order = SortConfig::order_by(
            filter.sort.as_deref(),
            filter.dir.as_deref(),
            SORTABLE,
            ("c.created_at", SortDirection::Desc),
        );
        query
            .push(format!(" ORDER BY {order}, c.id DESC LIMIT "))
            .push_bind(request.limit as i64)
            .push(" OFFSET ")
            .push_bind(request.offset());
        let rows: Vec<CustomerListRow> = query.build_query_as().fetch_all(&self.pool).await?;

        let data = rows
            .into_iter()
            .map(|row| CustomerListItem {
                customer: row.customer.into_domain(),
                proposal_count: row.proposal_count,
            })
            .collect();
        Ok(Page::new(data, request, total as u64))
    }

    pub async fn update(
        &self,
        id: Id,
        input: &CustomerInput,
        now: DateTime<Utc>,
    ) -> Result<Customer, CustomerError> {
        let result = sqlx::query(
            "UPDATE customers SET name = ?, email = ?, mobile = ?, home_phone = ?, address = ?, \
             apt_or_suite = ?, city = ?, state = ?, zip_code = ?, company_name = ?, customer_type = ?, \
             lead_source = ?, default_discount = ?, note = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(input.name.trim())
        .bind(clean(&input.email))
        .bind(clean(&input.mobile))
        .bind(clean(&input.home_phone))
        .bind(clean(&input.address))
        .bind(clean(&input.apt_or_suite))
        .bind(clean(&input.city))
        .bind(clean(&input.state))
        .bind(clean(&input.zip_code))
        .bind(clean(&input.company_name))
        .bind(clean(&input.customer_type))
        .bind(clean(&input.lead_source))
        .bind(input.default_discount)
        .bind(clean(&input.note))
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CustomerError::NotFound);
        }
        self.find(id).await?.ok_or(CustomerError::NotFound)
    }

    /// Marks the customer deleted; proposals keep their reference.
    pub async fn soft_delete(&self, id: Id, now: DateTime<Utc>) -> Result<(), CustomerError> {
        let result = sqlx::query(
            "UPDATE customers SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(to_rfc3339(now))
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CustomerError::NotFound);
        }
        Ok(())
    }
}
