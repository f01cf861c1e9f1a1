use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use cabinet_portal_core::types::{Customer, CustomerInput, CustomerListItem, Id};
use cabinet_portal_core::{GroupScope, Page, PageRequest, Permission};
use cabinet_portal_storage::CustomerFilter;

use crate::auth::AuthUser;
use crate::problem::ProblemResponse;
use crate::router::{non_empty, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct CustomerQuery {
    page: Option<String>,
    limit: Option<String>,
    search: Option<String>,
    sort: Option<String>,
    dir: Option<String>,
}

impl CustomerQuery {
    fn page_request(&self) -> PageRequest {
        PageRequest::from_query(
            self.page.as_deref(),
            self.limit.as_deref(),
            PageRequest::DEFAULT_LIMIT,
            PageRequest::MAX_LIMIT,
        )
    }

    fn filter(&self) -> CustomerFilter {
        CustomerFilter {
            search: non_empty(self.search.as_deref()).map(str::to_string),
            sort: non_empty(self.sort.as_deref()).map(str::to_string),
            dir: non_empty(self.dir.as_deref()).map(str::to_string),
        }
    }
}

/// Lists customers visible under `scope`. Shared with the contractor detail page.
pub(crate) async fn list_scoped(
    state: &AppState,
    scope: GroupScope,
    query: &CustomerQuery,
) -> Result<Page<CustomerListItem>, ProblemResponse> {
    let page = state
        .storage()
        .customers()
        .list(scope, query.page_request(), &query.filter())
        .await?;
    Ok(page)
}

async fn load(state: &AppState, auth: &AuthUser, id: Id) -> Result<Customer, ProblemResponse> {
    let customer = state
        .storage()
        .customers()
        .find(id)
        .await?
        .ok_or_else(|| ProblemResponse::not_found("customer not found"))?;
    auth.require_access(customer.group_id)?;
    Ok(customer)
}

pub async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<CustomerQuery>,
) -> Result<Json<Page<CustomerListItem>>, ProblemResponse> {
    auth.require(Permission::CustomersRead)?;
    Ok(Json(list_scoped(&state, auth.actor.scope(), &query).await?))
}

pub async fn show(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<Customer>, ProblemResponse> {
    auth.require(Permission::CustomersRead)?;
    Ok(Json(load(&state, &auth, id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(input): Json<CustomerInput>,
) -> Result<(StatusCode, Json<Customer>), ProblemResponse> {
    auth.require(Permission::CustomersCreate)?;
    input.validate()?;

    let owner = auth.actor.scope().owner_for_new();
    let customer = state
        .storage()
        .customers()
        .create(&input, owner, Some(auth.user.id), state.now())
        .await?;

    info!(
        stage = "customers",
        customer_id = customer.id,
        group_id = ?customer.group_id,
        "customer created"
    );
    Ok((StatusCode::CREATED, Json(customer)))
}

pub async fn update(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Json(input): Json<CustomerInput>,
) -> Result<Json<Customer>, ProblemResponse> {
    auth.require(Permission::CustomersUpdate)?;
    load(&state, &auth, id).await?;
    input.validate()?;

    let customer = state
        .storage()
        .customers()
        .update(id, &input, state.now())
        .await?;
    info!(stage = "customers", customer_id = id, "customer updated");
    Ok(Json(customer))
}

pub async fn remove(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<StatusCode, ProblemResponse> {
    auth.require(Permission::CustomersDelete)?;
    load(&state, &auth, id).await?;
    state.storage().customers().soft_delete(id, state.now()).await?;
    info!(stage = "customers", customer_id = id, "customer deleted");
    Ok(StatusCode::NO_CONTENT)
}
