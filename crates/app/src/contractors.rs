use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use cabinet_portal_core::types::{
    ContractorGroup, ContractorSummary, CustomerListItem, GroupInput, GroupType, Id, Proposal,
};
use cabinet_portal_core::{GroupScope, Page, PageRequest, Permission};

use crate::auth::AuthUser;
use crate::customers::{self, CustomerQuery};
use crate::problem::ProblemResponse;
use crate::proposals::{self, ProposalQuery};
use crate::router::{non_empty, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ContractorQuery {
    page: Option<String>,
    limit: Option<String>,
    search: Option<String>,
    group_type: Option<String>,
}

async fn load_summary(
    state: &AppState,
    auth: &AuthUser,
    id: Id,
) -> Result<ContractorSummary, ProblemResponse> {
    auth.require(Permission::ContractorsRead)?;
    auth.require_access(Some(id))?;
    state
        .storage()
        .groups()
        .summary(id)
        .await?
        .ok_or_else(|| ProblemResponse::not_found("contractor not found"))
}

/// Admins page through every group. Members only ever see their own.
pub async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ContractorQuery>,
) -> Result<Json<Page<ContractorSummary>>, ProblemResponse> {
    auth.require(Permission::ContractorsRead)?;
    let request = PageRequest::from_query(
        query.page.as_deref(),
        query.limit.as_deref(),
        PageRequest::DEFAULT_LIMIT,
        PageRequest::MAX_LIMIT,
    );

    let page = match auth.actor.scope() {
        GroupScope::All => {
            let group_type = non_empty(query.group_type.as_deref()).map(GroupType::parse);
            state
                .storage()
                .groups()
                .list(request, non_empty(query.search.as_deref()), group_type)
                .await?
        }
        GroupScope::Group(id) => {
            let own: Vec<_> = state.storage().groups().summary(id).await?.into_iter().collect();
            let total = own.len() as u64;
            Page::new(own, request.clamped(total), total)
        }
        GroupScope::Unowned => Page::new(Vec::new(), PageRequest::default(), 0),
    };
    Ok(Json(page))
}

pub async fn show(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<ContractorSummary>, ProblemResponse> {
    Ok(Json(load_summary(&state, &auth, id).await?))
}

pub async fn proposals(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Query(query): Query<ProposalQuery>,
) -> Result<Json<Page<Proposal>>, ProblemResponse> {
    load_summary(&state, &auth, id).await?;
    let page = proposals::list_scoped(&state, GroupScope::Group(id), &query, None).await?;
    Ok(Json(page))
}

pub async fn customers(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Query(query): Query<CustomerQuery>,
) -> Result<Json<Page<CustomerListItem>>, ProblemResponse> {
    load_summary(&state, &auth, id).await?;
    let page = customers::list_scoped(&state, GroupScope::Group(id), &query).await?;
    Ok(Json(page))
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(input): Json<GroupInput>,
) -> Result<(StatusCode, Json<ContractorGroup>), ProblemResponse> {
    auth.require(Permission::AdminGroups)?;
    input.validate()?;
    let group = state.storage().groups().create(&input, state.now()).await?;
    info!(stage = "contractors", group_id = group.id, name = %group.name, "contractor created");
    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn update(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Json(input): Json<GroupInput>,
) -> Result<Json<ContractorGroup>, ProblemResponse> {
    auth.require(Permission::AdminGroups)?;
    input.validate()?;
    let group = state.storage().groups().update(id, &input, state.now()).await?;
    info!(stage = "contractors", group_id = id, "contractor updated");
    Ok(Json(group))
}

pub async fn remove(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<StatusCode, ProblemResponse> {
    auth.require(Permission::AdminGroups)?;
    state.storage().groups().soft_delete(id, state.now()).await?;
    info!(stage = "contractors", group_id = id, "contractor deleted");
    Ok(StatusCode::NO_CONTENT)
}
