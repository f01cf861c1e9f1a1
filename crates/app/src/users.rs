use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use cabinet_portal_core::types::{Id, Role, User, UserInput};
use cabinet_portal_core::{Page, PageRequest, Permission};
use cabinet_portal_storage::{NewUser, UserChanges};

use crate::auth::{hash_password, AuthUser};
use crate::problem::ProblemResponse;
use crate::router::{non_empty, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    page: Option<String>,
    limit: Option<String>,
    search: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<UserQuery>,
) -> Result<Json<Page<User>>, ProblemResponse> {
    auth.require(Permission::AdminUsers)?;
    let request = PageRequest::from_query(
        query.page.as_deref(),
        query.limit.as_deref(),
        PageRequest::DEFAULT_LIMIT,
        PageRequest::MAX_LIMIT,
    );
    let page = state
        .storage()
        .users()
        .list(request, non_empty(query.search.as_deref()))
        .await?;
    Ok(Json(page))
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(input): Json<UserInput>,
) -> Result<(StatusCode, Json<User>), ProblemResponse> {
    auth.require(Permission::AdminUsers)?;
    input.validate(true)?;

    let password = input.password.as_deref().unwrap_or_default();
    let hash = hash_password(password);
    let user = state
        .storage()
        .users()
        .create(NewUser {
            name: &input.name,
            email: &input.email,
            password_hash: &hash,
            role: input.role.unwrap_or(Role::User),
            group_id: input.group_id,
            created_at: state.now(),
        })
        .await?;

    info!(stage = "users", user_id = user.id, created_by = auth.user.id, "user created");
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn update(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Json(input): Json<UserInput>,
) -> Result<Json<User>, ProblemResponse> {
    auth.require(Permission::AdminUsers)?;
    input.validate(false)?;

    let hash = input.password.as_deref().map(hash_password);
    let changes = UserChanges {
        name: Some(&input.name),
        email: Some(&input.email),
        password_hash: hash.as_deref(),
        role: input.role,
        group_id: Some(input.group_id),
    };
    let user = state.storage().users().update(id, changes, state.now()).await?;

    info!(stage = "users", user_id = id, updated_by = auth.user.id, "user updated");
    Ok(Json(user))
}

pub async fn remove(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<StatusCode, ProblemResponse> {
    auth.require(Permission::AdminUsers)?;
    if id == auth.user.id {
        return Err(ProblemResponse::conflict(
            "self_delete",
            "you cannot delete your own account",
        ));
    }
    state.storage().users().soft_delete(id, state.now()).await?;
    info!(stage = "users", user_id = id, deleted_by = auth.user.id, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}
