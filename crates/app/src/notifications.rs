use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{sse::Sse, IntoResponse},
    Json,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use cabinet_portal_core::types::{Id, NewNotification, Notification};
use cabinet_portal_core::PageRequest;
use cabinet_portal_storage::NotificationFilter;

use crate::auth::{self, AuthUser};
use crate::events::{stream_keep_alive, PortalEvent};
use crate::problem::ProblemResponse;
use crate::router::{flag, non_empty, AppState};

const DEFAULT_LIMIT: u32 = 20;

#[derive(Debug, Default, Deserialize)]
pub struct NotificationQuery {
    page: Option<String>,
    limit: Option<String>,
    unread_only: Option<String>,
    read_only: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

/// Stores `notification` for every recipient and pushes the new rows to live streams.
///
/// Recipients that already hold `dedupe_key` are skipped. Failures are logged and
/// never fail the calling request; the number of delivered rows is returned.
pub(crate) async fn deliver(
    state: &AppState,
    recipients: &[Id],
    notification: &NewNotification,
    dedupe_key: Option<&str>,
) -> usize {
    if recipients.is_empty() {
        return 0;
    }
    let created = match state
        .storage()
        .notifications()
        .create_for(recipients, notification, dedupe_key, state.now())
        .await
    {
        Ok(created) => created,
        Err(err) => {
            warn!(
                stage = "notification",
                kind = %notification.kind,
                error = %err,
                "failed to store notifications"
            );
            return 0;
        }
    };

    let delivered = created.len();
    if delivered > 0 {
        counter!("notifications_created_total", "type" => notification.kind.clone())
            .increment(delivered as u64);
    }
    for row in created {
        state
            .events()
            .publish(PortalEvent::NotificationCreated { notification: row });
    }
    info!(
        stage = "notification",
        kind = %notification.kind,
        recipients = recipients.len(),
        delivered,
        "notifications delivered"
    );
    delivered
}

pub async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Value>, ProblemResponse> {
    let request = PageRequest::from_query(
        query.page.as_deref(),
        query.limit.as_deref(),
        DEFAULT_LIMIT,
        PageRequest::MAX_LIMIT,
    );
    let filter = NotificationFilter {
        unread_only: flag(query.unread_only.as_deref()),
        read_only: flag(query.read_only.as_deref()),
        kind: non_empty(query.kind.as_deref()).map(str::to_string),
    };
    let repo = state.storage().notifications();
    let page = repo.list(auth.user.id, request, &filter).await?;
    let unread_count = repo.unread_count(auth.user.id).await?;

    Ok(Json(json!({
        "data": page.data,
        "pagination": page.pagination,
        "unread_count": unread_count,
    })))
}

pub async fn unread_count(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Value>, ProblemResponse> {
    let count = state
        .storage()
        .notifications()
        .unread_count(auth.user.id)
        .await?;
    Ok(Json(json!({ "unread_count": count })))
}

pub async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<Notification>, ProblemResponse> {
    let notification = state
        .storage()
        .notifications()
        .mark_read(id, auth.user.id, state.now())
        .await?;
    Ok(Json(notification))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Value>, ProblemResponse> {
    let updated = state
        .storage()
        .notifications()
        .mark_all_read(auth.user.id, state.now())
        .await?;
    Ok(Json(json!({ "updated": updated })))
}

/// Server-sent events for the caller's notifications. Browsers cannot set headers on
/// `EventSource`, so the token may also come from `?token=`.
pub async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let token = auth::bearer_token(&headers)
        .or_else(|| non_empty(query.token.as_deref()))
        .ok_or_else(|| ProblemResponse::unauthorized("missing bearer token"))?
        .to_string();
    let auth = auth::authenticate(&state, &token).await?;

    info!(stage = "notification", user_id = auth.user.id, "notification stream opened");
    let stream = state.events().notification_stream(auth.user.id);
    Ok(Sse::new(stream).keep_alive(stream_keep_alive()))
}
