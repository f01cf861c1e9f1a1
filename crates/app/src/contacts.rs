use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use cabinet_portal_core::types::{
    ContactInfo, ContactMessage, ContactThread, Id, NewNotification, NotificationPriority,
    ThreadStatus,
};
use cabinet_portal_core::validation::{validate_message, validate_thread};
use cabinet_portal_core::{Page, PageRequest, Permission};
use cabinet_portal_storage::customizations::CONTACT_INFO_KIND;
use cabinet_portal_storage::{ContactError, ThreadFilter, Viewer};

use crate::auth::AuthUser;
use crate::events::PortalEvent;
use crate::notifications::deliver;
use crate::problem::ProblemResponse;
use crate::router::{non_empty, AppState};

const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Default, Deserialize)]
pub struct ThreadQuery {
    page: Option<String>,
    limit: Option<String>,
    status: Option<String>,
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewThread {
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    body: String,
}

fn viewer(auth: &AuthUser) -> Viewer {
    Viewer {
        user_id: auth.user.id,
        is_admin: auth.actor.is_admin(),
    }
}

fn preview(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= PREVIEW_CHARS {
        return body.to_string();
    }
    let mut short: String = body.chars().take(PREVIEW_CHARS).collect();
    short.push_str("...");
    short
}

async fn load_thread(state: &AppState, auth: &AuthUser, id: Id) -> Result<ContactThread, ProblemResponse> {
    Ok(state
        .storage()
        .contacts()
        .find_thread(id, viewer(auth))
        .await?
        .ok_or(ContactError::NotFound)?)
}

/// Tells the other side of the conversation about a new message.
async fn notify_counterpart(
    state: &AppState,
    auth: &AuthUser,
    thread: &ContactThread,
    message: &ContactMessage,
) -> Result<(), ProblemResponse> {
    let payload = Some(json!({ "thread_id": thread.id, "message_id": message.id }));
    let action_url = Some(format!("/contact/{}", thread.id));

    if message.is_admin {
        if thread.user_id != auth.user.id {
            let notification = NewNotification {
                kind: "contact.reply".to_string(),
                title: format!("Reply: {}", thread.subject),
                message: preview(&message.body),
                payload,
                priority: NotificationPriority::Medium,
                action_url,
                created_by: Some(auth.user.id),
            };
            deliver(state, &[thread.user_id], &notification, None).await;
        }
    } else {
        let admins: Vec<Id> = state
            .storage()
            .users()
            .admin_ids()
            .await?
            .into_iter()
            .filter(|id| *id != auth.user.id)
            .collect();
        let notification = NewNotification {
            kind: "contact.message".to_string(),
            title: format!("New message from {}", auth.user.name),
            message: preview(&message.body),
            payload,
            priority: NotificationPriority::High,
            action_url,
            created_by: Some(auth.user.id),
        };
        deliver(state, &admins, &notification, None).await;
    }

    state.events().publish(PortalEvent::ContactMessage {
        thread_id: thread.id,
        message_id: message.id,
        from_admin: message.is_admin,
        at: message.created_at,
    });
    Ok(())
}

pub async fn info(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<ContactInfo>, ProblemResponse> {
    Ok(Json(state.storage().customizations().get(CONTACT_INFO_KIND).await?))
}

pub async fn update_info(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(info): Json<ContactInfo>,
) -> Result<Json<ContactInfo>, ProblemResponse> {
    auth.require(Permission::AdminSettings)?;
    state
        .storage()
        .customizations()
        .put(CONTACT_INFO_KIND, &info, Some(auth.user.id), state.now())
        .await?;
    info!(stage = "contact", "contact info updated");
    Ok(Json(info))
}

pub async fn list_threads(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<Page<ContactThread>>, ProblemResponse> {
    let status = match non_empty(query.status.as_deref()) {
        None | Some("all") => None,
        Some(value) => Some(ThreadStatus::parse(value).ok_or_else(|| {
            ProblemResponse::bad_request("invalid_status", format!("unknown thread status {value}"))
        })?),
    };
    let request = PageRequest::from_query(
        query.page.as_deref(),
        query.limit.as_deref(),
        PageRequest::DEFAULT_LIMIT,
        PageRequest::MAX_LIMIT,
    );
    let filter = ThreadFilter {
        status,
        search: non_empty(query.search.as_deref()).map(str::to_string),
    };
    let page = state
        .storage()
        .contacts()
        .list_threads(viewer(&auth), request, &filter)
        .await?;
    Ok(Json(page))
}

pub async fn create_thread(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(input): Json<NewThread>,
) -> Result<(StatusCode, Json<Value>), ProblemResponse> {
    validate_thread(&input.subject, &input.body)?;
    let (thread, message) = state
        .storage()
        .contacts()
        .create_thread(auth.user.id, &input.subject, &input.body, state.now())
        .await?;
    info!(stage = "contact", thread_id = thread.id, user_id = auth.user.id, "thread opened");

    notify_counterpart(&state, &auth, &thread, &message).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "thread": thread, "message": message })),
    ))
}

pub async fn show_thread(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<Value>, ProblemResponse> {
    let thread = load_thread(&state, &auth, id).await?;
    let messages = state.storage().contacts().messages(id).await?;
    Ok(Json(json!({ "thread": thread, "messages": messages })))
}

pub async fn post_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Json(input): Json<NewMessage>,
) -> Result<(StatusCode, Json<ContactMessage>), ProblemResponse> {
    validate_message(&input.body)?;
    let thread = load_thread(&state, &auth, id).await?;
    let message = state
        .storage()
        .contacts()
        .post_message(id, viewer(&auth), &input.body, state.now())
        .await?;
    info!(
        stage = "contact",
        thread_id = id,
        message_id = message.id,
        from_admin = message.is_admin,
        "message posted"
    );

    notify_counterpart(&state, &auth, &thread, &message).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<Value>, ProblemResponse> {
    load_thread(&state, &auth, id).await?;
    let updated = state
        .storage()
        .contacts()
        .mark_read(id, viewer(&auth), state.now())
        .await?;
    Ok(Json(json!({ "updated": updated })))
}

/// Either the owner or an admin may close a thread.
pub async fn close(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<ContactThread>, ProblemResponse> {
    load_thread(&state, &auth, id).await?;
    state.storage().contacts().close(id, state.now()).await?;
    info!(stage = "contact", thread_id = id, closed_by = auth.user.id, "thread closed");
    Ok(Json(load_thread(&state, &auth, id).await?))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use cabinet_portal_core::types::Role;

    use super::*;
    use crate::router::test_support::*;

    #[test]
    fn previews_are_truncated() {
        assert_eq!(preview("  short  "), "short");
        let long = "x".repeat(200);
        let short = preview(&long);
        assert_eq!(short.chars().count(), PREVIEW_CHARS + 3);
        assert!(short.ends_with("..."));
    }

    #[tokio::test]
    async fn conversation_notifies_each_side() {
        let (state, _dir) = setup_state().await;
        let (_, admin) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let (_, owner) = seed_user(&state, "owner@example.com", Role::User, None).await;
        let (_, other) = seed_user(&state, "other@example.com", Role::User, None).await;
        let app = router(&state);

        let created = send(
            &app,
            Method::POST,
            "/api/contact/threads",
            Some(&owner),
            Some(json!({ "subject": "Missing door", "body": "The B12 door never arrived" })),
        )
        .await;
        assert_eq!(created.status, StatusCode::CREATED);
        let id = created.body["thread"]["id"].as_i64().expect("thread id");

        let admin_unread = send(&app, Method::GET, "/api/notifications/unread-count", Some(&admin), None).await;
        assert_eq!(admin_unread.body["unread_count"], 1);

        let hidden = send(&app, Method::GET, &format!("/api/contact/threads/{id}"), Some(&other), None).await;
        assert_eq!(hidden.status, StatusCode::NOT_FOUND);

        let listed = send(&app, Method::GET, "/api/contact/threads", Some(&admin), None).await;
        assert_eq!(listed.body["pagination"]["total"], 1);
        assert_eq!(listed.body["data"][0]["unread_count"], 1);

        let reply = send(
            &app,
            Method::POST,
            &format!("/api/contact/threads/{id}/messages"),
            Some(&admin),
            Some(json!({ "body": "Shipping a replacement today" })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::CREATED);
        assert_eq!(reply.body["is_admin"], true);

        let owner_notes = send(&app, Method::GET, "/api/notifications", Some(&owner), None).await;
        assert_eq!(owner_notes.body["data"][0]["type"], "contact.reply");

        let read = send(
            &app,
            Method::POST,
            &format!("/api/contact/threads/{id}/read"),
            Some(&owner),
            None,
        )
        .await;
        assert_eq!(read.body["updated"], 1);

        let shown = send(&app, Method::GET, &format!("/api/contact/threads/{id}"), Some(&owner), None).await;
        assert_eq!(shown.body["messages"].as_array().expect("messages").len(), 2);
        assert_eq!(shown.body["thread"]["unread_count"], 0);
    }

    #[tokio::test]
    async fn closed_threads_reject_messages() {
        let (state, _dir) = setup_state().await;
        let (_, owner) = seed_user(&state, "owner@example.com", Role::User, None).await;
        let app = router(&state);

        let created = send(
            &app,
            Method::POST,
            "/api/contact/threads",
            Some(&owner),
            Some(json!({ "subject": "Question", "body": "Hello" })),
        )
        .await;
        let id = created.body["thread"]["id"].as_i64().expect("thread id");

        let closed = send(
            &app,
            Method::POST,
            &format!("/api/contact/threads/{id}/close"),
            Some(&owner),
            None,
        )
        .await;
        assert_eq!(closed.body["status"], "closed");

        let rejected = send(
            &app,
            Method::POST,
            &format!("/api/contact/threads/{id}/messages"),
            Some(&owner),
            Some(json!({ "body": "Anyone?" })),
        )
        .await;
        assert_eq!(rejected.status, StatusCode::CONFLICT);

        let open_only = send(&app, Method::GET, "/api/contact/threads?status=open", Some(&owner), None).await;
        assert_eq!(open_only.body["pagination"]["total"], 0);

        let invalid = send(
            &app,
            Method::POST,
            "/api/contact/threads",
            Some(&owner),
            Some(json!({ "subject": "", "body": "" })),
        )
        .await;
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn contact_info_is_admin_editable() {
        let (state, _dir) = setup_state().await;
        let (_, admin) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let (_, member) = seed_user(&state, "member@example.com", Role::User, None).await;
        let app = router(&state);

        let denied = send(
            &app,
            Method::PUT,
            "/api/contact/info",
            Some(&member),
            Some(json!({ "phone": "555" })),
        )
        .await;
        assert_eq!(denied.status, StatusCode::FORBIDDEN);

        send(
            &app,
            Method::PUT,
            "/api/contact/info",
            Some(&admin),
            Some(json!({ "phone": "555-0100", "hours": "9-5" })),
        )
        .await;
        let shown = send(&app, Method::GET, "/api/contact/info", Some(&member), None).await;
        assert_eq!(shown.body["phone"], "555-0100");
        assert!(shown.body["email"].is_null());
    }
}
