use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use cabinet_portal_core::types::{Id, Tax, TaxInput};
use cabinet_portal_core::Permission;

use crate::auth::AuthUser;
use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Every signed-in user may read the rates; proposals are priced with the default.
pub async fn list(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<Vec<Tax>>, ProblemResponse> {
    Ok(Json(state.storage().taxes().list().await?))
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(input): Json<TaxInput>,
) -> Result<(StatusCode, Json<Tax>), ProblemResponse> {
    auth.require(Permission::AdminSettings)?;
    input.validate()?;
    let tax = state.storage().taxes().create(&input, state.now()).await?;
    info!(stage = "taxes", tax_id = tax.id, value = tax.value, is_default = tax.is_default, "tax created");
    Ok((StatusCode::CREATED, Json(tax)))
}

pub async fn remove(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<StatusCode, ProblemResponse> {
    auth.require(Permission::AdminSettings)?;
    state.storage().taxes().delete(id).await?;
    info!(stage = "taxes", tax_id = id, "tax deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_default(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<Tax>, ProblemResponse> {
    auth.require(Permission::AdminSettings)?;
    let tax = state.storage().taxes().set_default(id).await?;
    info!(stage = "taxes", tax_id = id, "default tax changed");
    Ok(Json(tax))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use cabinet_portal_core::types::Role;

    use crate::router::test_support::*;

    #[tokio::test]
    async fn first_rate_becomes_default_and_can_move() {
        let (state, _dir) = setup_state().await;
        let (_, admin) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let app = router(&state);

        let first = send(
            &app,
            Method::POST,
            "/api/taxes",
            Some(&admin),
            Some(json!({ "label": "State", "value": 8.25 })),
        )
        .await;
        assert_eq!(first.status, StatusCode::CREATED);
        assert_eq!(first.body["is_default"], true);

        let second = send(
            &app,
            Method::POST,
            "/api/taxes",
            Some(&admin),
            Some(json!({ "label": "County", "value": 2 })),
        )
        .await;
        assert_eq!(second.body["is_default"], false);
        let second_id = second.body["id"].as_i64().expect("id");

        let moved = send(
            &app,
            Method::PUT,
            &format!("/api/taxes/{second_id}/default"),
            Some(&admin),
            None,
        )
        .await;
        assert_eq!(moved.status, StatusCode::OK);
        assert_eq!(moved.body["is_default"], true);
        assert_eq!(state.storage().taxes().default_rate().await.expect("rate"), 2.0);

        let listed = send(&app, Method::GET, "/api/taxes", Some(&admin), None).await;
        assert_eq!(listed.body[0]["label"], "County");

        let removed = send(&app, Method::DELETE, &format!("/api/taxes/{second_id}"), Some(&admin), None).await;
        assert_eq!(removed.status, StatusCode::NO_CONTENT);
        let again = send(&app, Method::DELETE, &format!("/api/taxes/{second_id}"), Some(&admin), None).await;
        assert_eq!(again.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn members_read_but_cannot_write() {
        let (state, _dir) = setup_state().await;
        let (_, member) = seed_user(&state, "member@example.com", Role::User, None).await;
        let app = router(&state);

        let listed = send(&app, Method::GET, "/api/taxes", Some(&member), None).await;
        assert_eq!(listed.status, StatusCode::OK);

        let denied = send(
            &app,
            Method::POST,
            "/api/taxes",
            Some(&member),
            Some(json!({ "label": "Sneaky", "value": 1 })),
        )
        .await;
        assert_eq!(denied.status, StatusCode::FORBIDDEN);

        let (_, admin) = seed_user(&state, "admin@example.com", Role::Admin, None).await;
        let invalid = send(
            &app,
            Method::POST,
            "/api/taxes",
            Some(&admin),
            Some(json!({ "label": "", "value": 140 })),
        )
        .await;
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
    }
}
