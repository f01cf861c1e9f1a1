use std::{path::PathBuf, sync::Arc};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use cabinet_portal_storage::Database;
use cabinet_portal_util::AppConfig;

use crate::auth::{self, TokenService};
use crate::events::EventHub;
use crate::{
    contacts, contractors, customers, customization, manufacturers, notifications, proposals,
    taxes, telemetry, users,
};

/// Where uploaded files are stored and how large they may be.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub dir: PathBuf,
    pub max_bytes: usize,
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    events: EventHub,
    tokens: TokenService,
    uploads: Arc<UploadSettings>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        events: EventHub,
        config: &AppConfig,
    ) -> Self {
        Self {
            metrics,
            storage,
            events,
            tokens: TokenService::new(&config.auth),
            uploads: Arc::new(UploadSettings {
                dir: config.upload_dir.clone(),
                max_bytes: config.upload_max_bytes,
            }),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn uploads(&self) -> &UploadSettings {
        &self.uploads
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    let body_limit = state.uploads().max_bytes;

    let api = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/me", get(auth::me))
        .route("/users", get(users::list).post(users::create))
        .route("/users/:id", put(users::update).delete(users::remove))
        .route("/customers", get(customers::list).post(customers::create))
        .route(
            "/customers/:id",
            get(customers::show)
                .put(customers::update)
                .delete(customers::remove),
        )
        .route("/proposals", get(proposals::list).post(proposals::create))
        .route(
            "/proposals/:id",
            get(proposals::show)
                .put(proposals::update)
                .delete(proposals::remove),
        )
        .route("/proposals/:id/status", post(proposals::change_status))
        .route("/proposals/:id/accept", post(proposals::accept))
        .route("/proposals/:id/timeline", get(proposals::timeline))
        .route("/orders", get(proposals::orders))
        .route("/dashboard/counts", get(proposals::dashboard_counts))
        .route("/dashboard/latest-proposals", get(proposals::latest))
        .route(
            "/contractors",
            get(contractors::list).post(contractors::create),
        )
        .route(
            "/contractors/:id",
            get(contractors::show)
                .put(contractors::update)
                .delete(contractors::remove),
        )
        .route("/contractors/:id/proposals", get(contractors::proposals))
        .route("/contractors/:id/customers", get(contractors::customers))
        .route(
            "/manufacturers",
            get(manufacturers::list).post(manufacturers::create),
        )
        .route(
            "/manufacturers/:id",
            get(manufacturers::show).put(manufacturers::update),
        )
        .route("/manufacturers/:id/status", put(manufacturers::set_status))
        .route("/manufacturers/:id/image", post(manufacturers::upload_image))
        .route("/manufacturers/:id/styles", get(manufacturers::styles))
        .route(
            "/manufacturers/:id/catalog",
            get(manufacturers::catalog).post(manufacturers::add_catalog_item),
        )
        .route(
            "/manufacturers/:id/catalog/upload",
            post(manufacturers::upload_catalog),
        )
        .route("/catalog/assembly-cost", post(manufacturers::assembly_cost))
        .route("/catalog/:id", put(manufacturers::update_catalog_item))
        .route(
            "/catalog/:id/modifications",
            get(manufacturers::modifications).post(manufacturers::add_modification),
        )
        .route("/taxes", get(taxes::list).post(taxes::create))
        .route("/taxes/:id", delete(taxes::remove))
        .route("/taxes/:id/default", put(taxes::set_default))
        .route(
            "/contact/info",
            get(contacts::info).put(contacts::update_info),
        )
        .route(
            "/contact/threads",
            get(contacts::list_threads).post(contacts::create_thread),
        )
        .route("/contact/threads/:id", get(contacts::show_thread))
        .route("/contact/threads/:id/messages", post(contacts::post_message))
        .route("/contact/threads/:id/read", post(contacts::mark_read))
        .route("/contact/threads/:id/close", post(contacts::close))
        .route("/notifications", get(notifications::list))
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/notifications/mark-all-read", post(notifications::mark_all_read))
        .route("/notifications/stream", get(notifications::stream))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route(
            "/settings/customization",
            get(customization::show_ui).put(customization::update_ui),
        )
        .route(
            "/settings/customization/pdf",
            get(customization::show_pdf).put(customization::update_pdf),
        )
        .route(
            "/settings/customization/logo",
            post(customization::upload_logo).delete(customization::remove_logo),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::refresh_token,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/uploads/:name", get(customization::serve_upload))
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Query-string boolean. `1`, `true`, `yes` and `on` count as set.
pub(crate) fn flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|value| value.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

/// Trimmed, non-empty query value.
pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{path::Path, sync::Arc, time::Duration};

    use axum::{
        body::Body,
        http::{header, HeaderMap, Method, Request, StatusCode},
        Router,
    };
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use cabinet_portal_core::types::{GroupInput, GroupModules, GroupType, Id, Role, User};
    use cabinet_portal_storage::{Database, NewUser};
    use cabinet_portal_util::{
        AppConfig, AuthConfig, Environment, MaintenanceConfig, DEFAULT_BIND_ADDR,
    };

    use super::{app_router, AppState};
    use crate::auth::hash_password;
    use crate::events::EventHub;
    use crate::telemetry;

    pub const PASSWORD: &str = "password123";

    pub fn test_config(upload_dir: &Path) -> AppConfig {
        AppConfig {
            bind_addr: DEFAULT_BIND_ADDR.parse().expect("bind addr"),
            environment: Environment::Test,
            database_url: "sqlite::memory:".to_string(),
            auth: AuthConfig {
                jwt_secret: b"test-secret".to_vec(),
                token_ttl: Duration::from_secs(3600),
                refresh_threshold: Duration::from_secs(1200),
            },
            upload_dir: upload_dir.to_path_buf(),
            upload_max_bytes: 1024 * 1024,
            maintenance: MaintenanceConfig {
                interval: Duration::from_secs(300),
                notification_retention_days: 90,
            },
            bootstrap_admin: None,
        }
    }

    /// App state over a fresh in-memory database. Keep the returned dir alive for uploads.
    pub async fn setup_state() -> (AppState, tempfile::TempDir) {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState::new(metrics, database, EventHub::new(), &test_config(dir.path()));
        (state, dir)
    }

    pub fn fixed_clock(state: AppState, at: DateTime<Utc>) -> AppState {
        state.with_clock(Arc::new(move || at))
    }

    pub async fn seed_user(
        state: &AppState,
        email: &str,
        role: Role,
        group_id: Option<Id>,
    ) -> (User, String) {
        let hash = hash_password(PASSWORD);
        let user = state
            .storage()
            .users()
            .create(NewUser {
                name: email.split('@').next().unwrap_or(email),
                email,
                password_hash: &hash,
                role,
                group_id,
                created_at: state.now(),
            })
            .await
            .expect("create user");
        let token = state.tokens().issue(&user, state.now()).expect("token").token;
        (user, token)
    }

    pub async fn seed_group(state: &AppState, name: &str, modules: GroupModules) -> Id {
        state
            .storage()
            .groups()
            .create(
                &GroupInput {
                    name: name.to_string(),
                    group_type: GroupType::Contractor,
                    modules,
                    multiplier: None,
                    multiplier_enabled: false,
                },
                state.now(),
            )
            .await
            .expect("create group")
            .id
    }

    pub fn all_modules() -> GroupModules {
        GroupModules {
            dashboard: true,
            proposals: true,
            customers: true,
            resources: true,
        }
    }

    pub struct TestResponse {
        pub status: StatusCode,
        pub headers: HeaderMap,
        pub body: Value,
    }

    pub async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };
        into_test_response(app.clone().oneshot(request).await.expect("response")).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_multipart(
        app: &Router,
        uri: &str,
        token: &str,
        field: &str,
        filename: &str,
        content_type: &str,
        content: &[u8],
        extra: &[(&str, &str)],
    ) -> TestResponse {
        let boundary = "portal-test-boundary";
        let mut body = Vec::new();
        for (name, value) in extra {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .expect("request");
        into_test_response(app.clone().oneshot(request).await.expect("response")).await
    }

    async fn into_test_response(response: axum::response::Response) -> TestResponse {
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should read")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub fn router(state: &AppState) -> Router {
        app_router(state.clone())
    }
}
