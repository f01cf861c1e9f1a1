use std::time::Duration;

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
    Json,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

use cabinet_portal_core::permissions::ActorGroup;
use cabinet_portal_core::types::{Id, User};
use cabinet_portal_core::{Actor, Permission};
use cabinet_portal_util::AuthConfig;

use crate::problem::ProblemResponse;
use crate::router::AppState;

pub const REFRESH_HEADER: &str = "x-refresh-token";

const HASH_SCHEME: &str = "hmac-sha256";
const HASH_ITERATIONS: u32 = 10_000;
const SALT_LEN: usize = 16;

/// Hashes a password as `hmac-sha256$<iterations>$<salt hex>$<digest hex>`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = derive(password.as_bytes(), &salt, HASH_ITERATIONS);
    format!(
        "{HASH_SCHEME}${HASH_ITERATIONS}${}${}",
        hex::encode(salt),
        hex::encode(digest)
    )
}

/// Checks `password` against a stored hash. Malformed hashes never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(HASH_SCHEME), Some(iterations), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt), hex::decode(expected)) else {
        return false;
    };
    if iterations == 0 {
        return false;
    }
    let digest = derive(password.as_bytes(), &salt, iterations);
    digest.as_slice().ct_eq(expected.as_slice()).into()
}

fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut block = Vec::new();
    for _ in 0..iterations {
        // A salt of any length is a valid HMAC key.
        let mut mac = match Hmac::<Sha256>::new_from_slice(salt) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(&block);
        mac.update(password);
        block = mac.finalize().into_bytes().to_vec();
    }
    block
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn user_id(&self) -> Option<Id> {
        self.sub.parse().ok()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies HS256 session tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: chrono::Duration,
    refresh_threshold: Duration,
}

impl TokenService {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the application clock instead.
        validation.validate_exp = false;
        validation.validate_aud = false;
        Self {
            encoding_key: EncodingKey::from_secret(&config.jwt_secret),
            decoding_key: DecodingKey::from_secret(&config.jwt_secret),
            validation,
            ttl: chrono::Duration::from_std(config.token_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            refresh_threshold: config.refresh_threshold,
        }
    }

    pub fn issue(&self, user: &User, now: DateTime<Utc>) -> Result<IssuedToken, TokenError> {
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: user.id.to_string(),
            role: user.role.as_str().to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| TokenError::Invalid(err.to_string()))?;
        Ok(IssuedToken { token, expires_at })
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| TokenError::Invalid(err.to_string()))?
            .claims;
        if now.timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// True when less than the refresh threshold of lifetime remains.
    pub fn needs_refresh(&self, claims: &Claims, now: DateTime<Utc>) -> bool {
        let remaining = claims.exp - now.timestamp();
        remaining >= 0 && (remaining as u64) < self.refresh_threshold.as_secs()
    }
}

/// The authenticated account of a request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub actor: Actor,
}

impl AuthUser {
    pub fn require(&self, permission: Permission) -> Result<(), ProblemResponse> {
        if self.actor.can(permission) {
            Ok(())
        } else {
            Err(ProblemResponse::forbidden(format!(
                "missing permission {permission}"
            )))
        }
    }

    pub fn require_admin(&self) -> Result<(), ProblemResponse> {
        if self.actor.is_admin() {
            Ok(())
        } else {
            Err(ProblemResponse::forbidden("administrator access required"))
        }
    }

    /// Ownership check for a record owned by `owner_group_id`.
    pub fn require_access(&self, owner_group_id: Option<Id>) -> Result<(), ProblemResponse> {
        if self.actor.scope().can_access(owner_group_id) {
            Ok(())
        } else {
            Err(ProblemResponse::forbidden("record belongs to another group"))
        }
    }
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolves a raw token into the account behind it.
pub(crate) async fn authenticate(state: &AppState, token: &str) -> Result<AuthUser, ProblemResponse> {
    let claims = state
        .tokens()
        .verify(token, state.now())
        .map_err(|err| ProblemResponse::unauthorized(err.to_string()))?;
    let user_id = claims
        .user_id()
        .ok_or_else(|| ProblemResponse::unauthorized("token subject is not a user id"))?;

    let user = state
        .storage()
        .users()
        .find(user_id)
        .await?
        .ok_or_else(|| ProblemResponse::unauthorized("account no longer exists"))?;

    let group = match user.group_id {
        Some(group_id) => state
            .storage()
            .groups()
            .find(group_id)
            .await?
            .map(|group| ActorGroup {
                id: group.id,
                group_type: group.group_type,
                modules: group.modules,
            }),
        None => None,
    };

    let actor = Actor {
        user_id: user.id,
        role: user.role,
        group,
    };
    Ok(AuthUser { user, actor })
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ProblemResponse;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ProblemResponse::unauthorized("missing bearer token"))?
            .to_string();
        authenticate(state, &token).await
    }
}

/// Attaches a fresh token in `x-refresh-token` when the presented one is close to expiry.
pub async fn refresh_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let refresh = bearer_token(&parts.headers).and_then(|token| {
        let now = state.now();
        let claims = state.tokens().verify(token, now).ok()?;
        state.tokens().needs_refresh(&claims, now).then_some(claims)
    });

    let mut response = next.run(Request::from_parts(parts, body)).await;

    let Some(claims) = refresh else {
        return response;
    };
    if !response.status().is_success() {
        return response;
    }
    let Some(user_id) = claims.user_id() else {
        return response;
    };
    let user = match state.storage().users().find(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return response,
        Err(err) => {
            warn!(stage = "auth", user_id, error = %err, "failed to load user for token refresh");
            return response;
        }
    };
    match state.tokens().issue(&user, state.now()) {
        Ok(issued) => {
            if let Ok(value) = HeaderValue::from_str(&issued.token) {
                response.headers_mut().insert(REFRESH_HEADER, value);
            }
        }
        Err(err) => warn!(stage = "auth", user_id, error = %err, "failed to refresh token"),
    }
    response
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, ProblemResponse> {
    let record = state.storage().users().find_by_email(body.email.trim()).await?;
    let record = match record {
        Some(record) if verify_password(&body.password, &record.password_hash) => record,
        _ => {
            counter!("auth_login_total", "result" => "rejected").increment(1);
            warn!(stage = "auth", "login rejected");
            return Err(ProblemResponse::unauthorized("invalid email or password"));
        }
    };

    let issued = state
        .tokens()
        .issue(&record.user, state.now())
        .map_err(|err| ProblemResponse::internal("auth", &err))?;
    counter!("auth_login_total", "result" => "success").increment(1);
    info!(stage = "auth", user_id = record.user.id, "login succeeded");

    let auth = authenticate(&state, &issued.token).await?;
    Ok(Json(json!({
        "token": issued.token,
        "expires_at": issued.expires_at,
        "user": auth.user,
        "permissions": auth.actor.permissions().iter().collect::<Vec<_>>(),
    })))
}

pub async fn me(State(state): State<AppState>, auth: AuthUser) -> Result<Json<Value>, ProblemResponse> {
    let group = match auth.user.group_id {
        Some(id) => state.storage().groups().find(id).await?,
        None => None,
    };
    Ok(Json(json!({
        "user": auth.user,
        "group": group,
        "is_admin": auth.actor.is_admin(),
        "permissions": auth.actor.permissions().iter().collect::<Vec<_>>(),
    })))
}
