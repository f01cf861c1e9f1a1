use std::io::ErrorKind;

use axum::{
    body::{Body, Bytes},
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use cabinet_portal_core::types::{PdfCustomization, UiCustomization};
use cabinet_portal_core::Permission;
use cabinet_portal_storage::customizations::{PDF_KIND, UI_KIND};

use crate::auth::AuthUser;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const UPLOAD_PREFIX: &str = "/uploads/";

/// A file part pulled out of a multipart form.
#[derive(Debug)]
pub(crate) struct UploadedFile {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// File plus the plain text fields that came with it.
#[derive(Debug, Default)]
pub(crate) struct UploadForm {
    pub file: Option<UploadedFile>,
    pub fields: Vec<(String, String)>,
}

impl UploadForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn multipart_error(err: MultipartError) -> ProblemResponse {
    ProblemResponse::new(err.status(), "invalid_upload", err.body_text())
}

/// Reads the whole form. The part named `file_field` (or the first part
/// carrying a filename) becomes the file.
pub(crate) async fn read_upload(
    multipart: &mut Multipart,
    file_field: &str,
) -> Result<UploadForm, ProblemResponse> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let is_file = name == file_field || field.file_name().is_some();
        if is_file && form.file.is_none() {
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.map_err(multipart_error)?;
            if bytes.is_empty() {
                return Err(ProblemResponse::bad_request("invalid_upload", "uploaded file is empty"));
            }
            form.file = Some(UploadedFile { bytes, content_type });
        } else {
            let value = field.text().await.map_err(multipart_error)?;
            form.fields.push((name, value));
        }
    }
    Ok(form)
}

pub(crate) fn image_extension(content_type: Option<&str>) -> Option<&'static str> {
    match content_type?.trim().to_ascii_lowercase().as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("csv") => "text/csv",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Plain file names only; anything that could walk out of the upload dir is refused.
fn safe_name(name: &str) -> Option<&str> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'));
    valid.then_some(name)
}

/// Writes `bytes` under a fresh random name and returns its public path.
pub(crate) async fn store_upload(
    state: &AppState,
    bytes: &[u8],
    extension: &str,
) -> Result<String, ProblemResponse> {
    let dir = &state.uploads().dir;
    let name = format!("{}.{extension}", Uuid::new_v4().simple());
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| ProblemResponse::internal("uploads", &err))?;
    tokio::fs::write(dir.join(&name), bytes)
        .await
        .map_err(|err| ProblemResponse::internal("uploads", &err))?;
    info!(stage = "uploads", file = %name, bytes = bytes.len(), "upload stored");
    Ok(format!("{UPLOAD_PREFIX}{name}"))
}

/// Best effort removal of a previously stored upload.
pub(crate) async fn remove_upload(state: &AppState, public_path: &str) {
    let Some(name) = public_path.strip_prefix(UPLOAD_PREFIX).and_then(safe_name) else {
        return;
    };
    if let Err(err) = tokio::fs::remove_file(state.uploads().dir.join(name)).await {
        if err.kind() != ErrorKind::NotFound {
            warn!(stage = "uploads", file = %name, error = %err, "failed to remove upload");
        }
    }
}

pub async fn serve_upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ProblemResponse> {
    let name = safe_name(&name).ok_or_else(|| ProblemResponse::not_found("file not found"))?;
    let bytes = match tokio::fs::read(state.uploads().dir.join(name)).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ProblemResponse::not_found("file not found"))
        }
        Err(err) => return Err(ProblemResponse::internal("uploads", &err)),
    };
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type_for(name)),
            (header::CACHE_CONTROL, "public, max-age=86400"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
            (header::CONTENT_SECURITY_POLICY, "sandbox"),
        ],
        Body::from(bytes),
    )
        .into_response())
}

pub async fn show_ui(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<UiCustomization>, ProblemResponse> {
    Ok(Json(state.storage().customizations().get(UI_KIND).await?))
}

pub async fn update_ui(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(mut settings): Json<UiCustomization>,
) -> Result<Json<UiCustomization>, ProblemResponse> {
    auth.require(Permission::AdminSettings)?;
    // The logo only changes through the upload endpoint.
    let current: UiCustomization = state.storage().customizations().get(UI_KIND).await?;
    settings.logo_path = current.logo_path;
    state
        .storage()
        .customizations()
        .put(UI_KIND, &settings, Some(auth.user.id), state.now())
        .await?;
    info!(stage = "settings", kind = UI_KIND, "customization updated");
    Ok(Json(settings))
}

pub async fn show_pdf(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<PdfCustomization>, ProblemResponse> {
    Ok(Json(state.storage().customizations().get(PDF_KIND).await?))
}

pub async fn update_pdf(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(mut settings): Json<PdfCustomization>,
) -> Result<Json<PdfCustomization>, ProblemResponse> {
    auth.require(Permission::AdminSettings)?;
    let current: PdfCustomization = state.storage().customizations().get(PDF_KIND).await?;
    settings.logo_path = current.logo_path;
    state
        .storage()
        .customizations()
        .put(PDF_KIND, &settings, Some(auth.user.id), state.now())
        .await?;
    info!(stage = "settings", kind = PDF_KIND, "customization updated");
    Ok(Json(settings))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogoTarget {
    Ui,
    Pdf,
}

impl LogoTarget {
    fn parse(value: Option<&str>) -> Result<Self, ProblemResponse> {
        match value.map(str::trim).unwrap_or("ui") {
            "" | "ui" => Ok(Self::Ui),
            "pdf" => Ok(Self::Pdf),
            other => Err(ProblemResponse::bad_request(
                "invalid_kind",
                format!("unknown logo kind {other}"),
            )),
        }
    }
}

/// Swaps the logo path on the stored settings and returns the previous one.
async fn replace_logo(
    state: &AppState,
    auth: &AuthUser,
    target: LogoTarget,
    logo_path: Option<String>,
) -> Result<Option<String>, ProblemResponse> {
    let store = state.storage().customizations();
    let previous = match target {
        LogoTarget::Ui => {
            let mut settings: UiCustomization = store.get(UI_KIND).await?;
            let previous = std::mem::replace(&mut settings.logo_path, logo_path);
            store.put(UI_KIND, &settings, Some(auth.user.id), state.now()).await?;
            previous
        }
        LogoTarget::Pdf => {
            let mut settings: PdfCustomization = store.get(PDF_KIND).await?;
            let previous = std::mem::replace(&mut settings.logo_path, logo_path);
            store.put(PDF_KIND, &settings, Some(auth.user.id), state.now()).await?;
            previous
        }
    };
    Ok(previous)
}

/// Multipart `logo` file plus an optional `kind` field (`ui` or `pdf`).
pub async fn upload_logo(
    State(state): State<AppState>,
    auth: AuthUser,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ProblemResponse> {
    auth.require(Permission::AdminSettings)?;
    let form = read_upload(&mut multipart, "logo").await?;
    let target = LogoTarget::parse(form.field("kind"))?;
    let file = form
        .file
        .ok_or_else(|| ProblemResponse::bad_request("missing_file", "a logo file is required"))?;
    let extension = image_extension(file.content_type.as_deref())
        .ok_or_else(|| ProblemResponse::bad_request("invalid_upload", "only image files are accepted"))?;

    let path = store_upload(&state, &file.bytes, extension).await?;
    let previous = match replace_logo(&state, &auth, target, Some(path.clone())).await {
        Ok(previous) => previous,
        Err(err) => {
            remove_upload(&state, &path).await;
            return Err(err);
        }
    };
    if let Some(previous) = previous {
        remove_upload(&state, &previous).await;
    }
    Ok(Json(serde_json::json!({ "logo_path": path })))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoQuery {
    kind: Option<String>,
}

pub async fn remove_logo(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<LogoQuery>,
) -> Result<StatusCode, ProblemResponse> {
    auth.require(Permission::AdminSettings)?;
    let target = LogoTarget::parse(query.kind.as_deref())?;
    if let Some(previous) = replace_logo(&state, &auth, target, None).await? {
        remove_upload(&state, &previous).await;
    }
    Ok(StatusCode::NO_CONTENT)
}
