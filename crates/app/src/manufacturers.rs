use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use cabinet_portal_core::types::{
    AssemblyCost, AssemblyFeeKind, CatalogItem, CatalogItemInput, CatalogModification,
    CatalogModificationInput, Id, Manufacturer, ManufacturerInput, StyleSummary,
};
use cabinet_portal_core::{Page, PageRequest, Permission, Validator};
use cabinet_portal_storage::{CatalogError, CatalogFilter, ManufacturerError};

use crate::auth::AuthUser;
use crate::customization::{image_extension, read_upload, remove_upload, store_upload};
use crate::problem::ProblemResponse;
use crate::router::{flag, non_empty, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ManufacturerQuery {
    include_disabled: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CatalogQuery {
    page: Option<String>,
    limit: Option<String>,
    search: Option<String>,
    style: Option<String>,
    include_discontinued: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct AssemblyCostBody {
    manufacturer_id: Id,
    #[serde(default)]
    catalog_item_id: Option<Id>,
    #[serde(default)]
    style: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    price: f64,
}

/// Disabled manufacturers are hidden from everyone but admins.
async fn load(state: &AppState, auth: &AuthUser, id: Id) -> Result<Manufacturer, ProblemResponse> {
    auth.require(Permission::ManufacturersRead)?;
    let manufacturer = state
        .storage()
        .manufacturers()
        .find(id)
        .await?
        .ok_or(ManufacturerError::NotFound)?;
    if !manufacturer.enabled && !auth.actor.is_admin() {
        return Err(ManufacturerError::NotFound.into());
    }
    Ok(manufacturer)
}

async fn load_item(state: &AppState, id: Id) -> Result<CatalogItem, ProblemResponse> {
    Ok(state
        .storage()
        .catalog()
        .find(id)
        .await?
        .ok_or(CatalogError::NotFound)?)
}

pub async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ManufacturerQuery>,
) -> Result<Json<Vec<Manufacturer>>, ProblemResponse> {
    auth.require(Permission::ManufacturersRead)?;
    let include_disabled = auth.actor.is_admin() && flag(query.include_disabled.as_deref());
    let manufacturers = state
        .storage()
        .manufacturers()
        .list(include_disabled)
        .await?;
    Ok(Json(manufacturers))
}

pub async fn show(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<Manufacturer>, ProblemResponse> {
    Ok(Json(load(&state, &auth, id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(input): Json<ManufacturerInput>,
) -> Result<(StatusCode, Json<Manufacturer>), ProblemResponse> {
    auth.require(Permission::AdminManufacturers)?;
    input.validate()?;
    let manufacturer = state
        .storage()
        .manufacturers()
        .create(&input, state.now())
        .await?;
    info!(stage = "catalog", manufacturer_id = manufacturer.id, name = %manufacturer.name, "manufacturer created");
    Ok((StatusCode::CREATED, Json(manufacturer)))
}

pub async fn update(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Json(input): Json<ManufacturerInput>,
) -> Result<Json<Manufacturer>, ProblemResponse> {
    auth.require(Permission::AdminManufacturers)?;
    input.validate()?;
    let manufacturer = state
        .storage()
        .manufacturers()
        .update(id, &input, state.now())
        .await?;
    info!(stage = "catalog", manufacturer_id = id, "manufacturer updated");
    Ok(Json(manufacturer))
}

pub async fn set_status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Manufacturer>, ProblemResponse> {
    auth.require(Permission::AdminManufacturers)?;
    let manufacturer = state
        .storage()
        .manufacturers()
        .set_enabled(id, body.enabled, state.now())
        .await?;
    info!(stage = "catalog", manufacturer_id = id, enabled = body.enabled, "manufacturer status changed");
    Ok(Json(manufacturer))
}

/// Multipart upload of the manufacturer logo in field `image`.
pub async fn upload_image(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    mut multipart: Multipart,
) -> Result<Json<Manufacturer>, ProblemResponse> {
    auth.require(Permission::AdminManufacturers)?;
    load(&state, &auth, id).await?;

    let form = read_upload(&mut multipart, "image").await?;
    let file = form
        .file
        .ok_or_else(|| ProblemResponse::bad_request("missing_file", "an image file is required"))?;
    let extension = image_extension(file.content_type.as_deref())
        .ok_or_else(|| ProblemResponse::bad_request("invalid_upload", "only image files are accepted"))?;

    let path = store_upload(&state, &file.bytes, extension).await?;
    let previous = match state.storage().manufacturers().set_image(id, &path, state.now()).await {
        Ok(previous) => previous,
        Err(err) => {
            remove_upload(&state, &path).await;
            return Err(err.into());
        }
    };
    if let Some(previous) = previous {
        remove_upload(&state, &previous).await;
    }
    info!(stage = "catalog", manufacturer_id = id, image = %path, "manufacturer image stored");
    Ok(Json(load(&state, &auth, id).await?))
}

pub async fn styles(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<Vec<StyleSummary>>, ProblemResponse> {
    load(&state, &auth, id).await?;
    Ok(Json(state.storage().catalog().styles(id).await?))
}

pub async fn catalog(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<Page<CatalogItem>>, ProblemResponse> {
    load(&state, &auth, id).await?;
    let request = PageRequest::from_query(
        query.page.as_deref(),
        query.limit.as_deref(),
        PageRequest::DEFAULT_LIMIT,
        PageRequest::MAX_LIMIT,
    );
    let filter = CatalogFilter {
        search: non_empty(query.search.as_deref()).map(str::to_string),
        style: non_empty(query.style.as_deref()).map(str::to_string),
        include_discontinued: flag(query.include_discontinued.as_deref()),
    };
    Ok(Json(state.storage().catalog().list(id, request, &filter).await?))
}

pub async fn add_catalog_item(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Json(input): Json<CatalogItemInput>,
) -> Result<(StatusCode, Json<CatalogItem>), ProblemResponse> {
    auth.require(Permission::AdminManufacturers)?;
    input.validate()?;
    let item = state.storage().catalog().create(id, &input, state.now()).await?;
    info!(stage = "catalog", manufacturer_id = id, item_id = item.id, code = %item.code, "catalog item added");
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn update_catalog_item(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Json(input): Json<CatalogItemInput>,
) -> Result<Json<CatalogItem>, ProblemResponse> {
    auth.require(Permission::AdminManufacturers)?;
    input.validate()?;
    let item = state.storage().catalog().update(id, &input, state.now()).await?;
    Ok(Json(item))
}

/// Replaces the manufacturer's catalog with the rows of an uploaded CSV file.
pub async fn upload_catalog(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ProblemResponse> {
    auth.require(Permission::AdminManufacturers)?;
    load(&state, &auth, id).await?;

    let form = read_upload(&mut multipart, "file").await?;
    let file = form
        .file
        .ok_or_else(|| ProblemResponse::bad_request("missing_file", "a CSV file is required"))?;
    let parsed = parse_catalog_csv(&file.bytes)?;

    let imported = state
        .storage()
        .catalog()
        .replace_all(id, &parsed.rows, state.now())
        .await?;
    counter!("catalog_rows_imported_total").increment(imported);
    if parsed.skipped > 0 {
        warn!(stage = "catalog", manufacturer_id = id, skipped = parsed.skipped, "catalog rows without code skipped");
    }
    info!(stage = "catalog", manufacturer_id = id, imported, "catalog replaced from csv");
    Ok(Json(json!({ "imported": imported, "skipped": parsed.skipped })))
}

/// Sets the assembly fee on one item, or on every item (optionally of one style).
pub async fn assembly_cost(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<AssemblyCostBody>,
) -> Result<Json<Value>, ProblemResponse> {
    auth.require(Permission::AdminManufacturers)?;
    Validator::new().non_negative("price", body.price).finish()?;
    load(&state, &auth, body.manufacturer_id).await?;

    let cost = AssemblyCost {
        kind: body
            .kind
            .as_deref()
            .map(AssemblyFeeKind::parse)
            .unwrap_or(AssemblyFeeKind::Legacy),
        price: body.price,
    };
    let catalog = state.storage().catalog();
    let updated = match body.catalog_item_id {
        Some(item_id) => {
            let item = load_item(&state, item_id).await?;
            if item.manufacturer_id != body.manufacturer_id {
                return Err(CatalogError::NotFound.into());
            }
            catalog.set_assembly_cost(item_id, &cost, state.now()).await?
        }
        None => {
            catalog
                .set_assembly_cost_for_manufacturer(
                    body.manufacturer_id,
                    non_empty(body.style.as_deref()),
                    &cost,
                    state.now(),
                )
                .await?
        }
    };
    info!(
        stage = "catalog",
        manufacturer_id = body.manufacturer_id,
        kind = cost.kind.as_str(),
        updated,
        "assembly cost applied"
    );
    Ok(Json(json!({ "updated": updated })))
}

pub async fn modifications(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
) -> Result<Json<Vec<CatalogModification>>, ProblemResponse> {
    auth.require(Permission::ManufacturersRead)?;
    load_item(&state, id).await?;
    Ok(Json(state.storage().catalog().modifications(id).await?))
}

pub async fn add_modification(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Id>,
    Json(input): Json<CatalogModificationInput>,
) -> Result<(StatusCode, Json<CatalogModification>), ProblemResponse> {
    auth.require(Permission::AdminManufacturers)?;
    input.validate()?;
    load_item(&state, id).await?;
    let modification = state
        .storage()
        .catalog()
        .add_modification(id, &input, state.now())
        .await?;
    Ok((StatusCode::CREATED, Json(modification)))
}

#[derive(Debug, Default)]
struct ParsedCatalog {
    rows: Vec<CatalogItemInput>,
    skipped: u64,
}

#[derive(Debug, Clone, Copy)]
enum Column {
    Code,
    Style,
    Description,
    Color,
    Type,
    Price,
    Discontinued,
}

fn column_for(header: &str) -> Option<Column> {
    match header.trim().to_ascii_lowercase().as_str() {
        "item" | "code" | "item code" | "sku" => Some(Column::Code),
        "style" => Some(Column::Style),
        "description" => Some(Column::Description),
        "color" | "colour" => Some(Column::Color),
        "type" => Some(Column::Type),
        "price" => Some(Column::Price),
        "discontinued" => Some(Column::Discontinued),
        _ => None,
    }
}

fn parse_price(value: &str) -> f64 {
    let cleaned: String = value
        .chars()
        .filter(|ch| !matches!(ch, '$' | ',' | ' '))
        .collect();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|price| price.is_finite() && *price >= 0.0)
        .unwrap_or(0.0)
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Reads catalog rows keyed by header name. Rows without a code are skipped.
fn parse_catalog_csv(bytes: &[u8]) -> Result<ParsedCatalog, ProblemResponse> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let columns: Vec<Option<Column>> = reader
        .headers()
        .map_err(|err| ProblemResponse::bad_request("invalid_csv", err.to_string()))?
        .iter()
        .map(column_for)
        .collect();
    if !columns.iter().any(|column| matches!(column, Some(Column::Code))) {
        return Err(ProblemResponse::bad_request(
            "invalid_csv",
            "the CSV needs an Item or Code column",
        ));
    }

    let mut parsed = ParsedCatalog::default();
    for record in reader.records() {
        let record = record.map_err(|err| ProblemResponse::bad_request("invalid_csv", err.to_string()))?;
        let mut row = CatalogItemInput::default();
        for (column, value) in columns.iter().zip(record.iter()) {
            match column {
                Some(Column::Code) => row.code = value.trim().to_string(),
                Some(Column::Style) => row.style = optional(value),
                Some(Column::Description) => row.description = optional(value),
                Some(Column::Color) => row.color = optional(value),
                Some(Column::Type) => row.item_type = optional(value),
                Some(Column::Price) => row.price = parse_price(value),
                Some(Column::Discontinued) => row.discontinued = flag(Some(value)) || value.eq_ignore_ascii_case("y"),
                None => {}
            }
        }
        if row.code.is_empty() {
            parsed.skipped += 1;
            continue;
        }
        parsed.rows.push(row);
    }
    Ok(parsed)
}
