//! HTTP handlers for loading, storing, deleting and listing stored objects.
//! Every handler is a thin shim over `ObjectStoreStorageService`.

use crate::{
    errors::AppError,
    models::{canary_config::ObjectListEntry, object_type::ObjectType},
    services::storage_service::{ObjectStoreStorageService, StorageService},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Value, json};

/// Query params accepted when listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Comma-separated application scope.
    pub applications: Option<String>,
    #[serde(default)]
    pub skip_index: bool,
}

/// Query params accepted when storing.
#[derive(Debug, Deserialize)]
pub struct StoreQuery {
    pub filename: Option<String>,
    #[serde(default)]
    pub update: bool,
}

fn parse_object_type(raw: &str) -> Result<ObjectType, AppError> {
    raw.parse::<ObjectType>()
        .map_err(|err| AppError::bad_request(err.to_string()))
}

fn split_applications(raw: Option<&str>) -> Vec<String> {
    raw.map(|apps| {
        apps.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

/// `GET /storage/accounts`: names of the accounts this service serves.
pub async fn list_accounts(State(service): State<ObjectStoreStorageService>) -> Json<Vec<String>> {
    Json(service.account_names().map(String::from).collect())
}

/// `GET /storage/{account}/{object_type}`: list object summaries.
pub async fn list_objects(
    State(service): State<ObjectStoreStorageService>,
    Path((account, object_type)): Path<(String, String)>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<ObjectListEntry>>, AppError> {
    let object_type = parse_object_type(&object_type)?;
    let applications = split_applications(q.applications.as_deref());
    let entries = service
        .list_object_keys(&account, object_type, &applications, q.skip_index)
        .await?;
    Ok(Json(entries))
}

/// `GET /storage/{account}/{object_type}/{*key}`: load an object as JSON.
pub async fn get_object(
    State(service): State<ObjectStoreStorageService>,
    Path((account, object_type, key)): Path<(String, String, String)>,
) -> Result<Json<Value>, AppError> {
    let object_type = parse_object_type(&object_type)?;
    let value: Value = service.load_object(&account, object_type, &key).await?;
    Ok(Json(value))
}

/// `PUT /storage/{account}/{object_type}/{*key}`: store an object.
///
/// The write runs on its own task so a dropped connection cannot strand a
/// pending index update.
pub async fn put_object(
    State(service): State<ObjectStoreStorageService>,
    Path((account, object_type, key)): Path<(String, String, String)>,
    Query(q): Query<StoreQuery>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let object_type = parse_object_type(&object_type)?;
    service
        .store_object_detached(account, object_type, key.clone(), body, q.filename, q.update)
        .await?;
    Ok((StatusCode::OK, Json(json!({ "id": key }))))
}

/// `DELETE /storage/{account}/{object_type}/{*key}`
pub async fn delete_object(
    State(service): State<ObjectStoreStorageService>,
    Path((account, object_type, key)): Path<(String, String, String)>,
) -> Result<StatusCode, AppError> {
    let object_type = parse_object_type(&object_type)?;
    service
        .delete_object_detached(account, object_type, key)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
