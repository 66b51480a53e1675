//! Defines routes for the storage API.
//!
//! ## Structure
//! - **Health endpoints**
//!   - `GET    /healthz`
//!   - `GET    /readyz`
//!
//! - **Type-level endpoints**
//!   - `GET    /storage/accounts` - serviced account names
//!   - `GET    /storage/{account}/{object_type}` - list (supports applications, skipIndex)
//!
//! - **Object-level endpoints**
//!   - `PUT    /storage/{account}/{object_type}/{*key}` - store object (supports filename, update)
//!   - `GET    /storage/{account}/{object_type}/{*key}` - load object
//!   - `DELETE /storage/{account}/{object_type}/{*key}` - delete object
//!
//! The wildcard `*key` allows keys that are full object paths.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        storage_handlers::{delete_object, get_object, list_accounts, list_objects, put_object},
    },
    services::storage_service::ObjectStoreStorageService,
};
use axum::{Router, routing::get};

/// Build and return the router for all storage routes.
///
/// The router carries shared state (`ObjectStoreStorageService`) to all handlers.
pub fn routes() -> Router<ObjectStoreStorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/storage/accounts", get(list_accounts))
        // Object-level routes
        .route(
            "/storage/{account}/{object_type}/{*key}",
            get(get_object).put(put_object).delete(delete_object),
        )
        // Type-level routes
        .route("/storage/{account}/{object_type}", get(list_objects))
}
