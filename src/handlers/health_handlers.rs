//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the index clock and every
//!   serviced account's bucket

use crate::services::storage_service::ObjectStoreStorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;

/// `GET /healthz`
///
/// Very small liveness probe; it always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Reads the index clock (one round trip to the index database).
/// 2. Fetches bucket info for each serviced account.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(service): State<ObjectStoreStorageService>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let index_check = match service.index().current_timestamp().await {
        Ok(_) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    checks.insert("index".to_string(), index_check);

    let account_names: Vec<String> = service.account_names().map(String::from).collect();
    for name in account_names {
        let check = match service.check_account(&name).await {
            Ok(_) => CheckStatus::ok(),
            Err(e) => CheckStatus::failed(e.to_string()),
        };
        checks.insert(format!("account:{}", name), check);
    }

    let overall_ok = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<String, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
