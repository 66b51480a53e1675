//! Canary configs and the summaries kept for them in the index.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The parts of a canary config the storage layer cares about.
///
/// Only `name` and `applications` drive indexing and the duplicate-name guard;
/// every other field is carried through untouched.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CanaryConfig {
    pub name: String,

    #[serde(default)]
    pub applications: Vec<String>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Index entry describing a canary config without its body.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryConfigSummary {
    pub id: String,
    pub name: String,
    pub updated_timestamp: i64,
    pub updated_timestamp_iso: String,
    pub applications: Vec<String>,
}

impl CanaryConfigSummary {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        updated_timestamp: i64,
        applications: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            updated_timestamp,
            updated_timestamp_iso: iso_millis(updated_timestamp),
            applications,
        }
    }
}

/// Mutation a pending index update stands for.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexAction {
    Update,
    Delete,
}

impl IndexAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexAction::Update => "UPDATE",
            IndexAction::Delete => "DELETE",
        }
    }
}

/// One entry of a listing, either read back from the index or derived from
/// a store scan. Scans only know `name` for canary configs and never know
/// `applications`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectListEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub updated_timestamp: i64,
    pub updated_timestamp_iso: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applications: Option<Vec<String>>,
}

impl From<CanaryConfigSummary> for ObjectListEntry {
    fn from(summary: CanaryConfigSummary) -> Self {
        Self {
            id: summary.id,
            name: Some(summary.name),
            updated_timestamp: summary.updated_timestamp,
            updated_timestamp_iso: summary.updated_timestamp_iso,
            applications: Some(summary.applications),
        }
    }
}

/// Render epoch millis the way summaries carry them (`2024-01-02T03:04:05.678Z`).
pub fn iso_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
