//! The canary-config summary index and the pending-update protocol used to
//! keep it in step with the object store.
//!
//! The index is not transactional with the store. Every mutation of a canary
//! config is therefore bracketed: a pending update is registered before the
//! remote write and then either finished (the staged summary becomes durable)
//! or removed (the staged summary is discarded). [`PendingIndexUpdate`] owns
//! one such bracket and records which way it was closed.

use crate::models::canary_config::{CanaryConfigSummary, IndexAction};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("malformed summary for `{subject}`: {source}")]
    MalformedSummary {
        subject: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("index unavailable: {0}")]
    Unavailable(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

#[async_trait]
pub trait CanaryConfigIndex: Send + Sync {
    /// Epoch millis from the index's own clock. Never decreases.
    async fn current_timestamp(&self) -> IndexResult<i64>;

    /// Register an in-flight mutation before the remote write is attempted.
    async fn start_pending_update(
        &self,
        account: &str,
        timestamp: i64,
        action: IndexAction,
        correlation_id: &str,
        summary_json: &str,
    ) -> IndexResult<()>;

    /// Make the staged summary durable. Finishing an unknown correlation id
    /// is a no-op.
    async fn finish_pending_update(
        &self,
        account: &str,
        action: IndexAction,
        correlation_id: &str,
    ) -> IndexResult<()>;

    /// Discard a staged summary after a failed remote write. Removing an
    /// unknown correlation id is a no-op.
    async fn remove_failed_pending_update(
        &self,
        account: &str,
        timestamp: i64,
        action: IndexAction,
        correlation_id: &str,
        summary_json: &str,
    ) -> IndexResult<()>;

    /// Id of a config other than `candidate_id` named `name` and declaring
    /// any of `applications`.
    async fn id_from_name(
        &self,
        account: &str,
        name: &str,
        applications: &[String],
        candidate_id: &str,
    ) -> IndexResult<Option<String>>;

    async fn summary_from_id(
        &self,
        account: &str,
        id: &str,
    ) -> IndexResult<Option<CanaryConfigSummary>>;

    /// Summaries of configs declaring any of `applications`; all configs of
    /// the account when `applications` is empty.
    async fn summary_set(
        &self,
        account: &str,
        applications: &[String],
    ) -> IndexResult<Vec<CanaryConfigSummary>>;
}

/// True when two application scopes intersect. An empty scope matches all.
pub fn applications_overlap(a: &[String], b: &[String]) -> bool {
    a.is_empty() || b.is_empty() || a.iter().any(|app| b.contains(app))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingState {
    Started,
    Committed,
    RolledBack,
}

/// One started pending update. Moves `Started -> Committed` via
/// [`commit`](Self::commit) or `Started -> RolledBack` via
/// [`roll_back`](Self::roll_back).
pub struct PendingIndexUpdate {
    index: Arc<dyn CanaryConfigIndex>,
    account: String,
    action: IndexAction,
    correlation_id: String,
    summary: CanaryConfigSummary,
    summary_json: String,
    state: PendingState,
}

impl PendingIndexUpdate {
    /// Serialize `summary`, stamp a fresh correlation id and register the
    /// pending update with the index.
    pub async fn start(
        index: Arc<dyn CanaryConfigIndex>,
        account: &str,
        action: IndexAction,
        summary: CanaryConfigSummary,
    ) -> IndexResult<Self> {
        let correlation_id = Uuid::new_v4().to_string();
        let summary_json =
            serde_json::to_string(&summary).map_err(|source| IndexError::MalformedSummary {
                subject: summary.id.clone(),
                source,
            })?;

        index
            .start_pending_update(
                account,
                summary.updated_timestamp,
                action,
                &correlation_id,
                &summary_json,
            )
            .await?;
        debug!(
            "started pending {} for canary config {} ({})",
            action.as_str(),
            summary.id,
            correlation_id
        );

        Ok(Self {
            index,
            account: account.to_string(),
            action,
            correlation_id,
            summary,
            summary_json,
            state: PendingState::Started,
        })
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn state(&self) -> PendingState {
        self.state
    }

    /// Finish the pending update. On error the update stays `Started` so the
    /// caller can still roll it back.
    pub async fn commit(&mut self) -> IndexResult<()> {
        if self.state != PendingState::Started {
            return Ok(());
        }
        self.index
            .finish_pending_update(&self.account, self.action, &self.correlation_id)
            .await?;
        self.state = PendingState::Committed;
        Ok(())
    }

    /// Remove the pending update. A failure here is logged and swallowed so
    /// it never hides the error that triggered the rollback.
    pub async fn roll_back(&mut self) {
        if self.state != PendingState::Started {
            return;
        }
        if let Err(err) = self
            .index
            .remove_failed_pending_update(
                &self.account,
                self.summary.updated_timestamp,
                self.action,
                &self.correlation_id,
                &self.summary_json,
            )
            .await
        {
            error!(
                "failed to remove pending {} {} for canary config {}: {}",
                self.action.as_str(),
                self.correlation_id,
                self.summary.id,
                err
            );
        }
        self.state = PendingState::RolledBack;
    }
}

impl Drop for PendingIndexUpdate {
    fn drop(&mut self) {
        if self.state == PendingState::Started {
            warn!(
                "pending {} {} for canary config {} dropped without finish or removal",
                self.action.as_str(),
                self.correlation_id,
                self.summary.id
            );
        }
    }
}
