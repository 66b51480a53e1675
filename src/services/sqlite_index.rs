//! SQLite-backed canary-config index.
//!
//! Summaries live in `canary_config_summaries`; staged mutations live in
//! `canary_config_pending_updates` until they are finished or removed.

use crate::{
    models::canary_config::{CanaryConfigSummary, IndexAction},
    services::canary_index::{
        CanaryConfigIndex, IndexError, IndexResult, applications_overlap,
    },
};
use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// A staged index mutation as stored in the pending-updates table.
#[derive(Clone, Debug, FromRow)]
pub struct PendingUpdate {
    pub account: String,
    pub action: String,
    pub correlation_id: String,
    pub started_timestamp: i64,
    pub summary_json: String,
}

#[derive(FromRow)]
struct SummaryRow {
    id: String,
    name: String,
    updated_timestamp: i64,
    updated_timestamp_iso: String,
    applications: String,
}

impl SummaryRow {
    fn into_summary(self) -> IndexResult<CanaryConfigSummary> {
        let applications = serde_json::from_str(&self.applications).map_err(|source| {
            IndexError::MalformedSummary {
                subject: self.id.clone(),
                source,
            }
        })?;
        Ok(CanaryConfigSummary {
            id: self.id,
            name: self.name,
            updated_timestamp: self.updated_timestamp,
            updated_timestamp_iso: self.updated_timestamp_iso,
            applications,
        })
    }
}

pub struct SqliteCanaryConfigIndex {
    db: SqlitePool,
    /// Highest timestamp handed out so far.
    last_timestamp: AtomicI64,
}

impl SqliteCanaryConfigIndex {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            last_timestamp: AtomicI64::new(0),
        }
    }

    /// Create the index tables if they do not exist yet.
    pub async fn migrate(&self) -> IndexResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} index migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&self.db).await?;
        }
        Ok(())
    }

    /// Pending updates of an account that were never finished or removed.
    pub async fn pending_updates(&self, account: &str) -> IndexResult<Vec<PendingUpdate>> {
        let rows = sqlx::query_as::<_, PendingUpdate>(
            "SELECT account, action, correlation_id, started_timestamp, summary_json
             FROM canary_config_pending_updates
             WHERE account = ?
             ORDER BY started_timestamp ASC",
        )
        .bind(account)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn summaries_for_account(&self, account: &str) -> IndexResult<Vec<CanaryConfigSummary>> {
        sqlx::query_as::<_, SummaryRow>(
            "SELECT id, name, updated_timestamp, updated_timestamp_iso, applications
             FROM canary_config_summaries
             WHERE account = ?
             ORDER BY name ASC, id ASC",
        )
        .bind(account)
        .fetch_all(&self.db)
        .await?
        .into_iter()
        .map(SummaryRow::into_summary)
        .collect()
    }
}

#[async_trait]
impl CanaryConfigIndex for SqliteCanaryConfigIndex {
    async fn current_timestamp(&self) -> IndexResult<i64> {
        let now = sqlx::query_scalar::<_, i64>(
            "SELECT CAST(ROUND((julianday('now') - 2440587.5) * 86400000.0) AS INTEGER)",
        )
        .fetch_one(&self.db)
        .await?;
        let previous = self.last_timestamp.fetch_max(now, Ordering::SeqCst);
        Ok(previous.max(now))
    }

    async fn start_pending_update(
        &self,
        account: &str,
        timestamp: i64,
        action: IndexAction,
        correlation_id: &str,
        summary_json: &str,
    ) -> IndexResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO canary_config_pending_updates
                (account, action, correlation_id, started_timestamp, summary_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(account)
        .bind(action.as_str())
        .bind(correlation_id)
        .bind(timestamp)
        .bind(summary_json)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn finish_pending_update(
        &self,
        account: &str,
        action: IndexAction,
        correlation_id: &str,
    ) -> IndexResult<()> {
        let mut tx = self.db.begin().await?;

        let pending = sqlx::query_as::<_, PendingUpdate>(
            "SELECT account, action, correlation_id, started_timestamp, summary_json
             FROM canary_config_pending_updates
             WHERE account = ? AND action = ? AND correlation_id = ?",
        )
        .bind(account)
        .bind(action.as_str())
        .bind(correlation_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(pending) = pending else {
            debug!(
                "no pending {} {} for account {}; nothing to finish",
                action.as_str(),
                correlation_id,
                account
            );
            return Ok(());
        };

        let summary: CanaryConfigSummary =
            serde_json::from_str(&pending.summary_json).map_err(|source| {
                IndexError::MalformedSummary {
                    subject: correlation_id.to_string(),
                    source,
                }
            })?;

        match action {
            IndexAction::Update => {
                let applications = serde_json::to_string(&summary.applications).map_err(
                    |source| IndexError::MalformedSummary {
                        subject: summary.id.clone(),
                        source,
                    },
                )?;
                sqlx::query(
                    "INSERT INTO canary_config_summaries
                        (account, id, name, updated_timestamp, updated_timestamp_iso, applications)
                     VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT(account, id) DO UPDATE SET
                        name = excluded.name,
                        updated_timestamp = excluded.updated_timestamp,
                        updated_timestamp_iso = excluded.updated_timestamp_iso,
                        applications = excluded.applications",
                )
                .bind(account)
                .bind(&summary.id)
                .bind(&summary.name)
                .bind(summary.updated_timestamp)
                .bind(&summary.updated_timestamp_iso)
                .bind(applications)
                .execute(&mut *tx)
                .await?;
            }
            IndexAction::Delete => {
                sqlx::query("DELETE FROM canary_config_summaries WHERE account = ? AND id = ?")
                    .bind(account)
                    .bind(&summary.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            "DELETE FROM canary_config_pending_updates
             WHERE account = ? AND action = ? AND correlation_id = ?",
        )
        .bind(account)
        .bind(action.as_str())
        .bind(correlation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            "finished pending {} {} for canary config {}",
            action.as_str(),
            correlation_id,
            summary.id
        );
        Ok(())
    }

    async fn remove_failed_pending_update(
        &self,
        account: &str,
        _timestamp: i64,
        action: IndexAction,
        correlation_id: &str,
        _summary_json: &str,
    ) -> IndexResult<()> {
        let result = sqlx::query(
            "DELETE FROM canary_config_pending_updates
             WHERE account = ? AND action = ? AND correlation_id = ?",
        )
        .bind(account)
        .bind(action.as_str())
        .bind(correlation_id)
        .execute(&self.db)
        .await?;
        debug!(
            "removed {} pending {} row(s) for {}",
            result.rows_affected(),
            action.as_str(),
            correlation_id
        );
        Ok(())
    }

    async fn id_from_name(
        &self,
        account: &str,
        name: &str,
        applications: &[String],
        candidate_id: &str,
    ) -> IndexResult<Option<String>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, name, updated_timestamp, updated_timestamp_iso, applications
             FROM canary_config_summaries
             WHERE account = ? AND name = ? AND id <> ?
             ORDER BY updated_timestamp DESC, id ASC",
        )
        .bind(account)
        .bind(name)
        .bind(candidate_id)
        .fetch_all(&self.db)
        .await?;

        for row in rows {
            let summary = row.into_summary()?;
            if applications_overlap(&summary.applications, applications) {
                return Ok(Some(summary.id));
            }
        }
        Ok(None)
    }

    async fn summary_from_id(
        &self,
        account: &str,
        id: &str,
    ) -> IndexResult<Option<CanaryConfigSummary>> {
        sqlx::query_as::<_, SummaryRow>(
            "SELECT id, name, updated_timestamp, updated_timestamp_iso, applications
             FROM canary_config_summaries
             WHERE account = ? AND id = ?",
        )
        .bind(account)
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .map(SummaryRow::into_summary)
        .transpose()
    }

    async fn summary_set(
        &self,
        account: &str,
        applications: &[String],
    ) -> IndexResult<Vec<CanaryConfigSummary>> {
        let summaries = self.summaries_for_account(account).await?;
        Ok(summaries
            .into_iter()
            .filter(|s| applications_overlap(&s.applications, applications))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn index() -> SqliteCanaryConfigIndex {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let index = SqliteCanaryConfigIndex::new(pool);
        index.migrate().await.unwrap();
        index
    }

    fn summary_json(id: &str, name: &str, ts: i64, apps: &[&str]) -> String {
        let apps = apps.iter().map(|a| a.to_string()).collect();
        serde_json::to_string(&CanaryConfigSummary::new(id, name, ts, apps)).unwrap()
    }

    #[tokio::test]
    async fn timestamps_never_go_backwards() {
        let index = index().await;
        let first = index.current_timestamp().await.unwrap();
        index.last_timestamp.store(first + 60_000, Ordering::SeqCst);
        let second = index.current_timestamp().await.unwrap();
        assert_eq!(second, first + 60_000);
        assert!(first > 1_600_000_000_000);
    }

    #[tokio::test]
    async fn finished_update_becomes_visible() {
        let index = index().await;
        let json = summary_json("abc", "my-canary", 5, &["app1"]);
        index
            .start_pending_update("acct", 5, IndexAction::Update, "c1", &json)
            .await
            .unwrap();
        assert!(index.summary_from_id("acct", "abc").await.unwrap().is_none());
        assert_eq!(index.pending_updates("acct").await.unwrap().len(), 1);

        index
            .finish_pending_update("acct", IndexAction::Update, "c1")
            .await
            .unwrap();
        let summary = index.summary_from_id("acct", "abc").await.unwrap().unwrap();
        assert_eq!(summary.name, "my-canary");
        assert_eq!(summary.applications, vec!["app1".to_string()]);
        assert!(index.pending_updates("acct").await.unwrap().is_empty());

        // finishing twice is harmless
        index
            .finish_pending_update("acct", IndexAction::Update, "c1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn removed_update_leaves_no_trace() {
        let index = index().await;
        let json = summary_json("abc", "my-canary", 5, &["app1"]);
        index
            .start_pending_update("acct", 5, IndexAction::Update, "c1", &json)
            .await
            .unwrap();
        index
            .remove_failed_pending_update("acct", 5, IndexAction::Update, "c1", &json)
            .await
            .unwrap();
        index
            .remove_failed_pending_update("acct", 5, IndexAction::Update, "c1", &json)
            .await
            .unwrap();
        index
            .finish_pending_update("acct", IndexAction::Update, "c1")
            .await
            .unwrap();
        assert!(index.summary_from_id("acct", "abc").await.unwrap().is_none());
        assert!(index.pending_updates("acct").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_summary() {
        let index = index().await;
        let json = summary_json("abc", "my-canary", 5, &["app1"]);
        index
            .start_pending_update("acct", 5, IndexAction::Update, "c1", &json)
            .await
            .unwrap();
        index
            .finish_pending_update("acct", IndexAction::Update, "c1")
            .await
            .unwrap();
        index
            .start_pending_update("acct", 6, IndexAction::Delete, "c2", &json)
            .await
            .unwrap();
        index
            .finish_pending_update("acct", IndexAction::Delete, "c2")
            .await
            .unwrap();
        assert!(index.summary_from_id("acct", "abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn name_lookup_respects_application_scope_and_account() {
        let index = index().await;
        for (id, apps, corr) in [("abc", &["app1"][..], "c1"), ("def", &["app2"][..], "c2")] {
            let json = summary_json(id, "shared", 5, apps);
            index
                .start_pending_update("acct", 5, IndexAction::Update, corr, &json)
                .await
                .unwrap();
            index
                .finish_pending_update("acct", IndexAction::Update, corr)
                .await
                .unwrap();
        }

        let app2 = vec!["app2".to_string()];
        let app3 = vec!["app3".to_string()];
        assert_eq!(
            index.id_from_name("acct", "shared", &app2, "new").await.unwrap().as_deref(),
            Some("def")
        );
        assert!(index.id_from_name("acct", "shared", &app3, "new").await.unwrap().is_none());
        assert!(index.id_from_name("other", "shared", &app2, "new").await.unwrap().is_none());

        assert_eq!(index.summary_set("acct", &[]).await.unwrap().len(), 2);
        let scoped = index.summary_set("acct", &app2).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, "def");
    }

    #[tokio::test]
    async fn name_lookup_skips_the_candidate_itself() {
        let index = index().await;
        // The candidate's own summary is the most recent one.
        for (id, apps, ts, corr) in [
            ("abc", &["app1"][..], 5, "c1"),
            ("def", &["app1", "app2"][..], 9, "c2"),
        ] {
            let json = summary_json(id, "shared", ts, apps);
            index
                .start_pending_update("acct", ts, IndexAction::Update, corr, &json)
                .await
                .unwrap();
            index
                .finish_pending_update("acct", IndexAction::Update, corr)
                .await
                .unwrap();
        }

        let scope = vec!["app1".to_string(), "app2".to_string()];
        assert_eq!(
            index.id_from_name("acct", "shared", &scope, "def").await.unwrap().as_deref(),
            Some("abc")
        );
        let app2 = vec!["app2".to_string()];
        assert!(index.id_from_name("acct", "shared", &app2, "def").await.unwrap().is_none());
    }
}
