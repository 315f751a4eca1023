//! Intake guardian: recovers batches stuck in `processing`.
//!
//! A worker that dies mid-batch leaves the batch in `processing` forever.
//! The guardian runs on a schedule (and on demand via the ops endpoint),
//! promotes stale batches to `failed` with a timeout reason, and alerts.
//! It only touches batch bookkeeping and its own log entry; row data is
//! never dropped.

use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dfly_notify::DiscordNotifier;

pub const DEFAULT_STALE_MINUTES: i32 = 5;
/// Retries are not attempted yet; stuck means failed.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Result of one guardian pass.
#[derive(Debug, Clone, Default)]
pub struct GuardianResult {
    pub checked: usize,
    pub marked_failed: usize,
    pub errors: Vec<String>,
}

impl GuardianResult {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "checked": self.checked,
            "marked_failed": self.marked_failed,
            "errors": self.errors,
        })
    }
}

pub struct IntakeGuardian {
    pool: PgPool,
    pub stale_minutes: i32,
    pub max_retries: u32,
    notifier: Option<DiscordNotifier>,
}

impl IntakeGuardian {
    pub fn new(pool: PgPool) -> Self {
        IntakeGuardian {
            pool,
            stale_minutes: DEFAULT_STALE_MINUTES,
            max_retries: DEFAULT_MAX_RETRIES,
            notifier: DiscordNotifier::from_env(),
        }
    }

    pub fn with_stale_minutes(mut self, stale_minutes: i32) -> Self {
        self.stale_minutes = stale_minutes;
        self
    }

    pub fn with_notifier(mut self, notifier: Option<DiscordNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// One guardian pass: find stale `processing` batches, fail them, alert.
    ///
    /// Per-batch errors are collected and never abort the scan.
    pub async fn check_stuck_batches(&self) -> GuardianResult {
        let mut result = GuardianResult::default();

        info!(stale_minutes = self.stale_minutes, "guardian: checking for stuck batches");

        let stuck: Vec<(Uuid, Option<String>)> = match sqlx::query_as(
            r#"
            select id, filename
              from ops.ingest_batches
             where status = 'processing'
               and updated_at < now() - make_interval(mins => $1)
             order by updated_at asc
            "#,
        )
        .bind(self.stale_minutes)
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                let msg = format!("guardian scan failed: {e}");
                error!("{msg}");
                result.errors.push(msg);
                return result;
            }
        };

        result.checked = stuck.len();
        if stuck.is_empty() {
            debug!("guardian: no stuck batches found");
            return result;
        }

        warn!(count = stuck.len(), "guardian: found stuck batches");
        let reason = format!("Guardian detected timeout (> {} minutes)", self.stale_minutes);

        for (batch_id, filename) in stuck {
            match self.mark_batch_failed(batch_id, &reason).await {
                Ok(()) => {
                    result.marked_failed += 1;
                    self.send_alert(batch_id, filename.as_deref().unwrap_or("unknown"))
                        .await;
                }
                Err(e) => {
                    let msg = format!("failed to recover batch {batch_id}: {e}");
                    error!("{msg}");
                    result.errors.push(msg);
                }
            }
        }

        info!(
            checked = result.checked,
            marked_failed = result.marked_failed,
            errors = result.errors.len(),
            "guardian: pass complete"
        );
        result
    }

    /// Atomically fail the batch and append its row-level log entry
    /// (NULL row index marks a batch-scope entry).
    async fn mark_batch_failed(&self, batch_id: Uuid, reason: &str) -> anyhow::Result<()> {
        warn!(%batch_id, "guardian: marking batch as failed");

        let mut tx = self.pool.begin().await?;

        // The status guard makes concurrent guardian passes race-free: the
        // second pass updates zero rows and writes no duplicate log entry.
        let updated = sqlx::query(
            r#"
            update ops.ingest_batches
               set status = 'failed',
                   error_summary = $2,
                   completed_at = now()
             where id = $1
               and status = 'processing'
            "#,
        )
        .bind(batch_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            insert into ops.intake_logs (batch_id, row_index, status, judgment_id, error_details)
            values ($1, null, 'error', null, $2)
            "#,
        )
        .bind(batch_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn send_alert(&self, batch_id: Uuid, filename: &str) {
        let Some(notifier) = &self.notifier else {
            debug!("guardian: alert sink not configured, alert skipped");
            return;
        };

        let message = format!(
            "Intake Guardian: batch `{batch_id}` marked FAILED due to inactivity \
             (> {} minutes). Filename: `{filename}`",
            self.stale_minutes
        );

        match notifier.send(&message, "Intake Guardian").await {
            Ok(true) => debug!(%batch_id, "guardian: alert sent"),
            Ok(false) => debug!(%batch_id, "guardian: alert rejected by sink"),
            Err(e) => warn!(%batch_id, error = %e, "guardian: failed to send alert"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_json_shape() {
        let r = GuardianResult {
            checked: 3,
            marked_failed: 2,
            errors: vec!["x".to_string()],
        };
        let v = r.to_json();
        assert_eq!(v["checked"], 3);
        assert_eq!(v["marked_failed"], 2);
        assert_eq!(v["errors"][0], "x");
    }
}
