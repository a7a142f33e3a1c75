//! Durable outbox and inbox-seen persistence.
//!
//! The outbox table is the source of truth for pending sends: jobs survive
//! crashes and restarts, and are deleted only on server ACK. The inbox table
//! is the bounded processed-set the reconciler dedupes against.

use sqlx::Row;

use crate::{
    error::StoreError,
    models::{ConversationRow, JobState, OutboxJobRow},
    Store,
};

/// Cap on the per-conversation processed set.
pub const INBOX_SEEN_PER_CONVERSATION_MAX: i64 = 1024;

impl Store {
    // ── Outbox jobs ──────────────────────────────────────────────────────

    /// Insert a job if absent. Enqueue is idempotent on `job_id`: a second
    /// insert of the same id is a no-op and reports `false`.
    pub async fn insert_outbox_job(&self, row: &OutboxJobRow) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO outbox_jobs \
             (job_id, conversation_id, message_id, kind, state, counter, retry_count, \
              next_attempt_at, created_at, updated_at, payload, last_error, last_error_code, last_status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.job_id)
        .bind(&row.conversation_id)
        .bind(&row.message_id)
        .bind(&row.kind)
        .bind(&row.state)
        .bind(row.counter)
        .bind(row.retry_count)
        .bind(row.next_attempt_at)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(&row.payload)
        .bind(&row.last_error)
        .bind(&row.last_error_code)
        .bind(row.last_status)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_outbox_job(&self, job_id: &str) -> Result<Option<OutboxJobRow>, StoreError> {
        let row = sqlx::query_as::<_, OutboxJobRow>(
            "SELECT * FROM outbox_jobs WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// All conversations holding work that is not sent or dead-lettered.
    pub async fn conversations_with_pending_jobs(&self) -> Result<Vec<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT conversation_id FROM outbox_jobs WHERE state IN ('queued', 'inflight') \
             ORDER BY conversation_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn pending_jobs_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<OutboxJobRow>, StoreError> {
        let rows = sqlx::query_as::<_, OutboxJobRow>(
            "SELECT * FROM outbox_jobs WHERE conversation_id = ? AND state IN ('queued', 'inflight') \
             ORDER BY created_at ASC, job_id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_job_state(&self, job_id: &str, state: JobState) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox_jobs SET state = ?, updated_at = ? WHERE job_id = ?")
            .bind(state.as_str())
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed attempt: bumps retry count, reschedules, keeps the
    /// error details for dashboards.
    pub async fn record_job_failure(
        &self,
        job_id: &str,
        state: JobState,
        next_attempt_at: i64,
        error: &str,
        error_code: &str,
        status: Option<i64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_jobs SET state = ?, retry_count = retry_count + 1, next_attempt_at = ?, \
             last_error = ?, last_error_code = ?, last_status = ?, updated_at = ? WHERE job_id = ?",
        )
        .bind(state.as_str())
        .bind(next_attempt_at)
        .bind(error)
        .bind(error_code)
        .bind(status)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a job after a successful ACK. The record's lifecycle ends here.
    pub async fn delete_outbox_job(&self, job_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM outbox_jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Earliest `next_attempt_at` across queued jobs that are not yet due —
    /// the single wake-up timer target.
    pub async fn earliest_pending_attempt(&self, now_ms: i64) -> Result<Option<i64>, StoreError> {
        let at: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(next_attempt_at) FROM outbox_jobs WHERE state = 'queued' AND next_attempt_at > ?",
        )
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(at)
    }

    // ── Inbox seen-set ───────────────────────────────────────────────────

    pub async fn is_inbox_seen(
        &self,
        conversation_id: &str,
        server_message_id: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM inbox_seen WHERE conversation_id = ? AND server_message_id = ? AND message_id = ?",
        )
        .bind(conversation_id)
        .bind(server_message_id)
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Record an incoming item. Returns `false` when the triple was already
    /// present (duplicate push/pull delivery).
    pub async fn mark_inbox_seen(
        &self,
        conversation_id: &str,
        server_message_id: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO inbox_seen (conversation_id, server_message_id, message_id, seen_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(server_message_id)
        .bind(message_id)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            self.prune_inbox_seen(conversation_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn prune_inbox_seen(&self, conversation_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM inbox_seen WHERE conversation_id = ?1 AND seen_at NOT IN \
             (SELECT seen_at FROM inbox_seen WHERE conversation_id = ?1 \
              ORDER BY seen_at DESC LIMIT ?2)",
        )
        .bind(conversation_id)
        .bind(INBOX_SEEN_PER_CONVERSATION_MAX)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Conversations ────────────────────────────────────────────────────

    pub async fn upsert_conversation(&self, row: &ConversationRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversations \
             (conversation_id, conversation_token, peer_account_digest, peer_device_id, \
              deletion_cursor, peer_deletion_cursor, tombstoned) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(conversation_id) DO UPDATE SET \
               conversation_token = excluded.conversation_token, \
               tombstoned = excluded.tombstoned",
        )
        .bind(&row.conversation_id)
        .bind(&row.conversation_token)
        .bind(&row.peer_account_digest)
        .bind(&row.peer_device_id)
        .bind(row.deletion_cursor)
        .bind(row.peer_deletion_cursor)
        .bind(row.tombstoned)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationRow>, StoreError> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT * FROM conversations ORDER BY conversation_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRow>, StoreError> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT * FROM conversations WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Monotone cursor update; a regression is a no-op and reports `false`.
    pub async fn raise_deletion_cursor(
        &self,
        conversation_id: &str,
        cursor: i64,
        peer_side: bool,
    ) -> Result<bool, StoreError> {
        let column = if peer_side { "peer_deletion_cursor" } else { "deletion_cursor" };
        let result = sqlx::query(&format!(
            "UPDATE conversations SET {column} = ? \
             WHERE conversation_id = ? AND ({column} IS NULL OR {column} < ?)"
        ))
        .bind(cursor)
        .bind(conversation_id)
        .bind(cursor)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_conversation_tombstoned(
        &self,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE conversations SET tombstoned = 1 WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rough pending-work telemetry used by the lifecycle coordinator.
    pub async fn outbox_depth(&self) -> Result<(i64, i64), StoreError> {
        let row = sqlx::query(
            "SELECT \
               COALESCE(SUM(CASE WHEN state IN ('queued','inflight') THEN 1 ELSE 0 END), 0) AS pending, \
               COALESCE(SUM(CASE WHEN state = 'dead-letter' THEN 1 ELSE 0 END), 0) AS dead \
             FROM outbox_jobs",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get::<i64, _>("pending"), row.get::<i64, _>("dead")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{job_id, JobKind};
    use crate::vault::Vault;

    fn row(kind: JobKind, conv: &str, msg: &str, counter: Option<i64>, created_at: i64) -> OutboxJobRow {
        OutboxJobRow {
            job_id: job_id(kind, conv, msg),
            conversation_id: conv.into(),
            message_id: msg.into(),
            kind: kind.as_str().into(),
            state: JobState::Queued.as_str().into(),
            counter,
            retry_count: 0,
            next_attempt_at: 0,
            created_at,
            updated_at: created_at,
            payload: "{}".into(),
            last_error: None,
            last_error_code: None,
            last_status: None,
        }
    }

    async fn store() -> Store {
        Store::open_in_memory(Vault::new()).await.expect("open store")
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_on_job_id() {
        let store = store().await;
        let r = row(JobKind::Message, "c1", "m1", Some(5), 100);
        assert!(store.insert_outbox_job(&r).await.unwrap());
        assert!(!store.insert_outbox_job(&r).await.unwrap());

        let pending = store.pending_jobs_for_conversation("c1").await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn jobs_are_deleted_on_ack() {
        let store = store().await;
        let r = row(JobKind::Message, "c1", "m1", Some(5), 100);
        store.insert_outbox_job(&r).await.unwrap();
        store.delete_outbox_job(&r.job_id).await.unwrap();
        assert!(store.get_outbox_job(&r.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inbox_seen_dedupes_on_triple() {
        let store = store().await;
        assert!(store.mark_inbox_seen("c1", "srv-1", "m1").await.unwrap());
        assert!(!store.mark_inbox_seen("c1", "srv-1", "m1").await.unwrap());
        assert!(store.mark_inbox_seen("c1", "srv-2", "m1").await.unwrap());
    }

    #[tokio::test]
    async fn deletion_cursor_is_monotone_in_storage() {
        let store = store().await;
        store
            .upsert_conversation(&ConversationRow {
                conversation_id: "c1".into(),
                conversation_token: "t".into(),
                peer_account_digest: "AB".into(),
                peer_device_id: "d".into(),
                deletion_cursor: None,
                peer_deletion_cursor: None,
                tombstoned: false,
            })
            .await
            .unwrap();

        assert!(store.raise_deletion_cursor("c1", 7, false).await.unwrap());
        assert!(!store.raise_deletion_cursor("c1", 3, false).await.unwrap());
        assert!(!store.raise_deletion_cursor("c1", 7, false).await.unwrap());
        assert!(store.raise_deletion_cursor("c1", 8, false).await.unwrap());

        let conv = store.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.deletion_cursor, Some(8));
    }

    #[tokio::test]
    async fn earliest_pending_attempt_skips_due_jobs() {
        let store = store().await;
        let mut a = row(JobKind::Message, "c1", "m1", Some(1), 100);
        a.next_attempt_at = 0; // due now
        let mut b = row(JobKind::Message, "c1", "m2", Some(2), 100);
        b.next_attempt_at = 5000;
        let mut c = row(JobKind::Message, "c2", "m3", Some(1), 100);
        c.next_attempt_at = 9000;
        for r in [&a, &b, &c] {
            store.insert_outbox_job(r).await.unwrap();
        }
        assert_eq!(store.earliest_pending_attempt(1000).await.unwrap(), Some(5000));
    }
}
