//! Durable event queue over the `webhook_events` table.
//!
//! Producers (the webhook receiver, the backfill tool) insert rows in
//! `queued` status; the worker claims one row at a time, advances it, and
//! finalizes it as `done` or `failed`. Rows are never deleted: the table
//! is an append-only history of ingestion attempts. A `failed` row is
//! retried only by an explicit operator requeue.

use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use thiserror::Error;

use crate::db::{DbError, RideDb};

/// Lifecycle of one queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Queued => "queued",
            EventStatus::Processing => "processing",
            EventStatus::Done => "done",
            EventStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(EventStatus::Queued),
            "processing" => Ok(EventStatus::Processing),
            "done" => Ok(EventStatus::Done),
            "failed" => Ok(EventStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown event status: {0}")]
pub struct UnknownStatus(pub String);

/// Terminal outcome for a claimed event.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Done,
    Failed(String),
}

/// A claimed row from `webhook_events`.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: i64,
    pub received_at: i64,
    pub subscription_id: Option<i64>,
    pub owner_id: i64,
    pub object_type: Option<String>,
    pub object_id: i64,
    pub aspect_type: Option<String>,
    pub event_time: Option<i64>,
    pub updates: Option<Value>,
    pub status: EventStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// A notification to enqueue (id, status, and attempts are assigned by the
/// queue itself).
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub subscription_id: Option<i64>,
    pub owner_id: i64,
    pub object_type: Option<String>,
    pub object_id: i64,
    pub aspect_type: Option<String>,
    pub event_time: Option<i64>,
    pub updates: Option<Value>,
}

/// Queue depth counts emitted by the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    pub queued: i64,
    pub processing: i64,
    pub failed: i64,
}

impl RideDb {
    /// Append an event in `queued` status. Never blocks on consumers.
    pub fn enqueue(&self, event: &NewEvent) -> Result<i64, DbError> {
        let now = chrono::Utc::now().timestamp();
        let updates_json = match &event.updates {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        self.conn_ref().execute(
            "INSERT INTO webhook_events(received_at, subscription_id, owner_id, object_type,
                                        object_id, aspect_type, event_time, updates_json, status)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'queued')",
            params![
                now,
                event.subscription_id,
                event.owner_id,
                event.object_type,
                event.object_id,
                event.aspect_type,
                event.event_time,
                updates_json,
            ],
        )?;
        Ok(self.conn_ref().last_insert_rowid())
    }

    /// Claim the oldest `queued` event, transitioning it to `processing`.
    ///
    /// The claim is a single UPDATE constrained to rows still in `queued`
    /// status, so two workers sharing the table cannot claim the same row.
    /// Returns `None` when the queue is empty; a busy writer (another
    /// claimer holding the write lock) also reads as no work this tick.
    pub fn claim_next(&self) -> Result<Option<WebhookEvent>, DbError> {
        let claimed = self
            .conn_ref()
            .query_row(
                "UPDATE webhook_events
                 SET status = 'processing', attempts = attempts + 1
                 WHERE id = (SELECT id FROM webhook_events
                             WHERE status = 'queued'
                             ORDER BY id LIMIT 1)
                 RETURNING id, received_at, subscription_id, owner_id, object_type,
                           object_id, aspect_type, event_time, updates_json, status,
                           attempts, last_error",
                [],
                row_to_event,
            )
            .optional();

        match claimed {
            Ok(row) => Ok(row),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Transition a `processing` row to its terminal status.
    pub fn finalize(&self, id: i64, outcome: &EventOutcome) -> Result<(), DbError> {
        match outcome {
            EventOutcome::Done => {
                self.conn_ref().execute(
                    "UPDATE webhook_events SET status = 'done' WHERE id = ?1",
                    params![id],
                )?;
            }
            EventOutcome::Failed(message) => {
                self.conn_ref().execute(
                    "UPDATE webhook_events SET status = 'failed', last_error = ?2 WHERE id = ?1",
                    params![id, message],
                )?;
            }
        }
        Ok(())
    }

    /// Record a diagnostic message on an event row without touching status.
    /// Used for render bookkeeping (success paths and soft failures alike).
    pub fn set_last_error(&self, id: i64, message: &str) -> Result<(), DbError> {
        self.conn_ref().execute(
            "UPDATE webhook_events SET last_error = ?2 WHERE id = ?1",
            params![id, message],
        )?;
        Ok(())
    }

    /// Reset `processing` rows back to `queued`, optionally scoped to one
    /// owner. Recovery from a crashed worker; must be invoked by an
    /// operator, never by the steady-state loop.
    pub fn reset_stuck(&self, owner_id: Option<i64>) -> Result<usize, DbError> {
        let n = self.conn_ref().execute(
            "UPDATE webhook_events SET status = 'queued'
             WHERE status = 'processing' AND (?1 IS NULL OR owner_id = ?1)",
            params![owner_id],
        )?;
        Ok(n)
    }

    /// Reset `failed` rows back to `queued` for another attempt, optionally
    /// scoped to one owner. The error message is cleared; `attempts` keeps
    /// counting across requeues.
    pub fn requeue_failed(&self, owner_id: Option<i64>) -> Result<usize, DbError> {
        let n = self.conn_ref().execute(
            "UPDATE webhook_events SET status = 'queued', last_error = NULL
             WHERE status = 'failed' AND (?1 IS NULL OR owner_id = ?1)",
            params![owner_id],
        )?;
        Ok(n)
    }

    /// Current queue depths, for the heartbeat. Read-only.
    pub fn queue_depths(&self) -> Result<QueueDepths, DbError> {
        let count = |status: &str| -> Result<i64, rusqlite::Error> {
            self.conn_ref().query_row(
                "SELECT COUNT(*) FROM webhook_events WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )
        };
        Ok(QueueDepths {
            queued: count("queued")?,
            processing: count("processing")?,
            failed: count("failed")?,
        })
    }

    /// Fetch one event row by id (diagnostics and tests).
    pub fn get_event(&self, id: i64) -> Result<Option<WebhookEvent>, DbError> {
        let row = self
            .conn_ref()
            .query_row(
                "SELECT id, received_at, subscription_id, owner_id, object_type,
                        object_id, aspect_type, event_time, updates_json, status,
                        attempts, last_error
                 FROM webhook_events WHERE id = ?1",
                params![id],
                row_to_event,
            )
            .optional()?;
        Ok(row)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<WebhookEvent, rusqlite::Error> {
    let updates_json: Option<String> = row.get(8)?;
    let status_raw: String = row.get(9)?;
    Ok(WebhookEvent {
        id: row.get(0)?,
        received_at: row.get(1)?,
        subscription_id: row.get(2)?,
        owner_id: row.get(3)?,
        object_type: row.get(4)?,
        object_id: row.get(5)?,
        aspect_type: row.get(6)?,
        event_time: row.get(7)?,
        updates: updates_json.and_then(|s| serde_json::from_str(&s).ok()),
        status: status_raw.parse().unwrap_or(EventStatus::Queued),
        attempts: row.get(10)?,
        last_error: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RideDb;
    use serde_json::json;

    fn event_for(owner_id: i64, object_id: i64) -> NewEvent {
        NewEvent {
            subscription_id: Some(1),
            owner_id,
            object_type: Some("activity".to_string()),
            object_id,
            aspect_type: Some("create".to_string()),
            event_time: Some(1_700_000_000),
            updates: Some(json!({"title": "Morning Ride"})),
        }
    }

    #[test]
    fn test_enqueue_then_claim_fifo() {
        let db = RideDb::open_in_memory().unwrap();
        let first = db.enqueue(&event_for(1, 100)).unwrap();
        let second = db.enqueue(&event_for(1, 200)).unwrap();
        assert!(second > first);

        let claimed = db.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.object_id, 100);
        assert_eq!(claimed.status, EventStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        let next = db.claim_next().unwrap().unwrap();
        assert_eq!(next.id, second);
    }

    #[test]
    fn test_claim_empty_queue_is_none() {
        let db = RideDb::open_in_memory().unwrap();
        assert!(db.claim_next().unwrap().is_none());
    }

    #[test]
    fn test_claim_is_exclusive_per_row() {
        let db = RideDb::open_in_memory().unwrap();
        db.enqueue(&event_for(1, 100)).unwrap();

        let first = db.claim_next().unwrap();
        assert!(first.is_some());
        // The row is now `processing`, so a second claim finds nothing.
        assert!(db.claim_next().unwrap().is_none());
    }

    #[test]
    fn test_finalize_done_and_failed() {
        let db = RideDb::open_in_memory().unwrap();
        let a = db.enqueue(&event_for(1, 100)).unwrap();
        let b = db.enqueue(&event_for(1, 200)).unwrap();

        db.claim_next().unwrap().unwrap();
        db.finalize(a, &EventOutcome::Done).unwrap();
        db.claim_next().unwrap().unwrap();
        db.finalize(b, &EventOutcome::Failed("no OAuth credential".to_string()))
            .unwrap();

        assert_eq!(db.get_event(a).unwrap().unwrap().status, EventStatus::Done);
        let failed = db.get_event(b).unwrap().unwrap();
        assert_eq!(failed.status, EventStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("no OAuth credential"));
    }

    #[test]
    fn test_reset_stuck_scoped_to_owner() {
        let db = RideDb::open_in_memory().unwrap();
        // Three stuck rows for owner 1, one for owner 2.
        for object_id in [100, 101, 102] {
            db.enqueue(&event_for(1, object_id)).unwrap();
        }
        db.enqueue(&event_for(2, 300)).unwrap();
        for _ in 0..4 {
            db.claim_next().unwrap().unwrap();
        }
        assert_eq!(db.queue_depths().unwrap().processing, 4);

        let reset = db.reset_stuck(Some(1)).unwrap();
        assert_eq!(reset, 3);

        let depths = db.queue_depths().unwrap();
        assert_eq!(depths.queued, 3);
        assert_eq!(depths.processing, 1);
    }

    #[test]
    fn test_reset_stuck_unscoped_resets_all() {
        let db = RideDb::open_in_memory().unwrap();
        db.enqueue(&event_for(1, 100)).unwrap();
        db.enqueue(&event_for(2, 200)).unwrap();
        db.claim_next().unwrap().unwrap();
        db.claim_next().unwrap().unwrap();

        assert_eq!(db.reset_stuck(None).unwrap(), 2);
        assert_eq!(db.queue_depths().unwrap().queued, 2);
    }

    #[test]
    fn test_requeue_failed_clears_error_keeps_attempts() {
        let db = RideDb::open_in_memory().unwrap();
        let id = db.enqueue(&event_for(1, 100)).unwrap();
        db.claim_next().unwrap().unwrap();
        db.finalize(id, &EventOutcome::Failed("fetch failed".to_string()))
            .unwrap();

        assert_eq!(db.requeue_failed(Some(1)).unwrap(), 1);
        let row = db.get_event(id).unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Queued);
        assert!(row.last_error.is_none());
        assert_eq!(row.attempts, 1);

        // Second attempt keeps counting.
        let reclaimed = db.claim_next().unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);
    }

    #[test]
    fn test_queue_depths() {
        let db = RideDb::open_in_memory().unwrap();
        let a = db.enqueue(&event_for(1, 100)).unwrap();
        db.enqueue(&event_for(1, 200)).unwrap();
        db.claim_next().unwrap().unwrap();
        db.finalize(a, &EventOutcome::Failed("x".to_string())).unwrap();

        let depths = db.queue_depths().unwrap();
        assert_eq!(
            depths,
            QueueDepths {
                queued: 1,
                processing: 0,
                failed: 1
            }
        );
    }

    #[test]
    fn test_updates_payload_roundtrip() {
        let db = RideDb::open_in_memory().unwrap();
        db.enqueue(&event_for(1, 100)).unwrap();
        let claimed = db.claim_next().unwrap().unwrap();
        assert_eq!(claimed.updates.unwrap()["title"], "Morning Ride");
    }
}
