//! SQLite-backed state for the ingestion pipeline.
//!
//! One database holds the event queue, OAuth token pairs, activity and
//! stream snapshots, and the derived analysis/summary artifacts. The file
//! is the system of record for ingestion history; report files on disk can
//! always be regenerated from it.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),
}

/// An athlete's current OAuth token pair (one row per athlete, upserted).
#[derive(Debug, Clone)]
pub struct TokenRow {
    pub athlete_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp at which the access token expires.
    pub expires_at: i64,
}

/// A ride analysis artifact, optionally joined with its activity snapshot.
#[derive(Debug, Clone)]
pub struct AnalysisRecord {
    pub activity_id: i64,
    pub athlete_id: Option<i64>,
    pub created_at: i64,
    pub model: Option<String>,
    pub prompt_version: Option<String>,
    pub metrics: Value,
    pub narrative: String,
    /// Raw activity JSON, when the snapshot still exists.
    pub activity: Option<Value>,
}

/// A cross-ride progress summary, keyed by the activity that triggered it.
#[derive(Debug, Clone)]
pub struct SummaryRecord {
    pub activity_id: i64,
    pub athlete_id: Option<i64>,
    pub created_at: i64,
    pub model: Option<String>,
    pub prompt_version: Option<String>,
    pub summary: String,
}

/// SQLite connection wrapper.
///
/// Intentionally NOT `Clone` or `Sync`: the worker owns one connection and
/// processes one event at a time. Additional worker processes open their
/// own connections; SQLite write serialization keeps claims exclusive.
pub struct RideDb {
    conn: Connection,
}

impl RideDb {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL lets the webhook receiver insert while the worker reads.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        // All statements use IF NOT EXISTS, so this is idempotent.
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self { conn })
    }

    /// Open an in-memory database. Useful for testing.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self { conn })
    }

    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    /// Insert or replace the token pair for an athlete.
    pub fn upsert_tokens(
        &self,
        athlete_id: i64,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO tokens(athlete_id, access_token, refresh_token, expires_at)
             VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(athlete_id) DO UPDATE SET
               access_token=excluded.access_token,
               refresh_token=excluded.refresh_token,
               expires_at=excluded.expires_at",
            params![athlete_id, access_token, refresh_token, expires_at],
        )?;
        Ok(())
    }

    /// Look up the token pair for an athlete.
    pub fn get_tokens(&self, athlete_id: i64) -> Result<Option<TokenRow>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT athlete_id, access_token, refresh_token, expires_at
                 FROM tokens WHERE athlete_id = ?1",
                params![athlete_id],
                |row| {
                    Ok(TokenRow {
                        athlete_id: row.get(0)?,
                        access_token: row.get(1)?,
                        refresh_token: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // =========================================================================
    // Activity + stream snapshots
    // =========================================================================

    /// Upsert the cached copy of an activity's detail JSON.
    pub fn upsert_activity(
        &self,
        activity_id: i64,
        athlete_id: i64,
        raw: &Value,
    ) -> Result<(), DbError> {
        let now = Utc::now().timestamp();
        self.conn.execute(
            "INSERT OR REPLACE INTO activities(activity_id, athlete_id, raw_json, updated_at)
             VALUES(?1, ?2, ?3, ?4)",
            params![activity_id, athlete_id, serde_json::to_string(raw)?, now],
        )?;
        Ok(())
    }

    /// Upsert the cached copy of an activity's telemetry streams.
    pub fn upsert_streams(&self, activity_id: i64, streams: &Value) -> Result<(), DbError> {
        let now = Utc::now().timestamp();
        self.conn.execute(
            "INSERT OR REPLACE INTO activity_streams(activity_id, streams_json, updated_at)
             VALUES(?1, ?2, ?3)",
            params![activity_id, serde_json::to_string(streams)?, now],
        )?;
        Ok(())
    }

    /// Fetch the activity snapshot, if one has been ingested.
    pub fn get_activity(&self, activity_id: i64) -> Result<Option<Value>, DbError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT raw_json FROM activities WHERE activity_id = ?1",
                params![activity_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Fetch the stream snapshot, if one has been ingested.
    pub fn get_streams(&self, activity_id: i64) -> Result<Option<Value>, DbError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT streams_json FROM activity_streams WHERE activity_id = ?1",
                params![activity_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Ride analyses
    // =========================================================================

    /// Upsert the AI analysis for a ride. Reruns overwrite.
    pub fn save_ride_analysis(
        &self,
        activity_id: i64,
        athlete_id: Option<i64>,
        metrics: &Value,
        narrative: &str,
        model: &str,
        prompt_version: &str,
    ) -> Result<(), DbError> {
        let now = Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO ride_analysis(activity_id, athlete_id, created_at, model,
                                       prompt_version, metrics_json, narrative_md)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(activity_id) DO UPDATE SET
               athlete_id=excluded.athlete_id,
               created_at=excluded.created_at,
               model=excluded.model,
               prompt_version=excluded.prompt_version,
               metrics_json=excluded.metrics_json,
               narrative_md=excluded.narrative_md",
            params![
                activity_id,
                athlete_id,
                now,
                model,
                prompt_version,
                serde_json::to_string(metrics)?,
                narrative
            ],
        )?;
        Ok(())
    }

    /// Fetch the analysis for one ride.
    pub fn get_ride_analysis(&self, activity_id: i64) -> Result<Option<AnalysisRecord>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT activity_id, athlete_id, created_at, model, prompt_version,
                        metrics_json, narrative_md
                 FROM ride_analysis WHERE activity_id = ?1",
                params![activity_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((activity_id, athlete_id, created_at, model, prompt_version, metrics, narrative)) => {
                Ok(Some(AnalysisRecord {
                    activity_id,
                    athlete_id,
                    created_at,
                    model,
                    prompt_version,
                    metrics: serde_json::from_str(&metrics)?,
                    narrative,
                    activity: None,
                }))
            }
            None => Ok(None),
        }
    }

    /// List analyses oldest-first, each joined with its activity snapshot
    /// (when present). Optionally scoped to one athlete.
    pub fn list_ride_analyses_chronological(
        &self,
        athlete_id: Option<i64>,
    ) -> Result<Vec<AnalysisRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT ra.activity_id, ra.athlete_id, ra.created_at, ra.model,
                    ra.prompt_version, ra.metrics_json, ra.narrative_md,
                    a.raw_json
             FROM ride_analysis ra
             LEFT JOIN activities a ON a.activity_id = ra.activity_id
             WHERE ?1 IS NULL OR ra.athlete_id = ?1
             ORDER BY ra.created_at ASC",
        )?;

        let rows = stmt.query_map(params![athlete_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (activity_id, athlete_id, created_at, model, prompt_version, metrics, narrative, raw) =
                row?;
            out.push(AnalysisRecord {
                activity_id,
                athlete_id,
                created_at,
                model,
                prompt_version,
                metrics: serde_json::from_str(&metrics)?,
                narrative,
                // A corrupt snapshot should not sink the whole listing.
                activity: raw.and_then(|s| serde_json::from_str(&s).ok()),
            });
        }
        Ok(out)
    }

    // =========================================================================
    // Progress summaries
    // =========================================================================

    /// Upsert the progress summary generated as-of `activity_id`.
    pub fn save_progress_summary(
        &self,
        activity_id: i64,
        athlete_id: Option<i64>,
        summary_md: &str,
        model: &str,
        prompt_version: &str,
    ) -> Result<(), DbError> {
        let now = Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO progress_summaries(activity_id, athlete_id, created_at, model,
                                            prompt_version, summary_md)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(activity_id) DO UPDATE SET
               athlete_id=excluded.athlete_id,
               created_at=excluded.created_at,
               model=excluded.model,
               prompt_version=excluded.prompt_version,
               summary_md=excluded.summary_md",
            params![activity_id, athlete_id, now, model, prompt_version, summary_md],
        )?;
        Ok(())
    }

    /// Fetch the progress summary keyed by `activity_id`.
    pub fn get_progress_summary(
        &self,
        activity_id: i64,
    ) -> Result<Option<SummaryRecord>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT activity_id, athlete_id, created_at, model, prompt_version, summary_md
                 FROM progress_summaries WHERE activity_id = ?1",
                params![activity_id],
                |row| {
                    Ok(SummaryRecord {
                        activity_id: row.get(0)?,
                        athlete_id: row.get(1)?,
                        created_at: row.get(2)?,
                        model: row.get(3)?,
                        prompt_version: row.get(4)?,
                        summary: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_db() -> RideDb {
        RideDb::open_in_memory().unwrap()
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("strava.sqlite");
        let _db = RideDb::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_token_upsert_is_single_row() {
        let db = test_db();
        db.upsert_tokens(1, "access-a", "refresh-a", 100).unwrap();
        db.upsert_tokens(1, "access-b", "refresh-b", 200).unwrap();

        let tok = db.get_tokens(1).unwrap().unwrap();
        assert_eq!(tok.access_token, "access-b");
        assert_eq!(tok.refresh_token, "refresh-b");
        assert_eq!(tok.expires_at, 200);

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM tokens", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_get_tokens_missing() {
        let db = test_db();
        assert!(db.get_tokens(42).unwrap().is_none());
    }

    #[test]
    fn test_activity_snapshot_overwrites() {
        let db = test_db();
        db.upsert_activity(555, 1, &json!({"name": "First"})).unwrap();
        db.upsert_activity(555, 1, &json!({"name": "Second"})).unwrap();

        let act = db.get_activity(555).unwrap().unwrap();
        assert_eq!(act["name"], "Second");

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM activities", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_streams_roundtrip() {
        let db = test_db();
        let streams = json!({"watts": {"data": [100, 120, 130]}});
        db.upsert_streams(555, &streams).unwrap();
        assert_eq!(db.get_streams(555).unwrap().unwrap(), streams);
    }

    #[test]
    fn test_analysis_upsert_and_chronological_listing() {
        let db = test_db();
        db.upsert_activity(1, 7, &json!({"name": "Ride one"})).unwrap();

        db.save_ride_analysis(1, Some(7), &json!({}), "first", "gpt-4o-mini", "ride_v1")
            .unwrap();
        db.save_ride_analysis(2, Some(7), &json!({}), "second", "gpt-4o-mini", "ride_v1")
            .unwrap();
        // Rerun for activity 1 overwrites rather than duplicating.
        db.save_ride_analysis(1, Some(7), &json!({"vi": 1.05}), "first-redo", "gpt-4o-mini", "ride_v2")
            .unwrap();

        let all = db.list_ride_analyses_chronological(None).unwrap();
        assert_eq!(all.len(), 2);

        let one = db.get_ride_analysis(1).unwrap().unwrap();
        assert_eq!(one.narrative, "first-redo");
        assert_eq!(one.prompt_version.as_deref(), Some("ride_v2"));
        assert_eq!(one.metrics["vi"], 1.05);

        // Join carries the activity snapshot where present.
        let joined = all.iter().find(|a| a.activity_id == 1).unwrap();
        assert_eq!(joined.activity.as_ref().unwrap()["name"], "Ride one");
        let unjoined = all.iter().find(|a| a.activity_id == 2).unwrap();
        assert!(unjoined.activity.is_none());
    }

    #[test]
    fn test_analysis_listing_scoped_to_athlete() {
        let db = test_db();
        db.save_ride_analysis(1, Some(7), &json!({}), "mine", "m", "v").unwrap();
        db.save_ride_analysis(2, Some(8), &json!({}), "theirs", "m", "v").unwrap();

        let mine = db.list_ride_analyses_chronological(Some(7)).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].narrative, "mine");
    }

    #[test]
    fn test_progress_summary_upsert() {
        let db = test_db();
        db.save_progress_summary(9, Some(1), "v1 summary", "gpt-4o-mini", "progress_v1")
            .unwrap();
        db.save_progress_summary(9, Some(1), "v2 summary", "gpt-4o-mini", "progress_v1")
            .unwrap();

        let s = db.get_progress_summary(9).unwrap().unwrap();
        assert_eq!(s.summary, "v2 summary");

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM progress_summaries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
