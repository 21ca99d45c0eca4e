//! The pipeline worker: claims one queued event at a time and runs it
//! through fetch → persist → analyze → render → summarize → finalize.
//!
//! Failure taxonomy: missing credential, fetch failure (after one
//! authorized retry), and snapshot persistence failure abort the event as
//! `failed`. Everything downstream of persistence is best-effort; a lost
//! narrative must not block ingestion of the ride itself, so those stages
//! log, record diagnostics on the event row, and let the event finalize
//! `done`.

use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use serde_json::Value;

use crate::capabilities::Capabilities;
use crate::config::Settings;
use crate::db::RideDb;
use crate::queue::{EventOutcome, WebhookEvent};
use crate::strava::{ActivityApi, StravaError};
use crate::util::{report_basename, summary_basename};

pub const WORKER_VERSION: &str = "dual_output_md_pdf_v1";

/// Sport types that get AI analysis; everything else is ingested only.
pub const ANALYZED_SPORT_TYPES: &[&str] = &["Ride", "VirtualRide", "EBikeRide"];

pub struct Worker<'a> {
    db: &'a RideDb,
    api: &'a dyn ActivityApi,
    caps: &'a Capabilities,
    settings: &'a Settings,
}

impl<'a> Worker<'a> {
    pub fn new(
        db: &'a RideDb,
        api: &'a dyn ActivityApi,
        caps: &'a Capabilities,
        settings: &'a Settings,
    ) -> Self {
        Self {
            db,
            api,
            caps,
            settings,
        }
    }

    /// Poll loop: claim-and-process until the process is stopped. Sleeps
    /// between empty polls; a heartbeat logs queue depths on its own
    /// schedule regardless of whether work was found.
    pub async fn run(&self) {
        log::info!("Worker running (version {})", WORKER_VERSION);
        let heartbeat_interval = Duration::from_secs(self.settings.heartbeat_seconds);
        let mut last_heartbeat: Option<Instant> = None;

        loop {
            // First tick always logs, so startup is visibly alive.
            let due = last_heartbeat.map_or(true, |t| t.elapsed() >= heartbeat_interval);
            if due {
                last_heartbeat = Some(Instant::now());
                match self.db.queue_depths() {
                    Ok(d) => log::info!(
                        "[heartbeat] queued={} processing={} failed={}",
                        d.queued,
                        d.processing,
                        d.failed
                    ),
                    Err(e) => log::warn!("[heartbeat] depth query failed: {}", e),
                }
            }

            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::time::sleep(Duration::from_secs_f64(self.settings.poll_seconds)).await;
                }
                Err(e) => {
                    log::warn!("Claim failed: {}", e);
                    tokio::time::sleep(Duration::from_secs_f64(self.settings.poll_seconds)).await;
                }
            }
        }
    }

    /// Claim and fully process at most one event. Returns whether work was
    /// found. The claimed event always leaves in a terminal status.
    pub async fn run_once(&self) -> Result<bool, crate::db::DbError> {
        let event = match self.db.claim_next()? {
            Some(event) => event,
            None => return Ok(false),
        };

        log::info!(
            "Picked event id={} object_id={} owner_id={} aspect_type={}",
            event.id,
            event.object_id,
            event.owner_id,
            event.aspect_type.as_deref().unwrap_or("-")
        );

        let outcome = self.process_event(&event).await;
        match &outcome {
            EventOutcome::Done => log::info!("Ingested {}", event.object_id),
            EventOutcome::Failed(e) => log::warn!("Failed event id={}: {}", event.id, e),
        }
        self.db.finalize(event.id, &outcome)?;
        Ok(true)
    }

    /// Steps 1-6 for one claimed event. Returns the terminal outcome;
    /// never leaves the event mid-pipeline.
    async fn process_event(&self, event: &WebhookEvent) -> EventOutcome {
        // Step 1: token readiness (proactive refresh inside the skew window).
        let (mut access, refresh) = match self.ensure_fresh_token(event.owner_id).await {
            Ok(pair) => pair,
            Err(message) => return EventOutcome::Failed(message),
        };

        // Step 2: fetch detail + streams, refreshing once on a 401.
        let (activity, streams) = match self
            .fetch_with_auth_retry(event, &mut access, &refresh)
            .await
        {
            Ok(pair) => pair,
            Err(message) => return EventOutcome::Failed(message),
        };

        // Step 3: persist snapshots. The event is not ingested without them.
        if let Err(e) = self
            .db
            .upsert_activity(event.object_id, event.owner_id, &activity)
            .and_then(|_| self.db.upsert_streams(event.object_id, &streams))
        {
            return EventOutcome::Failed(format!("snapshot persistence failed: {}", e));
        }

        // Steps 4-6: best-effort analysis, rendering, summarization.
        self.analyze_and_report(event, &activity, &streams).await;

        EventOutcome::Done
    }

    /// Look up the credential and refresh proactively when the access token
    /// expires within the configured skew window. Returns (access, refresh).
    async fn ensure_fresh_token(&self, owner_id: i64) -> Result<(String, String), String> {
        let tok = match self.db.get_tokens(owner_id) {
            Ok(Some(tok)) => tok,
            Ok(None) => return Err(format!("no OAuth credential for athlete {}", owner_id)),
            Err(e) => return Err(format!("credential lookup failed: {}", e)),
        };

        let now = Utc::now().timestamp();
        if tok.expires_at <= now + self.settings.token_refresh_skew_seconds {
            log::info!(
                "Access token for athlete {} expires soon; refreshing proactively",
                owner_id
            );
            self.refresh_and_store(owner_id, &tok.refresh_token).await
        } else {
            Ok((tok.access_token, tok.refresh_token))
        }
    }

    /// Refresh the token pair and persist it before use.
    async fn refresh_and_store(
        &self,
        owner_id: i64,
        refresh_token: &str,
    ) -> Result<(String, String), String> {
        let new = self
            .api
            .refresh_access_token(refresh_token)
            .await
            .map_err(|e| format!("token refresh failed: {}", e))?;
        self.db
            .upsert_tokens(owner_id, &new.access_token, &new.refresh_token, new.expires_at)
            .map_err(|e| format!("token persistence failed: {}", e))?;
        Ok((new.access_token, new.refresh_token))
    }

    /// Fetch activity detail and streams. On a 401 the token pair is
    /// refreshed once and both fetches retried; a second 401 (or any other
    /// error) is a hard failure.
    async fn fetch_with_auth_retry(
        &self,
        event: &WebhookEvent,
        access: &mut String,
        refresh: &str,
    ) -> Result<(Value, Value), String> {
        match self.fetch_both(access, event.object_id).await {
            Ok(pair) => Ok(pair),
            Err(StravaError::Unauthorized) => {
                log::info!(
                    "Fetch unauthorized for activity {}; refreshing token and retrying once",
                    event.object_id
                );
                let (new_access, _new_refresh) =
                    self.refresh_and_store(event.owner_id, refresh).await?;
                *access = new_access;
                self.fetch_both(access, event.object_id)
                    .await
                    .map_err(|e| format!("fetch failed after token refresh: {}", e))
            }
            Err(e) => Err(format!("fetch failed: {}", e)),
        }
    }

    async fn fetch_both(
        &self,
        access: &str,
        activity_id: i64,
    ) -> Result<(Value, Value), StravaError> {
        let activity = self.api.fetch_activity(access, activity_id).await?;
        let streams = self.api.fetch_streams(access, activity_id).await?;
        Ok((activity, streams))
    }

    /// Steps 4-6. Nothing here changes the terminal status.
    async fn analyze_and_report(&self, event: &WebhookEvent, activity: &Value, streams: &Value) {
        let sport_type = activity["sport_type"].as_str().unwrap_or("");
        let analyzer = match &self.caps.analyzer {
            Some(analyzer) if ANALYZED_SPORT_TYPES.contains(&sport_type) => analyzer,
            Some(_) => {
                log::info!("Skipping analysis (sport_type={})", sport_type);
                return;
            }
            None => {
                log::info!("Skipping analysis (AI analysis disabled)");
                return;
            }
        };

        log::info!("Analyzing ride {}...", event.object_id);
        let analysis = match analyzer.analyze(activity, Some(streams)).await {
            Ok(analysis) => analysis,
            Err(e) => {
                log::warn!("Analysis failed for {}: {}", event.object_id, e);
                return;
            }
        };
        log::info!("Analysis complete for {} (model {})", event.object_id, analysis.model);

        if let Err(e) = self.db.save_ride_analysis(
            event.object_id,
            Some(event.owner_id),
            &analysis.metrics,
            &analysis.narrative,
            &analysis.model,
            &analysis.prompt_version,
        ) {
            log::warn!("Failed to save analysis for {}: {}", event.object_id, e);
            return;
        }

        // Step 5: render from the persisted record so reruns and renders
        // always agree with what's in the database.
        self.render_reports(event, activity);

        // Step 6: aggregate progress summary, only after a fresh analysis.
        if self.caps.summarizer.is_some() {
            self.summarize_progress(event, activity).await;
        }
    }

    /// Render the Markdown (and optional PDF) report for this activity.
    /// Outcomes are recorded on the event row for operator visibility.
    fn render_reports(&self, event: &WebhookEvent, activity: &Value) {
        let record = match self.db.get_ride_analysis(event.object_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::warn!("No analysis record to render for {}", event.object_id);
                return;
            }
            Err(e) => {
                log::warn!("Analysis read-back failed for {}: {}", event.object_id, e);
                return;
            }
        };

        let name = activity["name"].as_str().unwrap_or("Untitled_Ride");
        let version = record.prompt_version.as_deref().unwrap_or("v1");
        let base = report_basename(name, version, event.object_id);

        let md_path = self.settings.report_output_dir.join(format!("{}.md", base));
        let result = crate::markdown::generate_ride_markdown(
            activity,
            &record.metrics,
            &record.narrative,
            &md_path,
        );

        match result {
            Ok(md_written) => {
                log::info!("Markdown generated: {}", md_written);
                let mut info = format!("report_generated: md={}", md_written);

                if let Some(pdf) = &self.caps.pdf {
                    let pdf_path = self.settings.pdf_output_dir.join(format!("{}.pdf", base));
                    match pdf.render(&md_path, &pdf_path) {
                        Ok(()) => {
                            log::info!("PDF generated: {}", pdf_path.display());
                            info.push_str(&format!(" pdf={}", pdf_path.display()));
                        }
                        Err(e) => {
                            log::warn!("PDF generation failed for {}: {}", event.object_id, e);
                        }
                    }
                }

                if let Err(e) = self.db.set_last_error(event.id, &info) {
                    log::warn!("Failed to record report info for event {}: {}", event.id, e);
                }
            }
            Err(e) => {
                let message = format!("report_generation_failed: {}", e);
                log::warn!("Report generation failed for {}: {}", event.object_id, e);
                if let Err(db_err) = self.db.set_last_error(event.id, &message) {
                    log::warn!("Failed to record report error for event {}: {}", event.id, db_err);
                }
            }
        }
    }

    /// Recompute the cross-ride progress narrative for this athlete and
    /// render it, dated with the local date so same-day reruns overwrite.
    async fn summarize_progress(&self, event: &WebhookEvent, _activity: &Value) {
        let summarizer = match &self.caps.summarizer {
            Some(s) => s,
            None => return,
        };

        let analyses = match self.db.list_ride_analyses_chronological(Some(event.owner_id)) {
            Ok(analyses) => analyses,
            Err(e) => {
                log::warn!("Progress summary skipped for {}: {}", event.object_id, e);
                return;
            }
        };

        let progress = match summarizer.summarize(&analyses).await {
            Ok(progress) => progress,
            Err(e) => {
                log::warn!("Progress summary failed for {}: {}", event.object_id, e);
                return;
            }
        };
        log::info!(
            "Progress summary complete for {} (model {})",
            event.object_id,
            progress.model
        );

        if let Err(e) = self.db.save_progress_summary(
            event.object_id,
            Some(event.owner_id),
            &progress.summary_md,
            &progress.model,
            &progress.prompt_version,
        ) {
            log::warn!("Failed to save progress summary for {}: {}", event.object_id, e);
            return;
        }

        let date = Local::now().format("%Y-%m-%d").to_string();
        let base = summary_basename(&date, &progress.prompt_version, event.object_id);
        let md_path = self.settings.report_output_dir.join(format!("{}.md", base));

        match crate::util::atomic_write_str(&md_path, &progress.summary_md) {
            Ok(()) => {
                log::info!("Progress summary markdown generated: {}", md_path.display());
                if let Some(pdf) = &self.caps.pdf {
                    let pdf_path = self.settings.pdf_output_dir.join(format!("{}.pdf", base));
                    if let Err(e) = pdf.render(&md_path, &pdf_path) {
                        log::warn!("Progress summary PDF failed for {}: {}", event.object_id, e);
                    }
                }
            }
            Err(e) => {
                log::warn!("Progress summary write failed for {}: {}", event.object_id, e);
            }
        }
    }
}
