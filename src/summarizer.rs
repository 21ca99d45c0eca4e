//! Cross-ride progress summarization.
//!
//! Concatenates every ride analysis chronologically, trims oldest-first to
//! fit the configured character budget, and asks the completion API for an
//! aggregate progress narrative.

use async_trait::async_trait;
use chrono::{Local, TimeZone};
use thiserror::Error;

use crate::db::AnalysisRecord;
use crate::openai::{CompletionClient, CompletionError, CompletionRequest};
use crate::prompt::PromptTemplate;

/// Version tag recorded when the template carries no PROMPT_VERSION header.
pub const DEFAULT_PROGRESS_PROMPT_VERSION: &str = "progress_v1";

/// Prefix prepended to the history when older entries were dropped.
const TRUNCATION_NOTICE: &str = "NOTE: Older reports were truncated due to size limits.";

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("Completion call failed: {0}")]
    Completion(#[from] CompletionError),

    #[error("No reports available to summarize")]
    NoReports,
}

#[derive(Debug, Clone)]
pub struct ProgressSummary {
    pub summary_md: String,
    pub model: String,
    pub prompt_version: String,
}

/// Aggregate-narrative collaborator, invoked best-effort after each
/// successful ride analysis.
#[async_trait]
pub trait ProgressSummarizer: Send + Sync {
    async fn summarize(&self, analyses: &[AnalysisRecord])
        -> Result<ProgressSummary, SummaryError>;
}

pub struct OpenAiProgressSummarizer {
    client: CompletionClient,
    template: PromptTemplate,
    default_model: String,
    max_chars: usize,
}

impl OpenAiProgressSummarizer {
    pub fn new(
        client: CompletionClient,
        template: PromptTemplate,
        default_model: String,
        max_chars: usize,
    ) -> Self {
        Self {
            client,
            template,
            default_model,
            max_chars,
        }
    }
}

#[async_trait]
impl ProgressSummarizer for OpenAiProgressSummarizer {
    async fn summarize(
        &self,
        analyses: &[AnalysisRecord],
    ) -> Result<ProgressSummary, SummaryError> {
        let reports_text = format_reports_bounded(analyses, self.max_chars);
        if reports_text.trim().is_empty() {
            return Err(SummaryError::NoReports);
        }

        let prompt = self.template.render(&reports_text);
        let model = self.template.model(&self.default_model).to_string();
        let prompt_version = self
            .template
            .version(DEFAULT_PROGRESS_PROMPT_VERSION)
            .to_string();

        let completion = self
            .client
            .complete(&CompletionRequest {
                model,
                prompt,
                temperature: 0.4,
                json_mode: false,
            })
            .await?;

        Ok(ProgressSummary {
            summary_md: completion.content,
            model: completion.model,
            prompt_version,
        })
    }
}

/// Render analyses oldest-first as markdown sections.
pub fn format_reports_chronological(analyses: &[AnalysisRecord]) -> String {
    let mut parts = Vec::new();
    for a in analyses {
        let name = a
            .activity
            .as_ref()
            .and_then(|act| act["name"].as_str())
            .unwrap_or("Untitled Ride");
        let start_date = a
            .activity
            .as_ref()
            .and_then(|act| act["start_date"].as_str())
            .unwrap_or("");

        let when = if !start_date.is_empty() {
            start_date.to_string()
        } else {
            Local
                .timestamp_opt(a.created_at, 0)
                .single()
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default()
        };

        parts.push(format!(
            "### {} — {} (activity_id={})",
            when, name, a.activity_id
        ));
        parts.push(String::new());
        parts.push(a.narrative.clone());
        parts.push("\n---\n".to_string());
    }
    parts.join("\n").trim().to_string()
}

/// Render the history, dropping oldest entries first until the text fits
/// within `max_chars`. When anything was dropped, a truncation notice is
/// prepended; order among kept entries is unchanged.
pub fn format_reports_bounded(analyses: &[AnalysisRecord], max_chars: usize) -> String {
    let full = format_reports_chronological(analyses);
    if full.len() <= max_chars {
        return full;
    }

    let mut kept = analyses;
    let mut text = full;
    while !kept.is_empty() && text.len() > max_chars {
        kept = &kept[1..];
        text = format_reports_chronological(kept);
    }
    format!("{}\n\n{}", TRUNCATION_NOTICE, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(activity_id: i64, created_at: i64, narrative: &str, name: Option<&str>) -> AnalysisRecord {
        AnalysisRecord {
            activity_id,
            athlete_id: Some(1),
            created_at,
            model: Some("gpt-4o-mini".to_string()),
            prompt_version: Some("ride_v1".to_string()),
            metrics: json!({}),
            narrative: narrative.to_string(),
            activity: name.map(|n| json!({"name": n, "start_date": "2026-05-01T08:00:00Z"})),
        }
    }

    #[test]
    fn test_format_uses_activity_name_and_date() {
        let text = format_reports_chronological(&[record(7, 0, "Solid ride.", Some("Loop"))]);
        assert!(text.contains("### 2026-05-01T08:00:00Z — Loop (activity_id=7)"));
        assert!(text.contains("Solid ride."));
    }

    #[test]
    fn test_format_falls_back_to_created_at() {
        let text =
            format_reports_chronological(&[record(7, 1_760_000_000, "No snapshot.", None)]);
        assert!(text.contains("Untitled Ride"));
        assert!(text.contains("(activity_id=7)"));
    }

    #[test]
    fn test_bounded_no_truncation_when_fits() {
        let records = vec![record(1, 10, "short", Some("A"))];
        let text = format_reports_bounded(&records, 10_000);
        assert!(!text.contains(TRUNCATION_NOTICE));
    }

    #[test]
    fn test_bounded_drops_oldest_first_and_keeps_order() {
        let records = vec![
            record(1, 10, &"oldest ".repeat(50), Some("First")),
            record(2, 20, &"middle ".repeat(50), Some("Second")),
            record(3, 30, &"newest ".repeat(50), Some("Third")),
        ];
        let full_len = format_reports_chronological(&records).len();

        // Budget forces at least the first record out.
        let text = format_reports_bounded(&records, full_len - 1);
        assert!(text.starts_with(TRUNCATION_NOTICE));
        assert!(!text.contains("activity_id=1"));
        assert!(text.contains("activity_id=2") || text.contains("activity_id=3"));

        // Kept entries remain in chronological order.
        if let (Some(second), Some(third)) =
            (text.find("activity_id=2"), text.find("activity_id=3"))
        {
            assert!(second < third);
        }
    }

    #[test]
    fn test_bounded_tiny_budget_still_noticed() {
        let records = vec![record(1, 10, "narrative body", Some("Only"))];
        let text = format_reports_bounded(&records, 5);
        assert!(text.starts_with(TRUNCATION_NOTICE));
    }
}
