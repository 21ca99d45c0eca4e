//! Markdown report rendering: pure formatting of an activity snapshot and
//! its computed analysis.

use std::path::Path;

use chrono::DateTime;
use serde_json::Value;

use crate::util::atomic_write_str;

/// Render and write the per-ride report. Returns the written path's string
/// form for bookkeeping on the event row.
pub fn generate_ride_markdown(
    activity: &Value,
    metrics: &Value,
    narrative: &str,
    path: &Path,
) -> Result<String, std::io::Error> {
    let md = build_ride_markdown(activity, metrics, narrative);
    atomic_write_str(path, &md)?;
    Ok(path.display().to_string())
}

/// Build the report body without touching the filesystem.
pub fn build_ride_markdown(activity: &Value, metrics: &Value, narrative: &str) -> String {
    let ride_name = activity["name"].as_str().unwrap_or("Untitled Ride");
    let sport_type = activity["sport_type"].as_str().unwrap_or("");
    let distance_km = activity["distance"].as_f64().unwrap_or(0.0) / 1000.0;
    let moving_time = activity["moving_time"].as_i64().unwrap_or(0);
    let elevation_gain = activity["total_elevation_gain"].as_f64().unwrap_or(0.0);
    let start_date = activity["start_date"].as_str().unwrap_or("");

    let mut md = format!(
        "# {}\n\n## Ride Details\n- **sport_type**: {}\n- **distance_km**: {:.2}\n- **moving_time_sec**: {}\n- **elevation_gain_m**: {}\n",
        ride_name, sport_type, distance_km, moving_time, elevation_gain
    );
    if !start_date.is_empty() {
        // Normalize to RFC 3339 when parseable; otherwise pass through.
        let date_line = DateTime::parse_from_rfc3339(&start_date.replace('Z', "+00:00"))
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|_| start_date.to_string());
        md.push_str(&format!("- **start_date**: {}\n", date_line));
    }

    md.push_str("\n## Analysis Metrics\n\n```json\n");
    md.push_str(&serde_json::to_string_pretty(metrics).unwrap_or_else(|_| "{}".to_string()));
    md.push_str("\n```\n");

    md.push_str("\n## Narrative\n\n");
    md.push_str(narrative.trim());
    md.push('\n');

    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn activity() -> Value {
        json!({
            "name": "Coastal Century",
            "sport_type": "Ride",
            "distance": 160_934.0,
            "moving_time": 21_600,
            "total_elevation_gain": 1_250.0,
            "start_date": "2026-06-14T06:30:00Z"
        })
    }

    #[test]
    fn test_markdown_layout() {
        let md = build_ride_markdown(&activity(), &json!({"vi": 1.04}), "Strong steady ride.");
        assert!(md.starts_with("# Coastal Century\n"));
        assert!(md.contains("- **sport_type**: Ride"));
        assert!(md.contains("- **distance_km**: 160.93"));
        assert!(md.contains("- **moving_time_sec**: 21600"));
        assert!(md.contains("- **start_date**: 2026-06-14T06:30:00+00:00"));
        assert!(md.contains("```json"));
        assert!(md.contains("\"vi\": 1.04"));
        assert!(md.contains("## Narrative\n\nStrong steady ride.\n"));
    }

    #[test]
    fn test_markdown_without_start_date() {
        let mut act = activity();
        act.as_object_mut().unwrap().remove("start_date");
        let md = build_ride_markdown(&act, &json!({}), "n");
        assert!(!md.contains("start_date"));
    }

    #[test]
    fn test_markdown_unparseable_date_passes_through() {
        let mut act = activity();
        act["start_date"] = json!("yesterday-ish");
        let md = build_ride_markdown(&act, &json!({}), "n");
        assert!(md.contains("- **start_date**: yesterday-ish"));
    }

    #[test]
    fn test_generate_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("ride.md");
        let written =
            generate_ride_markdown(&activity(), &json!({}), "Narrative.", &path).unwrap();
        assert!(written.ends_with("ride.md"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# Coastal Century"));
    }
}
