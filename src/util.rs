use std::path::Path;

use regex::Regex;

/// Write a string to `path` atomically: write to a sibling temp file,
/// then rename over the destination. Readers never observe a partial file.
pub fn atomic_write_str(path: &Path, content: &str) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Sanitize an activity name for use in a report filename.
///
/// Non-alphanumeric characters (other than `_`) become underscores, runs of
/// underscores collapse to one, leading/trailing underscores are trimmed,
/// and the result is capped at 50 characters. An empty result falls back
/// to "Ride".
pub fn sanitize_activity_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let collapsed = collapse_underscores(&replaced);
    let trimmed = collapsed.trim_matches('_');
    let capped: String = trimmed.chars().take(50).collect();
    if capped.is_empty() {
        "Ride".to_string()
    } else {
        capped
    }
}

/// Sanitize a prompt-version tag for use in a filename.
///
/// Versions additionally keep `-` and `.` (e.g. "ride_v3", "progress-1.2").
pub fn sanitize_version(version: &str) -> String {
    let replaced: String = version
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    collapse_underscores(&replaced).trim_matches('_').to_string()
}

fn collapse_underscores(s: &str) -> String {
    // Compiled on use; runs once per processed event, not in a hot path.
    let re = Regex::new(r"_+").expect("static regex");
    re.replace_all(s, "_").into_owned()
}

/// Base filename (no extension) for a per-activity report.
pub fn report_basename(activity_name: &str, prompt_version: &str, activity_id: i64) -> String {
    format!(
        "{}_{}_{}",
        sanitize_activity_name(activity_name),
        sanitize_version(prompt_version),
        activity_id
    )
}

/// Base filename (no extension) for an aggregate progress-summary report,
/// dated with the local date so same-day reruns overwrite.
pub fn summary_basename(date: &str, prompt_version: &str, activity_id: i64) -> String {
    format!(
        "Progress_Summary_{}_{}_{}",
        date,
        sanitize_version(prompt_version),
        activity_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_and_collapses() {
        assert_eq!(
            sanitize_activity_name("Morning Ride (w/ Club!)"),
            "Morning_Ride_w_Club"
        );
    }

    #[test]
    fn test_sanitize_trims_edges() {
        assert_eq!(sanitize_activity_name("  hills  "), "hills");
        assert_eq!(sanitize_activity_name("___"), "Ride");
    }

    #[test]
    fn test_sanitize_caps_length() {
        let long = "a".repeat(80);
        assert_eq!(sanitize_activity_name(&long).chars().count(), 50);
    }

    #[test]
    fn test_sanitize_empty_falls_back() {
        assert_eq!(sanitize_activity_name(""), "Ride");
        assert_eq!(sanitize_activity_name("!!!"), "Ride");
    }

    #[test]
    fn test_sanitize_version_keeps_dots_and_dashes() {
        assert_eq!(sanitize_version("ride-v1.2"), "ride-v1.2");
        assert_eq!(sanitize_version("ride v1/2"), "ride_v1_2");
    }

    #[test]
    fn test_report_basename() {
        assert_eq!(
            report_basename("Evening Spin", "ride_v3", 555),
            "Evening_Spin_ride_v3_555"
        );
    }

    #[test]
    fn test_summary_basename() {
        assert_eq!(
            summary_basename("2026-08-07", "progress_v1", 99),
            "Progress_Summary_2026-08-07_progress_v1_99"
        );
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.md");
        atomic_write_str(&path, "hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }
}
