//! AI ride analysis: builds a metrics brief from activity + stream data,
//! substitutes it into the prompt template, and calls the completion API.
//!
//! The worker treats every failure here as best-effort: an analysis error
//! is logged and the event still finalizes as done.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::openai::{CompletionClient, CompletionError, CompletionRequest};
use crate::prompt::PromptTemplate;

/// Version tag recorded when the template carries no PROMPT_VERSION header.
pub const DEFAULT_RIDE_PROMPT_VERSION: &str = "ride_v1";

// Post-climb power heuristic parameters (tuned for simplicity).
const CLIMB_WINDOW_SECS: f64 = 60.0;
const MIN_ALT_GAIN_M: f64 = 6.0;
const MAX_CLIMB_SPEED_MPS: f64 = 6.0;
const POST_WINDOW_SECS: f64 = 120.0;
const MIN_MOVING_SPEED_MPS: f64 = 1.0;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Completion call failed: {0}")]
    Completion(#[from] CompletionError),

    #[error("Completion returned malformed JSON: {0}")]
    BadResponse(#[from] serde_json::Error),
}

/// Result of analyzing one ride.
#[derive(Debug, Clone)]
pub struct RideAnalysis {
    pub metrics: Value,
    pub narrative: String,
    pub model: String,
    pub prompt_version: String,
}

/// Narrative-generation collaborator. Swappable black box from the
/// worker's perspective.
#[async_trait]
pub trait RideAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        activity: &Value,
        streams: Option<&Value>,
    ) -> Result<RideAnalysis, AnalysisError>;
}

pub struct OpenAiRideAnalyzer {
    client: CompletionClient,
    template: PromptTemplate,
    default_model: String,
}

impl OpenAiRideAnalyzer {
    pub fn new(client: CompletionClient, template: PromptTemplate, default_model: String) -> Self {
        Self {
            client,
            template,
            default_model,
        }
    }
}

#[async_trait]
impl RideAnalyzer for OpenAiRideAnalyzer {
    async fn analyze(
        &self,
        activity: &Value,
        streams: Option<&Value>,
    ) -> Result<RideAnalysis, AnalysisError> {
        let brief = build_ride_brief(activity, streams);
        let prompt = self.template.render(&brief);
        let model = self.template.model(&self.default_model).to_string();
        let prompt_version = self
            .template
            .version(DEFAULT_RIDE_PROMPT_VERSION)
            .to_string();
        let json_mode = self.template.wants_json();

        let completion = self
            .client
            .complete(&CompletionRequest {
                model: model.clone(),
                prompt,
                temperature: 0.7,
                json_mode,
            })
            .await?;

        if json_mode {
            let mut parsed: Value = serde_json::from_str(&completion.content)?;
            let metrics = parsed
                .get_mut("metrics")
                .map(Value::take)
                .unwrap_or_else(|| json!({}));
            let narrative = parsed
                .get("narrative")
                .and_then(Value::as_str)
                .unwrap_or("No narrative generated.")
                .to_string();
            Ok(RideAnalysis {
                metrics,
                narrative,
                model: completion.model,
                prompt_version,
            })
        } else {
            // Markdown-mode templates: the whole response is the narrative.
            Ok(RideAnalysis {
                metrics: json!({ "prompt_version": prompt_version }),
                narrative: completion.content,
                model: completion.model,
                prompt_version,
            })
        }
    }
}

/// Format the activity (and stream-derived signals) as the bullet summary
/// the prompt template expects.
pub fn build_ride_brief(activity: &Value, streams: Option<&Value>) -> String {
    let name = activity["name"].as_str().unwrap_or("Ride");
    let distance_km = activity["distance"].as_f64().unwrap_or(0.0) / 1000.0;
    let moving_time = activity["moving_time"].as_i64().unwrap_or(0);
    let elevation_gain = activity["total_elevation_gain"].as_f64().unwrap_or(0.0);
    let avg_speed_kmh = activity["average_speed"].as_f64().unwrap_or(0.0) * 3.6;
    let max_speed_kmh = activity["max_speed"].as_f64().unwrap_or(0.0) * 3.6;

    let mut lines = vec![
        format!("- Name: {}", name),
        format!("- Distance: {:.2} km", distance_km),
        format!(
            "- Moving Time: {} minutes {} seconds",
            moving_time / 60,
            moving_time % 60
        ),
        format!("- Elevation Gain: {:.0} m", elevation_gain),
        format!("- Average Speed: {:.2} km/h", avg_speed_kmh),
        format!("- Max Speed: {:.2} km/h", max_speed_kmh),
    ];

    let avg_watts = activity["average_watts"].as_f64();
    let np_watts = activity["weighted_average_watts"].as_f64();
    if let Some(avg) = avg_watts {
        lines.push(format!("- Average Power: {:.0} W", avg));
    }
    if let Some(np) = np_watts {
        lines.push(format!(
            "- Normalized Power (weighted_average_watts): {:.0} W",
            np
        ));
    }
    if let (Some(avg), Some(np)) = (avg_watts, np_watts) {
        if avg > 0.0 {
            lines.push(format!("- VI (NP/Avg): {:.3}", np / avg));
        }
    }
    if let Some(max) = activity["max_watts"].as_f64() {
        lines.push(format!("- Max Power: {:.0} W", max));
    }
    if let Some(avg_hr) = activity["average_heartrate"].as_f64() {
        lines.push(format!("- Average Heart Rate: {:.0} bpm", avg_hr));
        if let Some(max_hr) = activity["max_heartrate"].as_f64() {
            lines.push(format!("- Max Heart Rate: {:.0} bpm", max_hr));
        }
    }
    if let Some(cadence) = activity["average_cadence"].as_f64() {
        lines.push(format!("- Average Cadence: {:.0} rpm", cadence));
    }

    if let Some(streams) = streams {
        lines.push(String::new());
        lines.push("- Stream data (time-series) is available for detailed analysis.".to_string());
        match compute_post_climb_power(streams) {
            Some(post) if post.climb_count == 0 => {
                lines.push(
                    "- Post-climb power: not available (no climbs detected in streams)".to_string(),
                );
            }
            Some(post) => match post.post_climb_avg_w {
                Some(watts) => lines.push(format!(
                    "- Post-climb power (median 2-min avg after climbs): {:.0} W (climbs_detected={})",
                    watts, post.climb_count
                )),
                None => lines.push(format!(
                    "- Post-climb power (median 2-min avg after climbs): not available (climbs_detected={})",
                    post.climb_count
                )),
            },
            None => {
                lines.push(
                    "- Post-climb power: not available (missing required streams)".to_string(),
                );
            }
        }
    }

    lines.join("\n")
}

/// Post-climb power estimate derived from telemetry streams.
#[derive(Debug, Clone, PartialEq)]
pub struct PostClimbPower {
    pub climb_count: usize,
    pub post_climb_avg_w: Option<f64>,
}

/// Detect climb ends from altitude-gain windows, then take the median of
/// per-climb average pedaling power over the two minutes after each end.
/// Returns `None` when any required stream is missing or too short.
pub fn compute_post_climb_power(streams: &Value) -> Option<PostClimbPower> {
    let alt = stream_data(streams, "altitude")?;
    let watts = stream_data(streams, "watts")?;
    let vel = stream_data(streams, "velocity_smooth")?;
    let time = stream_data(streams, "time")?;

    let n = alt.len().min(watts.len()).min(vel.len()).min(time.len());
    if n < 60 {
        return None;
    }

    // Sample interval from the time stream, clamped to at least 1s.
    let probe = 10.min(n - 1);
    let dt = if probe > 0 {
        (((time[probe] - time[0]) / probe as f64).round()).max(1.0)
    } else {
        1.0
    };
    let w_steps = ((CLIMB_WINDOW_SECS / dt) as usize).max(1);
    let post_steps = ((POST_WINDOW_SECS / dt) as usize).max(1);

    // Mark samples inside a climb-ish window: enough recent gain, low speed.
    let mut climbish = vec![false; n];
    for i in w_steps..n {
        let gain = alt[i] - alt[i - w_steps];
        if gain >= MIN_ALT_GAIN_M && vel[i] <= MAX_CLIMB_SPEED_MPS {
            climbish[i] = true;
        }
    }

    // Climb end = climbish -> not-climbish transition.
    let ends: Vec<usize> = (1..n).filter(|&i| climbish[i - 1] && !climbish[i]).collect();
    if ends.is_empty() {
        return Some(PostClimbPower {
            climb_count: 0,
            post_climb_avg_w: None,
        });
    }

    let mut post_avgs = Vec::new();
    for &end in &ends {
        let stop = (end + post_steps).min(n);
        let vals: Vec<f64> = (end..stop)
            .filter(|&j| vel[j] >= MIN_MOVING_SPEED_MPS)
            .map(|j| watts[j])
            // Zeros are coasting; the signal is the power floor when pedaling.
            .filter(|&p| p > 0.0)
            .collect();
        if !vals.is_empty() {
            post_avgs.push(vals.iter().sum::<f64>() / vals.len() as f64);
        }
    }

    if post_avgs.is_empty() {
        return Some(PostClimbPower {
            climb_count: ends.len(),
            post_climb_avg_w: None,
        });
    }

    post_avgs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = post_avgs.len() / 2;
    let median = if post_avgs.len() % 2 == 1 {
        post_avgs[mid]
    } else {
        (post_avgs[mid - 1] + post_avgs[mid]) / 2.0
    };

    Some(PostClimbPower {
        climb_count: ends.len(),
        post_climb_avg_w: Some(median),
    })
}

/// Pull one stream's data array as f64s from the key-by-type payload.
fn stream_data(streams: &Value, key: &str) -> Option<Vec<f64>> {
    let data = streams.get(key)?.get("data")?.as_array()?;
    Some(data.iter().filter_map(Value::as_f64).collect())
}
