//! Optional pipeline capabilities, resolved once at startup.
//!
//! The original deployment toggled analysis, summarization, and PDF output
//! by whether optional pieces were configured or installed. Here that is an
//! explicit capability set: each field is bound (or not) exactly once in
//! `resolve`, and the worker checks fields before each best-effort stage.
//! A configured-but-broken prompt template fails the process at startup
//! rather than per-event.

use crate::analyzer::{OpenAiRideAnalyzer, RideAnalyzer};
use crate::config::Settings;
use crate::openai::CompletionClient;
use crate::pdf::PdfRenderer;
use crate::prompt::{PromptError, PromptTemplate};
use crate::summarizer::{OpenAiProgressSummarizer, ProgressSummarizer};

pub struct Capabilities {
    pub analyzer: Option<Box<dyn RideAnalyzer>>,
    pub summarizer: Option<Box<dyn ProgressSummarizer>>,
    pub pdf: Option<PdfRenderer>,
}

impl Capabilities {
    /// Bind capabilities from settings. Analysis requires an API key and a
    /// valid ride template; summarization additionally requires the enable
    /// flag and its own template; PDF requires a converter on PATH.
    pub fn resolve(settings: &Settings) -> Result<Self, PromptError> {
        let mut analyzer: Option<Box<dyn RideAnalyzer>> = None;
        let mut summarizer: Option<Box<dyn ProgressSummarizer>> = None;

        if let Some(api_key) = &settings.openai_api_key {
            let ride_template = PromptTemplate::load(&settings.ride_prompt_path, "ride_brief")?;
            analyzer = Some(Box::new(OpenAiRideAnalyzer::new(
                CompletionClient::new(api_key.clone(), settings.openai_base_url.clone()),
                ride_template,
                settings.openai_model.clone(),
            )));

            if settings.progress_summary_enabled {
                let progress_template =
                    PromptTemplate::load(&settings.progress_prompt_path, "reports")?;
                summarizer = Some(Box::new(OpenAiProgressSummarizer::new(
                    CompletionClient::new(api_key.clone(), settings.openai_base_url.clone()),
                    progress_template,
                    settings.openai_model.clone(),
                    settings.progress_summary_max_chars,
                )));
            }
        }

        Ok(Self {
            analyzer,
            summarizer,
            pdf: PdfRenderer::detect(),
        })
    }

    /// Startup banner: one line per capability, stating why when disabled.
    pub fn log_startup(&self, settings: &Settings) {
        if self.analyzer.is_some() {
            log::info!("AI ride analysis enabled");
        } else {
            log::info!("AI ride analysis disabled (OPENAI_API_KEY not set)");
        }
        log::info!("Markdown report generation enabled");
        if self.pdf.is_none() {
            log::info!("PDF generation disabled (no converter found on PATH)");
        }
        if self.summarizer.is_some() {
            log::info!("Progress summary enabled");
        } else if !settings.progress_summary_enabled {
            log::info!("Progress summary disabled (PROGRESS_SUMMARY_ENABLED=0)");
        } else {
            log::info!("Progress summary disabled (OPENAI_API_KEY not set)");
        }
    }
}
