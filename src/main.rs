//! Worker daemon entry point: construct every dependency once, then hand
//! references into the poll loop.

use std::process::ExitCode;

use veloreport::capabilities::Capabilities;
use veloreport::config::Settings;
use veloreport::db::RideDb;
use veloreport::strava::StravaClient;
use veloreport::worker::{Worker, WORKER_VERSION};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    for dir in [&settings.report_output_dir, &settings.pdf_output_dir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            log::error!("Failed to create output dir {}: {}", dir.display(), e);
            return ExitCode::FAILURE;
        }
    }

    let db = match RideDb::open(&settings.db_path) {
        Ok(db) => db,
        Err(e) => {
            log::error!("Failed to open database {}: {}", settings.db_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    // Prompt templates are validated here; a broken template stops the
    // process before any event is claimed.
    let caps = match Capabilities::resolve(&settings) {
        Ok(caps) => caps,
        Err(e) => {
            log::error!("Capability resolution failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let client = StravaClient::new(settings.client_id, settings.client_secret.clone());

    caps.log_startup(&settings);
    log::info!("WORKER_VERSION: {}", WORKER_VERSION);
    log::info!("DB_PATH: {}", settings.db_path.display());
    log::info!("REPORT_OUTPUT_DIR: {}", settings.report_output_dir.display());
    log::info!("PDF_OUTPUT_DIR: {}", settings.pdf_output_dir.display());

    Worker::new(&db, &client, &caps, &settings).run().await;
    ExitCode::SUCCESS
}
