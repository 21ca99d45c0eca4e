//! Operator tooling for the event queue.
//!
//! The worker never resets or requeues rows on its own; recovery from a
//! crashed worker (`processing` leftovers) or from `failed` events is an
//! explicit action taken here. `enqueue` synthesizes create-events so
//! historical activities flow through the same pipeline as live webhooks.
//!
//! Usage:
//!   backfill depths
//!   backfill reset-stuck [athlete_id]
//!   backfill requeue-failed [athlete_id]
//!   backfill enqueue <athlete_id> <activity_id>...

use std::path::PathBuf;
use std::process::ExitCode;

use veloreport::db::RideDb;
use veloreport::queue::NewEvent;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "./db/strava.sqlite".to_string());

    let db = match RideDb::open(&PathBuf::from(&db_path)) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open database {}: {}", db_path, e);
            return ExitCode::FAILURE;
        }
    };

    let result = match args.first().map(String::as_str) {
        Some("depths") => depths(&db),
        Some("reset-stuck") => reset_stuck(&db, &args[1..]),
        Some("requeue-failed") => requeue_failed(&db, &args[1..]),
        Some("enqueue") => enqueue(&db, &args[1..]),
        _ => {
            eprintln!(
                "Usage: backfill <depths | reset-stuck [athlete_id] | requeue-failed [athlete_id] | enqueue <athlete_id> <activity_id>...>"
            );
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn depths(db: &RideDb) -> Result<(), String> {
    let d = db.queue_depths().map_err(|e| e.to_string())?;
    println!(
        "queued={} processing={} failed={}",
        d.queued, d.processing, d.failed
    );
    Ok(())
}

fn parse_scope(args: &[String]) -> Result<Option<i64>, String> {
    match args.first() {
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| format!("Invalid athlete_id: {}", raw)),
        None => Ok(None),
    }
}

fn reset_stuck(db: &RideDb, args: &[String]) -> Result<(), String> {
    let scope = parse_scope(args)?;
    let n = db.reset_stuck(scope).map_err(|e| e.to_string())?;
    println!("Reset {} stuck event(s) back to queued", n);
    Ok(())
}

fn requeue_failed(db: &RideDb, args: &[String]) -> Result<(), String> {
    let scope = parse_scope(args)?;
    let n = db.requeue_failed(scope).map_err(|e| e.to_string())?;
    println!("Requeued {} failed event(s)", n);
    Ok(())
}

fn enqueue(db: &RideDb, args: &[String]) -> Result<(), String> {
    if args.len() < 2 {
        return Err("Usage: backfill enqueue <athlete_id> <activity_id>...".to_string());
    }
    let athlete_id: i64 = args[0]
        .parse()
        .map_err(|_| format!("Invalid athlete_id: {}", args[0]))?;

    for raw in &args[1..] {
        let activity_id: i64 = raw
            .parse()
            .map_err(|_| format!("Invalid activity_id: {}", raw))?;
        let id = db
            .enqueue(&NewEvent {
                subscription_id: None,
                owner_id: athlete_id,
                object_type: Some("activity".to_string()),
                object_id: activity_id,
                aspect_type: Some("create".to_string()),
                event_time: None,
                updates: None,
            })
            .map_err(|e| e.to_string())?;
        println!("Enqueued event {} for activity {}", id, activity_id);
    }
    Ok(())
}
