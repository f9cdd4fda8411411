//! Engine binary for tokenflow.
//!
//! Loads configuration and a scenario, seeds kickoff events, replays the
//! scenario to completion and optionally exports the resulting event log
//! as JSON.
//!
//! # Usage
//!
//! ```text
//! tokenflow-engine <scenario.yaml|scenario.json> [export.json]
//! ```
//!
//! The scenario path may also come from `TOKENFLOW_SCENARIO`, and the
//! configuration path from `TOKENFLOW_CONFIG` (default `tokenflow.yaml`).
//!
//! # Startup Sequence
//!
//! 1. Load configuration
//! 2. Initialize structured logging (tracing)
//! 3. Create the tick clock and event store
//! 4. Load and validate the scenario
//! 5. Seed kickoff events
//! 6. Replay on a blocking worker while activities drain to the log
//! 7. Log the result and export the event log

mod error;
mod kickoff;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokenflow_core::activity::{ActivityLogger, ChannelActivityLogger, TracingActivityLogger};
use tokenflow_core::config::{EngineConfig, LogFormat, LoggingConfig};
use tokenflow_core::replay::ReplayEngine;
use tokenflow_core::scenario::Scenario;
use tokenflow_events::{EventStore, SharedEventStore, TickClock};
use tokenflow_nodes::ProcessorRegistry;
use tokenflow_types::ActivityLevel;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Environment variable naming the scenario file.
const SCENARIO_ENV: &str = "TOKENFLOW_SCENARIO";

/// Environment variable naming the configuration file.
const CONFIG_ENV: &str = "TOKENFLOW_CONFIG";

/// Default configuration file.
const DEFAULT_CONFIG: &str = "tokenflow.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if any startup step, the replay or the export fails.
/// Failures inside individual replay steps are logged, not returned.
#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config = load_config()?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!("tokenflow-engine starting");
    info!(
        tick_duration_ms = config.clock.tick_duration_ms,
        snapshot_strategy = ?config.replay.snapshot_strategy,
        max_steps = config.replay.max_steps,
        "Configuration loaded"
    );

    // 3. Create the tick clock and event store.
    let clock = TickClock::new(config.clock.epoch, config.clock.tick_duration_ms)
        .map_err(EngineError::from)?;
    let store = SharedEventStore::new(EventStore::new(clock));

    // 4. Load the scenario.
    let mut args = std::env::args().skip(1);
    let scenario_path = args
        .next()
        .or_else(|| std::env::var(SCENARIO_ENV).ok())
        .map(PathBuf::from)
        .ok_or(EngineError::MissingScenario { env: SCENARIO_ENV })?;
    let export_path = args.next().map(PathBuf::from);

    let scenario = Scenario::from_file(&scenario_path).map_err(EngineError::from)?;
    info!(
        path = %scenario_path.display(),
        nodes = scenario.nodes.len(),
        edges = scenario.edges.len(),
        "Scenario loaded"
    );

    // 5. Seed kickoff events.
    kickoff::seed_kickoff(&store, &scenario).map_err(EngineError::from)?;

    // 6. Replay, draining activities on a separate task.
    let (logger, mut activities) = ChannelActivityLogger::new();
    let drain = tokio::spawn(async move {
        let sink = TracingActivityLogger;
        let mut failed: usize = 0;
        while let Some(activity) = activities.recv().await {
            if activity.level == ActivityLevel::Error {
                failed = failed.saturating_add(1);
            }
            sink.log(&activity);
        }
        failed
    });

    let mut engine = ReplayEngine::new(
        scenario,
        ProcessorRegistry::standard(),
        store.clone(),
        config.replay,
    )
    .map_err(EngineError::from)?
    .with_logger(Arc::new(logger));

    let result = tokio::task::spawn_blocking(move || engine.replay_all())
        .await
        .map_err(|e| EngineError::Task {
            message: format!("replay worker: {e}"),
        })?
        .map_err(EngineError::from)?;

    let failed_activities = drain.await.map_err(|e| EngineError::Task {
        message: format!("activity drain: {e}"),
    })?;

    // 7. Report and export.
    info!(
        success = result.success,
        events_processed = result.events_processed,
        final_tick = result.final_tick,
        errors = result.errors.len(),
        failed_activities,
        log_size = store.len().map_err(EngineError::from)?,
        "Replay complete"
    );
    for step_error in &result.errors {
        warn!(
            step = step_error.step,
            node = ?step_error.node_id,
            kind = %step_error.kind,
            "{}",
            step_error.message
        );
    }

    if let Some(path) = export_path {
        let json = store.export_events().map_err(EngineError::from)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(EngineError::from)?;
        info!(path = %path.display(), "Event log exported");
    }

    if !result.success {
        error!("Replay finished with step errors");
    }
    info!("tokenflow-engine shutdown complete");
    Ok(())
}

/// Set up the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Load configuration from `TOKENFLOW_CONFIG` or `tokenflow.yaml`.
///
/// Falls back to defaults if the file does not exist.
fn load_config() -> Result<EngineConfig, EngineError> {
    let configured = std::env::var(CONFIG_ENV).ok();
    let path = Path::new(configured.as_deref().unwrap_or(DEFAULT_CONFIG));
    if path.exists() {
        Ok(EngineConfig::from_file(path)?)
    } else {
        // Defaults plus the log-level override.
        EngineConfig::parse("").map_err(EngineError::from)
    }
}
