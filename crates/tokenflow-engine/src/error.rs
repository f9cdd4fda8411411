//! Error types for the engine binary.
//!
//! [`EngineError`] wraps every failure mode of startup, replay and export
//! so `main` can propagate with `?`.

/// Top-level error for the engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: tokenflow_core::config::ConfigError,
    },

    /// Tick clock construction failed.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: tokenflow_events::ClockError,
    },

    /// The scenario could not be loaded.
    #[error("scenario error: {source}")]
    Scenario {
        /// The underlying scenario error.
        #[from]
        source: tokenflow_core::scenario::ScenarioError,
    },

    /// Seeding or exporting the event log failed.
    #[error("event store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: tokenflow_events::StoreError,
    },

    /// The replay could not run.
    #[error("replay error: {source}")]
    Replay {
        /// The underlying replay error.
        #[from]
        source: tokenflow_core::replay::ReplayError,
    },

    /// Writing the exported log failed.
    #[error("export error: {source}")]
    Export {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// No scenario path was given.
    #[error("no scenario given: pass a path or set {env}")]
    MissingScenario {
        /// The environment variable that can name the scenario.
        env: &'static str,
    },

    /// A background task failed to complete.
    #[error("task error: {message}")]
    Task {
        /// Description of the task failure.
        message: String,
    },
}
