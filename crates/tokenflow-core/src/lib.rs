//! Scenario loading and deterministic replay for the tokenflow engine.
//!
//! This crate ties the event log to the node processors: it loads a
//! scenario graph, owns the canonical node-state table and steps through
//! events forward and backward with snapshot-based time travel.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `tokenflow.yaml` into
//!   strongly-typed structs.
//! - [`scenario`] -- Node and edge declarations with validation.
//! - [`snapshot`] -- Immutable state snapshots and the bounded cache.
//! - [`activity`] -- [`ActivityLogger`] side channel and its sinks.
//! - [`replay`] -- The [`ReplayEngine`].
//!
//! [`ActivityLogger`]: activity::ActivityLogger
//! [`ReplayEngine`]: replay::ReplayEngine

pub mod activity;
pub mod config;
pub mod replay;
pub mod scenario;
pub mod snapshot;
