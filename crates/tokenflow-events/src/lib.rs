//! Event sourcing primitives for the tokenflow simulation engine.
//!
//! Every state change in a simulation is recorded as an immutable event in
//! the [`EventStore`]; node state can be reconstructed by replaying them.
//! This crate provides the log itself, the [`EventQueue`] that orders the
//! not-yet-processed frontier by tick, and the [`TickClock`] that maps ticks
//! onto calendar time.
//!
//! # Modules
//!
//! - [`clock`] -- Tick/timestamp conversion.
//! - [`store`] -- Append-only event log with by-id, by-node and by-cause
//!   indices, causality queries, export and import.
//! - [`queue`] -- Binary min-heap keyed by `(tick, insertion sequence)`.

pub mod clock;
pub mod queue;
pub mod store;

pub use clock::{ClockError, TickClock};
pub use queue::{EventQueue, QueuedEvent};
pub use store::{EventStore, SharedEventStore, StoreError};
