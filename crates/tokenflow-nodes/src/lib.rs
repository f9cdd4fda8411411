//! Node processors for the tokenflow simulation engine.
//!
//! Each node type has one stateless [`NodeProcessor`]. A processor maps an
//! event, the node's static configuration and its current state to new
//! events, a successor state and activity entries, with no I/O and no
//! unseeded randomness. The replay engine calls processors only through
//! [`invoke`], which contains failures so one node cannot abort a step.
//!
//! # Modules
//!
//! - [`processor`] -- The processor trait and the invocation boundary
//! - [`registry`] -- Node type to processor dispatch table
//! - [`expr`] -- Condition expressions for guards and routing
//! - [`error`] -- Processor error types
//! - [`data_source`], [`queue`], [`process`], [`fsm`], [`multiplexer`],
//!   [`batcher`], [`sink`] -- The built-in processors

pub mod batcher;
pub mod data_source;
pub mod error;
pub mod expr;
pub mod fsm;
pub mod multiplexer;
pub mod process;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod sink;

pub use error::ProcessorError;
pub use expr::{Expr, ExprError};
pub use processor::{Invocation, NodeProcessor, ProcessorResult, invoke};
pub use registry::ProcessorRegistry;
