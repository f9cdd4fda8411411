//! Shared type definitions for the tokenflow simulation engine.
//!
//! This crate is the single source of truth for the records that cross crate
//! boundaries: the event log entries, the tokens they carry, the static node
//! configuration supplied by the workflow editor, and the per-node state the
//! replay engine threads through processors. Types flow to `TypeScript` via
//! `ts-rs` for the editor front end.
//!
//! # Modules
//!
//! - [`ids`] -- Event, node and token identifiers
//! - [`enums`] -- Event types, node types, token kinds, activity levels
//! - [`structs`] -- Events, tokens, node configuration and state, activities

pub mod enums;
pub mod ids;
pub mod structs;

pub use enums::{ActivityLevel, EventType, NodeType, TokenKind};
pub use ids::{EventId, NodeId, TokenId};
pub use structs::{
    Activity, BatchAccumulator, Edge, Event, NewEvent, NodeConfig, NodeInternalState,
    StateTransitionRecord, Token, PORT_KEY,
};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation.

    #[test]
    fn export_bindings() {
        use ts_rs::TS;

        let _ = crate::ids::EventId::export_all();
        let _ = crate::ids::NodeId::export_all();
        let _ = crate::ids::TokenId::export_all();

        let _ = crate::enums::EventType::export_all();
        let _ = crate::enums::NodeType::export_all();
        let _ = crate::enums::TokenKind::export_all();
        let _ = crate::enums::ActivityLevel::export_all();

        let _ = crate::structs::Event::export_all();
        let _ = crate::structs::Token::export_all();
        let _ = crate::structs::NodeConfig::export_all();
        let _ = crate::structs::Edge::export_all();
        let _ = crate::structs::StateTransitionRecord::export_all();
        let _ = crate::structs::BatchAccumulator::export_all();
        let _ = crate::structs::NodeInternalState::export_all();
        let _ = crate::structs::Activity::export_all();
    }
}
