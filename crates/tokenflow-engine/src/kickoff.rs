//! Kickoff events that start a fresh run.

use tokenflow_core::scenario::Scenario;
use tokenflow_events::{SharedEventStore, StoreError};
use tokenflow_types::{Event, NewEvent, NodeType};
use tracing::{debug, info};

/// Append one `SimulationStart` at tick 0 for every data source.
///
/// A store that already holds root events is left as it is, so a run over
/// an imported log does not get a second set of kickoffs.
///
/// # Errors
///
/// Returns the [`StoreError`] of a failed append.
pub fn seed_kickoff(
    store: &SharedEventStore,
    scenario: &Scenario,
) -> Result<Vec<Event>, StoreError> {
    let existing = store.read(|s| s.root_events().len())?;
    if existing > 0 {
        info!(existing, "Store already has root events, skipping kickoff");
        return Ok(Vec::new());
    }

    let drafts: Vec<NewEvent> = scenario
        .nodes_of_type(NodeType::DataSource)
        .map(|node| NewEvent::simulation_start(node, 0))
        .collect();
    for draft in &drafts {
        debug!(node = %draft.source_node_id, "Seeding kickoff");
    }
    let seeded = store.append_events(drafts)?;
    info!(count = seeded.len(), "Kickoff events seeded");
    Ok(seeded)
}
