//! Static dispatch table from node type to processor.

use std::collections::BTreeMap;

use tokenflow_types::NodeType;

use crate::batcher::BatcherProcessor;
use crate::data_source::DataSourceProcessor;
use crate::fsm::FsmProcessor;
use crate::multiplexer::MultiplexerProcessor;
use crate::process::ProcessNodeProcessor;
use crate::processor::NodeProcessor;
use crate::queue::QueueProcessor;
use crate::sink::SinkProcessor;

static DATA_SOURCE: DataSourceProcessor = DataSourceProcessor;
static QUEUE: QueueProcessor = QueueProcessor;
static PROCESS_NODE: ProcessNodeProcessor = ProcessNodeProcessor;
static FSM: FsmProcessor = FsmProcessor;
static MULTIPLEXER: MultiplexerProcessor = MultiplexerProcessor;
static BATCHER: BatcherProcessor = BatcherProcessor;
static SINK: SinkProcessor = SinkProcessor;

/// Maps each [`NodeType`] to the processor that implements it.
///
/// Built once and read-only afterwards; processors are stateless so a
/// single shared instance per type serves every node of that type.
#[derive(Clone)]
pub struct ProcessorRegistry {
    table: BTreeMap<NodeType, &'static dyn NodeProcessor>,
}

impl core::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("node_types", &self.table.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProcessorRegistry {
    /// A registry with no processors.
    pub const fn empty() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    /// A registry with every built-in processor.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(&DATA_SOURCE);
        registry.register(&QUEUE);
        registry.register(&PROCESS_NODE);
        registry.register(&FSM);
        registry.register(&MULTIPLEXER);
        registry.register(&BATCHER);
        registry.register(&SINK);
        registry
    }

    /// Install `processor` for its node type, replacing any previous entry.
    pub fn register(&mut self, processor: &'static dyn NodeProcessor) {
        self.table.insert(processor.node_type(), processor);
    }

    /// Look up the processor for `node_type`.
    pub fn get(&self, node_type: NodeType) -> Option<&'static dyn NodeProcessor> {
        self.table.get(&node_type).copied()
    }

    /// Whether a processor is registered for `node_type`.
    pub fn contains(&self, node_type: NodeType) -> bool {
        self.table.contains_key(&node_type)
    }

    /// Registered node types in order.
    pub fn node_types(&self) -> impl Iterator<Item = NodeType> + '_ {
        self.table.keys().copied()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_covers_every_node_type() {
        let registry = ProcessorRegistry::standard();
        for ty in NodeType::ALL {
            let processor = registry.get(ty);
            assert!(processor.is_some(), "missing processor for {ty}");
            assert_eq!(processor.map(|p| p.node_type()), Some(ty));
        }
        assert_eq!(registry.node_types().count(), NodeType::ALL.len());
    }

    #[test]
    fn empty_registry_resolves_nothing() {
        let mut registry = ProcessorRegistry::empty();
        assert!(!registry.contains(NodeType::Sink));
        registry.register(&SINK);
        assert!(registry.contains(NodeType::Sink));
        assert!(registry.get(NodeType::Fsm).is_none());
    }
}
