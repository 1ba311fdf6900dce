//! Service graph builder API.
//!
//! Provides `ServiceBuilder` for incremental graph construction: register
//! nodes against loaded servlets, connect slots with directed pipes, and
//! designate the request input/output endpoints. `freeze()` validates the
//! whole structure and produces the immutable [`ServiceGraph`].

use std::fmt;
use std::sync::Arc;

use crate::runtime::{NodeId, ServletId, ServletRegistry, SlotId, SlotKind, TaskFlags};

use super::error::GraphError;
use super::service::ServiceGraph;

/// Converts a node index into a `NodeId`, refusing indices past the id
/// space instead of silently truncating.
pub(super) fn node_id_at(index: usize) -> Result<NodeId, GraphError> {
    u32::try_from(index)
        .map(NodeId)
        .map_err(|_| GraphError::NotWellFormed("node id space exhausted".into()))
}

/// A directed edge between two (node, slot) endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeDescriptor {
    /// Upstream node.
    pub source_node: NodeId,
    /// Output-capable slot on the upstream node.
    pub source_slot: SlotId,
    /// Downstream node.
    pub destination_node: NodeId,
    /// Input slot on the downstream node.
    pub destination_slot: SlotId,
}

impl PipeDescriptor {
    /// Convenience constructor.
    #[must_use]
    pub fn new(
        source_node: NodeId,
        source_slot: SlotId,
        destination_node: NodeId,
        destination_slot: SlotId,
    ) -> Self {
        Self {
            source_node,
            source_slot,
            destination_node,
            destination_slot,
        }
    }
}

impl fmt::Display for PipeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<node {}, slot {}> -> <node {}, slot {}>",
            self.source_node.0, self.source_slot.0, self.destination_node.0, self.destination_slot.0
        )
    }
}

/// Mutable service graph under construction.
///
/// Once `freeze()` succeeds the topology is immutable; the builder is
/// consumed and every query goes through the returned [`ServiceGraph`].
pub struct ServiceBuilder {
    registry: Arc<ServletRegistry>,
    /// One (servlet, flags) pair per node, indexed by `NodeId`.
    nodes: Vec<(ServletId, TaskFlags)>,
    pipes: Vec<PipeDescriptor>,
    input: Option<(NodeId, SlotId)>,
    output: Option<(NodeId, SlotId)>,
    reuse_servlet: bool,
}

impl ServiceBuilder {
    /// Creates an empty builder over the given servlet registry.
    #[must_use]
    pub fn new(registry: Arc<ServletRegistry>) -> Self {
        Self {
            registry,
            nodes: Vec::new(),
            pipes: Vec::new(),
            input: None,
            output: None,
            reuse_servlet: false,
        }
    }

    /// Permits one servlet instance to back multiple nodes.
    pub fn allow_servlet_reuse(&mut self) -> &mut Self {
        self.reuse_servlet = true;
        self
    }

    /// Adds a node backed by `servlet` with no flags.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownServlet`] for an unregistered id.
    pub fn add_node(&mut self, servlet: ServletId) -> Result<NodeId, GraphError> {
        self.add_node_with_flags(servlet, TaskFlags::NONE)
    }

    /// Adds a node backed by `servlet`, carrying `flags` into every task
    /// instantiated for it.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownServlet`] for an unregistered id, and
    /// [`GraphError::NotWellFormed`] once the node id space is exhausted.
    pub fn add_node_with_flags(
        &mut self,
        servlet: ServletId,
        flags: TaskFlags,
    ) -> Result<NodeId, GraphError> {
        if self.registry.servlet(servlet).is_none() {
            return Err(GraphError::UnknownServlet(servlet));
        }
        let id = node_id_at(self.nodes.len())?;
        self.nodes.push((servlet, flags));
        tracing::trace!(node = %id, servlet = %servlet, "Added service node");
        Ok(id)
    }

    /// Connects two slots with a directed pipe.
    ///
    /// # Errors
    ///
    /// Returns `InvalidNode` / `InvalidSlot` for bad endpoints,
    /// `InvalidDirection` when a slot is used against its declared
    /// direction, and `DuplicateSlot` when either endpoint already appears
    /// in another pipe.
    pub fn add_pipe(&mut self, desc: PipeDescriptor) -> Result<(), GraphError> {
        let source_kind = self.slot_kind(desc.source_node, desc.source_slot)?;
        if !source_kind.is_output() {
            return Err(GraphError::InvalidDirection {
                node: desc.source_node,
                slot: desc.source_slot,
                expected: "output",
            });
        }
        let dest_kind = self.slot_kind(desc.destination_node, desc.destination_slot)?;
        if dest_kind != SlotKind::Input {
            return Err(GraphError::InvalidDirection {
                node: desc.destination_node,
                slot: desc.destination_slot,
                expected: "input",
            });
        }

        for existing in &self.pipes {
            if existing.source_node == desc.source_node
                && existing.source_slot == desc.source_slot
            {
                return Err(GraphError::DuplicateSlot {
                    node: desc.source_node,
                    slot: desc.source_slot,
                });
            }
            if existing.destination_node == desc.destination_node
                && existing.destination_slot == desc.destination_slot
            {
                return Err(GraphError::DuplicateSlot {
                    node: desc.destination_node,
                    slot: desc.destination_slot,
                });
            }
        }

        tracing::trace!(pipe = %desc, "Added service pipe");
        self.pipes.push(desc);
        Ok(())
    }

    /// Designates the request entry point.
    ///
    /// # Errors
    ///
    /// The slot must exist and be an input slot.
    pub fn set_input(&mut self, node: NodeId, slot: SlotId) -> Result<(), GraphError> {
        if self.slot_kind(node, slot)? != SlotKind::Input {
            return Err(GraphError::InvalidDirection {
                node,
                slot,
                expected: "input",
            });
        }
        self.input = Some((node, slot));
        Ok(())
    }

    /// Designates the response exit point.
    ///
    /// # Errors
    ///
    /// The slot must exist and be output-capable.
    pub fn set_output(&mut self, node: NodeId, slot: SlotId) -> Result<(), GraphError> {
        if !self.slot_kind(node, slot)?.is_output() {
            return Err(GraphError::InvalidDirection {
                node,
                slot,
                expected: "output",
            });
        }
        self.output = Some((node, slot));
        Ok(())
    }

    /// Validates the whole graph and produces the immutable service graph.
    ///
    /// # Errors
    ///
    /// Returns `NotWellFormed` for missing endpoints, unreachable nodes or
    /// broken shadow targets, `Cycle` when the topological peel cannot
    /// consume every node, and the endpoint-shape errors
    /// (`InputHasIncoming`, `OutputHasOutgoing`, `InputNotSingleSlot`).
    pub fn freeze(self) -> Result<ServiceGraph, GraphError> {
        ServiceGraph::freeze(
            self.registry,
            self.nodes,
            self.pipes,
            self.input,
            self.output,
            self.reuse_servlet,
        )
    }

    fn slot_kind(&self, node: NodeId, slot: SlotId) -> Result<SlotKind, GraphError> {
        let (servlet, _) = *self
            .nodes
            .get(node.0 as usize)
            .ok_or(GraphError::InvalidNode(node))?;
        let slots = self
            .registry
            .slots(servlet)
            .ok_or(GraphError::UnknownServlet(servlet))?;
        slots
            .get(slot.0 as usize)
            .map(|def| def.kind)
            .ok_or(GraphError::InvalidSlot { node, slot })
    }
}
