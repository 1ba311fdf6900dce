//! Frozen service graph.
//!
//! `ServiceGraph` is produced by [`ServiceBuilder::freeze`] and never
//! mutates afterwards, with one exception: per-slot pipe-type bindings,
//! which are written once by the framing layer behind a read-mostly lock.
//! Everything else is queried without synchronization by every scheduler
//! thread.
//!
//! [`ServiceBuilder::freeze`]: super::ServiceBuilder::freeze

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

use smallvec::SmallVec;

use crate::runtime::{
    NodeId, Servlet, ServletError, ServletId, ServletRegistry, SlotDef, SlotId, SlotKind,
    TaskDelegate, TaskFlags,
};

use super::builder::{node_id_at, PipeDescriptor};
use super::error::GraphError;

/// Resolved concrete type for one slot.
#[derive(Debug, Clone)]
struct TypeBinding {
    type_name: String,
    header_size: usize,
}

struct ServiceNode {
    servlet: ServletId,
    flags: TaskFlags,
    /// Slot table snapshot taken at freeze time.
    slots: Vec<SlotDef>,
    incoming: SmallVec<[PipeDescriptor; 4]>,
    /// Sorted by source slot id. The order is load-bearing: a shadow slot
    /// always carries a larger id than its target, so walking this list in
    /// order guarantees the target's transport exists before the fork.
    outgoing: SmallVec<[PipeDescriptor; 4]>,
    bindings: Vec<RwLock<Option<TypeBinding>>>,
}

/// The immutable, validated service graph.
pub struct ServiceGraph {
    nodes: Vec<ServiceNode>,
    input: (NodeId, SlotId),
    output: (NodeId, SlotId),
    registry: Arc<ServletRegistry>,
}

impl std::fmt::Debug for ServiceGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceGraph")
            .field("node_count", &self.nodes.len())
            .field("input", &self.input)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

impl ServiceGraph {
    pub(super) fn freeze(
        registry: Arc<ServletRegistry>,
        node_defs: Vec<(ServletId, TaskFlags)>,
        pipes: Vec<PipeDescriptor>,
        input: Option<(NodeId, SlotId)>,
        output: Option<(NodeId, SlotId)>,
        reuse_servlet: bool,
    ) -> Result<Self, GraphError> {
        if node_defs.is_empty() {
            return Err(GraphError::NotWellFormed("graph has no nodes".into()));
        }
        let input =
            input.ok_or_else(|| GraphError::NotWellFormed("no input node designated".into()))?;
        let output =
            output.ok_or_else(|| GraphError::NotWellFormed("no output node designated".into()))?;

        let mut nodes = Vec::with_capacity(node_defs.len());
        for (idx, &(servlet, flags)) in node_defs.iter().enumerate() {
            let node = node_id_at(idx)?;
            registry.claim(servlet, node, reuse_servlet)?;
            let slots = registry
                .slots(servlet)
                .ok_or(GraphError::UnknownServlet(servlet))?;
            let bindings = slots.iter().map(|_| RwLock::new(None)).collect();
            nodes.push(ServiceNode {
                servlet,
                flags,
                slots,
                incoming: SmallVec::new(),
                outgoing: SmallVec::new(),
                bindings,
            });
        }

        for desc in &pipes {
            nodes[desc.source_node.0 as usize].outgoing.push(*desc);
            nodes[desc.destination_node.0 as usize].incoming.push(*desc);
        }
        for node in &mut nodes {
            node.outgoing.sort_by_key(|d| d.source_slot);
        }

        let graph = Self {
            nodes,
            input,
            output,
            registry,
        };
        graph.check_shadow_slots()?;
        graph.check_endpoints()?;
        graph.check_reachable_acyclic()?;
        Ok(graph)
    }

    /// Every connected shadow slot must fork an output slot of the same
    /// node with a smaller slot id, and that target must itself be
    /// connected so its transport is allocated first.
    fn check_shadow_slots(&self) -> Result<(), GraphError> {
        for (idx, node) in self.nodes.iter().enumerate() {
            let node_id = node_id_at(idx)?;
            for desc in &node.outgoing {
                let slot = desc.source_slot;
                let SlotKind::Shadow(target) = node.slots[slot.0 as usize].kind else {
                    continue;
                };
                let target_kind = node
                    .slots
                    .get(target.0 as usize)
                    .map(|def| def.kind)
                    .ok_or(GraphError::InvalidSlot {
                        node: node_id,
                        slot: target,
                    })?;
                if target_kind != SlotKind::Output || target >= slot {
                    return Err(GraphError::NotWellFormed(format!(
                        "shadow slot {slot} on {node_id} must target an output slot with a smaller id"
                    )));
                }
                if !node.outgoing.iter().any(|d| d.source_slot == target) {
                    return Err(GraphError::NotWellFormed(format!(
                        "shadow slot {slot} on {node_id} targets unconnected slot {target}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_endpoints(&self) -> Result<(), GraphError> {
        let (in_node, _) = self.input;
        let (out_node, _) = self.output;

        let input_node = &self.nodes[in_node.0 as usize];
        if !input_node.incoming.is_empty() {
            return Err(GraphError::InputHasIncoming(in_node));
        }
        let input_slots = input_node
            .slots
            .iter()
            .filter(|s| s.kind == SlotKind::Input)
            .count();
        if input_slots != 1 {
            return Err(GraphError::InputNotSingleSlot(in_node));
        }

        if !self.nodes[out_node.0 as usize].outgoing.is_empty() {
            return Err(GraphError::OutputHasOutgoing(out_node));
        }
        Ok(())
    }

    /// Topological peel seeded at the input node.
    ///
    /// Every node must be consumed: a leftover node with pending incoming
    /// pipes sits on a cycle; a leftover node with none is unreachable
    /// from the input and the graph is rejected outright.
    fn check_reachable_acyclic(&self) -> Result<(), GraphError> {
        let mut in_degree: Vec<usize> =
            self.nodes.iter().map(|n| n.incoming.len()).collect();
        let mut visited = vec![false; self.nodes.len()];

        let mut queue = VecDeque::new();
        queue.push_back(self.input.0);
        visited[self.input.0 .0 as usize] = true;

        while let Some(node) = queue.pop_front() {
            for desc in &self.nodes[node.0 as usize].outgoing {
                let target = desc.destination_node.0 as usize;
                in_degree[target] -= 1;
                if in_degree[target] == 0 && !visited[target] {
                    visited[target] = true;
                    queue.push_back(desc.destination_node);
                }
            }
        }

        for (idx, seen) in visited.iter().enumerate() {
            if *seen {
                continue;
            }
            let node = node_id_at(idx)?;
            if in_degree[idx] > 0 {
                return Err(GraphError::Cycle(node));
            }
            return Err(GraphError::NotWellFormed(format!(
                "{node} is unreachable from the input node"
            )));
        }
        Ok(())
    }

    // ---- Type resolution ----

    /// Writes the resolved concrete type for one slot and notifies the
    /// owning servlet's hook.
    ///
    /// Rebinding the same slot replaces the previous binding; the hook runs
    /// exactly once per write. Reads are safe concurrently afterwards.
    ///
    /// # Errors
    ///
    /// Bad endpoints raise `InvalidNode` / `InvalidSlot`; a hook rejection
    /// is wrapped in [`GraphError::TypeHook`].
    pub fn resolve_pipe_type(
        &self,
        node: NodeId,
        slot: SlotId,
        type_name: &str,
        header_size: usize,
    ) -> Result<(), GraphError> {
        let entry = self
            .nodes
            .get(node.0 as usize)
            .ok_or(GraphError::InvalidNode(node))?;
        let binding = entry
            .bindings
            .get(slot.0 as usize)
            .ok_or(GraphError::InvalidSlot { node, slot })?;

        *binding.write().unwrap_or_else(PoisonError::into_inner) = Some(TypeBinding {
            type_name: type_name.to_string(),
            header_size,
        });

        let servlet = self
            .registry
            .servlet(entry.servlet)
            .ok_or(GraphError::UnknownServlet(entry.servlet))?;
        servlet
            .on_type_resolved(slot, type_name)
            .map_err(|source| GraphError::TypeHook { node, slot, source })?;

        tracing::trace!(%node, %slot, type_name, header_size, "Resolved pipe type");
        Ok(())
    }

    // ---- Read accessors (safe for unsynchronized concurrent use) ----

    /// Number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The designated (node, slot) request entry point.
    #[must_use]
    pub fn input(&self) -> (NodeId, SlotId) {
        self.input
    }

    /// The designated (node, slot) response exit point.
    #[must_use]
    pub fn output(&self) -> (NodeId, SlotId) {
        self.output
    }

    /// Pipes arriving at `node`.
    #[must_use]
    pub fn incoming_pipes(&self, node: NodeId) -> &[PipeDescriptor] {
        self.nodes
            .get(node.0 as usize)
            .map_or(&[], |n| n.incoming.as_slice())
    }

    /// Pipes leaving `node`, sorted by source slot id.
    #[must_use]
    pub fn outgoing_pipes(&self, node: NodeId) -> &[PipeDescriptor] {
        self.nodes
            .get(node.0 as usize)
            .map_or(&[], |n| n.outgoing.as_slice())
    }

    /// Total pipes in the graph.
    #[must_use]
    pub fn pipe_count(&self) -> usize {
        self.nodes.iter().map(|n| n.outgoing.len()).sum()
    }

    /// Slot table size of `node`.
    #[must_use]
    pub fn slot_count(&self, node: NodeId) -> usize {
        self.nodes.get(node.0 as usize).map_or(0, |n| n.slots.len())
    }

    /// Declared direction of a slot.
    #[must_use]
    pub fn slot_kind(&self, node: NodeId, slot: SlotId) -> Option<SlotKind> {
        self.nodes
            .get(node.0 as usize)
            .and_then(|n| n.slots.get(slot.0 as usize))
            .map(|def| def.kind)
    }

    /// Resolved concrete type name for a slot, if bound.
    #[must_use]
    pub fn pipe_type(&self, node: NodeId, slot: SlotId) -> Option<String> {
        self.binding(node, slot).map(|b| b.type_name)
    }

    /// Typed header size for a slot; zero until a binding is written.
    #[must_use]
    pub fn header_size(&self, node: NodeId, slot: SlotId) -> usize {
        self.binding(node, slot).map_or(0, |b| b.header_size)
    }

    /// Flags carried by every task instantiated for `node`.
    #[must_use]
    pub fn task_flags(&self, node: NodeId) -> TaskFlags {
        self.nodes
            .get(node.0 as usize)
            .map_or(TaskFlags::NONE, |n| n.flags)
    }

    /// The servlet instance backing `node`.
    #[must_use]
    pub fn servlet_id(&self, node: NodeId) -> Option<ServletId> {
        self.nodes.get(node.0 as usize).map(|n| n.servlet)
    }

    /// Init arguments of the servlet backing `node`.
    #[must_use]
    pub fn init_args(&self, node: NodeId) -> Option<Vec<String>> {
        self.nodes
            .get(node.0 as usize)
            .and_then(|n| self.registry.init_args(n.servlet))
    }

    /// Creates a fresh delegate for one request's task at `node`.
    ///
    /// # Errors
    ///
    /// Propagates the servlet's [`ServletError::DelegateCreation`].
    pub fn create_delegate(&self, node: NodeId) -> Result<Box<dyn TaskDelegate>, ServletError> {
        let entry = self.nodes.get(node.0 as usize).ok_or_else(|| {
            ServletError::DelegateCreation(format!("{node} is not in the graph"))
        })?;
        let servlet: Arc<dyn Servlet> = self.registry.servlet(entry.servlet).ok_or_else(|| {
            ServletError::DelegateCreation(format!("{} is not registered", entry.servlet))
        })?;
        servlet.create_delegate(entry.flags)
    }

    fn binding(&self, node: NodeId, slot: SlotId) -> Option<TypeBinding> {
        self.nodes
            .get(node.0 as usize)
            .and_then(|n| n.bindings.get(slot.0 as usize))
            .and_then(|lock| {
                lock.read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
    }
}
