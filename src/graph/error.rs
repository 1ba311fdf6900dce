//! Error types for service graph construction and validation

use crate::runtime::{NodeId, ServletError, ServletId, SlotId};

/// Errors that can occur while building or freezing a service graph
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A node id does not refer to a node in this builder
    #[error("Invalid node: {0}")]
    InvalidNode(NodeId),

    /// A slot id is out of range for the node's slot table
    #[error("Invalid slot {slot} on {node}")]
    InvalidSlot {
        /// The node whose slot table was indexed
        node: NodeId,
        /// The out-of-range slot
        slot: SlotId,
    },

    /// A slot was used against its declared direction
    #[error("Slot {slot} on {node} is not {expected}-capable")]
    InvalidDirection {
        /// The node whose slot was misused
        node: NodeId,
        /// The misused slot
        slot: SlotId,
        /// The direction the operation required
        expected: &'static str,
    },

    /// A (node, slot) endpoint already appears in another pipe
    #[error("Slot {slot} on {node} is already connected")]
    DuplicateSlot {
        /// The node whose slot is already taken
        node: NodeId,
        /// The already-connected slot
        slot: SlotId,
    },

    /// A servlet instance is already claimed by another node
    #[error("{servlet} is already claimed by {node}")]
    ServletInUse {
        /// The contested servlet instance
        servlet: ServletId,
        /// The node holding the claim
        node: NodeId,
    },

    /// A servlet id does not refer to a registered instance
    #[error("Unknown servlet: {0}")]
    UnknownServlet(ServletId),

    /// The graph failed a structural well-formedness check
    #[error("Service graph is not well-formed: {0}")]
    NotWellFormed(String),

    /// A cycle was detected during the topological peel
    #[error("Service graph contains a cycle through {0}")]
    Cycle(NodeId),

    /// The designated input node has incoming pipes
    #[error("Input node {0} has incoming pipes")]
    InputHasIncoming(NodeId),

    /// The designated output node has outgoing pipes
    #[error("Output node {0} has outgoing pipes")]
    OutputHasOutgoing(NodeId),

    /// The designated input node declares more than one input slot
    #[error("Input node {0} must expose exactly one input slot")]
    InputNotSingleSlot(NodeId),

    /// The servlet's type-resolution hook rejected a binding
    #[error("Type hook failed for slot {slot} on {node}")]
    TypeHook {
        /// The node whose binding was written
        node: NodeId,
        /// The slot whose binding was written
        slot: SlotId,
        /// The servlet's rejection
        #[source]
        source: ServletError,
    },
}
