//! Servlet runtime seam.
//!
//! A servlet is an externally loaded computation unit. It declares a slot
//! table (named, direction-typed attachment points for pipes) and hands the
//! scheduler a fresh [`TaskDelegate`] per request. The engine owns slot
//! layout, type resolution, and delegate lifecycle; servlet business logic
//! stays behind the traits defined here.

mod registry;

pub use registry::ServletRegistry;

use std::any::Any;
use std::fmt;

use crate::pipe::PipeHandle;

/// Identifies a node in a service graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Identifies one slot in a servlet's slot table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u16);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotId({})", self.0)
    }
}

/// Identifies a servlet instance in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServletId(pub u32);

impl fmt::Display for ServletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServletId({})", self.0)
    }
}

/// Per-node flag word carried from graph construction into the delegate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskFlags(pub u32);

impl TaskFlags {
    /// No flags set
    pub const NONE: Self = Self(0);
    /// The node's delegate may offload its slow fragment to the async pool
    pub const ASYNC: Self = Self(1);

    /// True when every flag in `other` is set in `self`.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Direction of a slot in a servlet's slot table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Receives a pipe end from an upstream node
    Input,
    /// Produces into a freshly allocated pipe
    Output,
    /// An output slot that forks the transport already allocated for the
    /// named output slot of the same node
    Shadow(SlotId),
}

impl SlotKind {
    /// True for slots that act as pipe sources (`Output` and `Shadow`).
    #[must_use]
    pub fn is_output(self) -> bool {
        matches!(self, Self::Output | Self::Shadow(_))
    }
}

/// One entry in a servlet's slot table.
#[derive(Debug, Clone)]
pub struct SlotDef {
    /// Servlet-chosen slot name, unique within the table.
    pub name: String,
    /// Slot direction.
    pub kind: SlotKind,
}

impl SlotDef {
    /// Convenience constructor.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: SlotKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Opaque request-scope payload supplied by the embedder.
///
/// The scheduler stores the token for the request's lifetime and exposes it
/// to every delegate of the request; it never interprets the contents.
#[derive(Default)]
pub struct ScopeToken(Option<Box<dyn Any + Send>>);

impl fmt::Debug for ScopeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScopeToken")
            .field(&self.0.as_ref().map(|_| "..."))
            .finish()
    }
}

impl ScopeToken {
    /// Wraps an embedder payload.
    #[must_use]
    pub fn new(payload: impl Any + Send) -> Self {
        Self(Some(Box::new(payload)))
    }

    /// A scope with no payload.
    #[must_use]
    pub fn empty() -> Self {
        Self(None)
    }

    /// Borrows the payload, if present and of type `T`.
    #[must_use]
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(<dyn Any + Send>::downcast_ref)
    }
}

/// Execution context handed to a delegate for one invocation.
///
/// Pipe slots are indexed by [`SlotId`]; a slot holds `None` until the
/// scheduler wires it and after the delegate takes the end out.
pub struct TaskContext<'a> {
    node: NodeId,
    scope: &'a ScopeToken,
    pipes: &'a mut [Option<PipeHandle>],
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        node: NodeId,
        scope: &'a ScopeToken,
        pipes: &'a mut [Option<PipeHandle>],
    ) -> Self {
        Self { node, scope, pipes }
    }

    /// The node this invocation belongs to.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The owning request's scope payload.
    #[must_use]
    pub fn scope(&self) -> &ScopeToken {
        self.scope
    }

    /// Borrows the pipe end wired to `slot`, if any.
    #[must_use]
    pub fn pipe(&self, slot: SlotId) -> Option<&PipeHandle> {
        self.pipes.get(slot.0 as usize).and_then(Option::as_ref)
    }

    /// Takes ownership of the pipe end wired to `slot`.
    #[must_use]
    pub fn take_pipe(&mut self, slot: SlotId) -> Option<PipeHandle> {
        self.pipes.get_mut(slot.0 as usize).and_then(Option::take)
    }
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("node", &self.node)
            .field("pipes", &self.pipes.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of one delegate invocation.
pub enum TaskOutcome {
    /// The task finished; the scheduler releases it.
    Complete,
    /// The task's slow fragment continues on the async pool.
    Offload(Box<dyn AsyncCompanion>),
}

impl fmt::Debug for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("Complete"),
            Self::Offload(_) => f.write_str("Offload(..)"),
        }
    }
}

/// Per-request execution body of a node.
pub trait TaskDelegate: Send {
    /// Runs the node's work for one request.
    ///
    /// # Errors
    ///
    /// A [`ServletError`] fails the owning request only.
    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<TaskOutcome, ServletError>;
}

/// The three-phase body of an offloaded task fragment.
///
/// `setup` runs synchronously on the posting scheduler worker with pipe
/// access; `execute` runs on a pool thread and must touch only its own
/// state; `cleanup` runs back on the dispatcher, again with pipe access.
pub trait AsyncCompanion: Send {
    /// Snapshot phase, on the posting worker.
    ///
    /// # Errors
    ///
    /// Failure here fails the owning request before the job is posted.
    fn setup(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), ServletError>;

    /// Slow fragment, on a pool thread. No pipe or scope access.
    ///
    /// # Errors
    ///
    /// The result is carried back to the dispatcher with the completion.
    fn execute(&mut self) -> Result<(), ServletError>;

    /// Post-processing phase, back on the dispatcher.
    ///
    /// # Errors
    ///
    /// Failure here fails the owning request.
    fn cleanup(self: Box<Self>, ctx: &mut TaskContext<'_>) -> Result<(), ServletError>;
}

/// A loaded servlet instance.
pub trait Servlet: Send + Sync {
    /// The slot table, fixed for the servlet's lifetime.
    fn slots(&self) -> &[SlotDef];

    /// Creates a fresh delegate for one request.
    ///
    /// # Errors
    ///
    /// Returns [`ServletError::DelegateCreation`] when the servlet cannot
    /// produce a delegate.
    fn create_delegate(&self, flags: TaskFlags)
        -> Result<Box<dyn TaskDelegate>, ServletError>;

    /// Notified once whenever a type binding is written for one of this
    /// servlet's slots. The default accepts every type.
    ///
    /// # Errors
    ///
    /// Rejecting the binding fails the `resolve_pipe_type` call.
    fn on_type_resolved(&self, slot: SlotId, type_name: &str) -> Result<(), ServletError> {
        let _ = (slot, type_name);
        Ok(())
    }
}

/// Errors raised by servlet implementations
#[derive(Debug, thiserror::Error)]
pub enum ServletError {
    /// The servlet could not create a delegate
    #[error("Delegate creation failed: {0}")]
    DelegateCreation(String),

    /// The delegate or companion failed while running
    #[error("Servlet execution failed: {0}")]
    Execution(String),

    /// The servlet rejected a resolved pipe type
    #[error("Type {type_name} rejected for {slot}: {reason}")]
    TypeRejected {
        /// The offered concrete type name
        type_name: String,
        /// The slot the binding was written for
        slot: SlotId,
        /// Servlet-provided reason
        reason: String,
    },
}
