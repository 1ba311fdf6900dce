//! Process-scoped servlet instance table.
//!
//! Servlets are loaded once with their init arguments and referenced by
//! [`ServletId`] from then on. Each instance records at most one claiming
//! graph node; claiming an already-claimed instance fails unless reuse was
//! explicitly enabled on the builder.

use std::sync::{Arc, PoisonError, RwLock};

use crate::graph::GraphError;

use super::{NodeId, Servlet, ServletId, SlotDef, SlotKind};

struct Entry {
    servlet: Arc<dyn Servlet>,
    args: Vec<String>,
    claimed_by: Option<NodeId>,
}

/// The servlet instance table.
///
/// Interior synchronization: loads and claims take the write lock, all
/// accessors take the read lock. Constructed explicitly and injected into
/// the builder, never ambient.
#[derive(Default)]
pub struct ServletRegistry {
    inner: RwLock<Vec<Entry>>,
}

impl ServletRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one servlet instance with its init arguments.
    ///
    /// Ids are 32-bit; the table holds at most `u32::MAX` instances.
    pub fn load(&self, servlet: Arc<dyn Servlet>, args: Vec<String>) -> ServletId {
        let mut table = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = ServletId(u32::try_from(table.len()).unwrap_or(u32::MAX));
        table.push(Entry {
            servlet,
            args,
            claimed_by: None,
        });
        tracing::trace!(servlet = %id, "Loaded servlet instance");
        id
    }

    /// The registered servlet, if `id` is valid.
    #[must_use]
    pub fn servlet(&self, id: ServletId) -> Option<Arc<dyn Servlet>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.0 as usize)
            .map(|e| Arc::clone(&e.servlet))
    }

    /// Total slot count of the servlet's table.
    #[must_use]
    pub fn slot_count(&self, id: ServletId) -> Option<usize> {
        self.with_entry(id, |e| e.servlet.slots().len())
    }

    /// Snapshot of the servlet's slot table.
    #[must_use]
    pub fn slots(&self, id: ServletId) -> Option<Vec<SlotDef>> {
        self.with_entry(id, |e| e.servlet.slots().to_vec())
    }

    /// Number of input slots in the servlet's table.
    #[must_use]
    pub fn input_slot_count(&self, id: ServletId) -> Option<usize> {
        self.with_entry(id, |e| {
            e.servlet
                .slots()
                .iter()
                .filter(|s| s.kind == SlotKind::Input)
                .count()
        })
    }

    /// The init arguments the servlet was loaded with.
    #[must_use]
    pub fn init_args(&self, id: ServletId) -> Option<Vec<String>> {
        self.with_entry(id, |e| e.args.clone())
    }

    /// The node currently claiming this instance, if any.
    #[must_use]
    pub fn claimed_by(&self, id: ServletId) -> Option<NodeId> {
        self.with_entry(id, |e| e.claimed_by).flatten()
    }

    /// Records `node` as the claiming owner of the instance.
    ///
    /// # Errors
    ///
    /// [`GraphError::UnknownServlet`] for an invalid id;
    /// [`GraphError::ServletInUse`] when already claimed and `allow_reuse`
    /// is false.
    pub fn claim(
        &self,
        id: ServletId,
        node: NodeId,
        allow_reuse: bool,
    ) -> Result<(), GraphError> {
        let mut table = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = table
            .get_mut(id.0 as usize)
            .ok_or(GraphError::UnknownServlet(id))?;
        if let Some(owner) = entry.claimed_by {
            if !allow_reuse {
                return Err(GraphError::ServletInUse { servlet: id, node: owner });
            }
        }
        entry.claimed_by = Some(node);
        Ok(())
    }

    /// Clears the claim on the instance, if `id` is valid.
    pub fn clear_claim(&self, id: ServletId) {
        if let Some(entry) = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(id.0 as usize)
        {
            entry.claimed_by = None;
        }
    }

    fn with_entry<T>(&self, id: ServletId, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.0 as usize)
            .map(f)
    }
}
