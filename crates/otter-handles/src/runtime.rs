//! The handle runtime: table arena, task queue and drain counter.
//!
//! Every piece of shared state lives in a [`HandleRuntime`] rather than in
//! process globals, so several independent runtimes can coexist and tests
//! tear down deterministically.
//!
//! Tables are stored in an arena keyed by [`TableId`]. Parent and child
//! links are ids into that arena, and a table holds only a weak reference to
//! the runtime. Dropping the runtime therefore drops every table still in
//! the arena.

use crate::config::HandleConfig;
use crate::drain::DrainCounter;
use crate::error::{HandleError, HandleResult};
use crate::id::{HandleRef, TableId};
use crate::queue::TaskQueue;
use crate::resource::{ErasedResource, Resource};
use crate::stats::HandleStats;
use crate::table::{HandleTable, TableInner};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub(crate) struct RuntimeShared {
    config: HandleConfig,
    tables: DashMap<TableId, Arc<TableInner>>,
    next_table_id: AtomicU64,
    stats: Arc<HandleStats>,
    drain: Arc<DrainCounter>,
    queue: TaskQueue,
}

impl RuntimeShared {
    fn lookup(&self, id: TableId) -> Option<Arc<TableInner>> {
        // Clone out so no shard guard is held past this call.
        self.tables.get(&id).map(|entry| entry.value().clone())
    }

    /// Whether `id` was handed out by this runtime at some point.
    fn issued(&self, id: TableId) -> bool {
        id.get() >= 1 && id.get() < self.next_table_id.load(Ordering::Relaxed)
    }

    pub(crate) fn create_table(
        self: &Arc<Self>,
        parent: Option<&HandleTable>,
    ) -> HandleResult<HandleTable> {
        if let Some(parent) = parent {
            // Table ids are only meaningful inside the runtime that issued them.
            if !parent.inner().belongs_to(self) {
                return Err(HandleError::ForeignTable(parent.id()));
            }
            if parent.is_disposed() {
                return Err(HandleError::TableDisposed(parent.id()));
            }
        }

        let id = TableId::new(self.next_table_id.fetch_add(1, Ordering::Relaxed));
        let link = parent.map(|p| (p.id(), p.root()));
        let inner = Arc::new(TableInner::new(
            id,
            link,
            Arc::downgrade(self),
            &self.config,
            self.stats.clone(),
        ));

        // Register before linking: a cascade that sees the link must also
        // find the table in the arena.
        self.tables.insert(id, inner.clone());
        if let Some(parent) = parent {
            debug_assert!(
                !self.is_ancestor(id, parent.id()),
                "table {id} would become its own ancestor"
            );
            if let Err(e) = parent.inner().link_child(id) {
                self.tables.remove(&id);
                return Err(e);
            }
        }

        HandleStats::bump(&self.stats.tables_created);
        debug!(table = %id, parent = ?link.map(|(p, _)| p), "Handle table created");
        Ok(HandleTable::from_inner(inner))
    }

    /// Whether `candidate` appears in the parent chain of `table` (inclusive).
    fn is_ancestor(&self, candidate: TableId, table: TableId) -> bool {
        let mut current = Some(table);
        let mut steps = 0usize;
        while let Some(id) = current {
            if id == candidate {
                return true;
            }
            steps += 1;
            assert!(
                steps <= self.tables.len() + 1,
                "cycle in handle table tree at table {id}"
            );
            current = self.lookup(id).and_then(|t| t.parent());
        }
        false
    }

    /// Dispose `root` and its subtree: detach it from its parent, then
    /// dispose descendants before ancestors.
    pub(crate) fn dispose_tree(&self, root: &Arc<TableInner>) -> bool {
        let Some(entries) = root.claim_disposal() else {
            return false;
        };
        self.tables.remove(&root.id());
        if let Some(parent) = root.parent().and_then(|p| self.lookup(p)) {
            parent.unlink_child(root.id());
        }

        // Pre-order walk; reversed it yields every table after its descendants.
        let mut order = vec![(root.clone(), entries)];
        let mut pending = root.take_children();
        while let Some(child_id) = pending.pop() {
            let Some(child) = self.lookup(child_id) else {
                continue;
            };
            let Some(entries) = child.claim_disposal() else {
                continue;
            };
            self.tables.remove(&child_id);
            pending.extend(child.take_children());
            order.push((child, entries));
        }

        for (table, entries) in order.into_iter().rev() {
            let count = entries.len();
            for entry in entries {
                entry.dispose_detached();
            }
            HandleStats::bump(&self.stats.tables_disposed);
            debug!(table = %table.id(), resources = count, "Handle table disposed");
        }
        true
    }
}

/// Explicit context object owning all handle state of one embedding.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct HandleRuntime {
    shared: Arc<RuntimeShared>,
}

impl HandleRuntime {
    /// Create a runtime and start its task queue.
    pub fn new(config: HandleConfig) -> HandleResult<Self> {
        config.validate()?;
        let queue = TaskQueue::new(
            config.queue_name.clone(),
            config.queue_capacity,
            config.push_timeout(),
        )?;

        debug!(
            max_handle_id = config.max_handle_id,
            queue_capacity = config.queue_capacity,
            "Handle runtime created"
        );

        Ok(Self {
            shared: Arc::new(RuntimeShared {
                config,
                tables: DashMap::new(),
                next_table_id: AtomicU64::new(1),
                stats: Arc::new(HandleStats::new()),
                drain: Arc::new(DrainCounter::new()),
                queue,
            }),
        })
    }

    pub fn config(&self) -> &HandleConfig {
        &self.shared.config
    }

    /// Table for a new top-level script context.
    pub fn new_root_table(&self) -> HandleResult<HandleTable> {
        self.shared.create_table(None)
    }

    /// Table for a nested scope under `parent`.
    pub fn new_child_table(&self, parent: &HandleTable) -> HandleResult<HandleTable> {
        self.shared.create_table(Some(parent))
    }

    /// Look up a live table.
    pub fn table(&self, id: TableId) -> HandleResult<HandleTable> {
        self.shared
            .lookup(id)
            .map(HandleTable::from_inner)
            .ok_or(HandleError::UnknownTable(id))
    }

    /// Dispose a table by id, for engine context-shutdown hooks and
    /// script-side dispose calls.
    ///
    /// Returns `Ok(false)` for a table this runtime issued that is already
    /// gone, so repeated disposal is a no-op. Ids never issued here are
    /// [`HandleError::UnknownTable`].
    pub fn dispose_table(&self, id: TableId) -> HandleResult<bool> {
        match self.shared.lookup(id) {
            Some(table) => Ok(self.shared.dispose_tree(&table)),
            None if self.shared.issued(id) => Ok(false),
            None => Err(HandleError::UnknownTable(id)),
        }
    }

    /// Resolve a script-side reference to a typed resource.
    pub fn resolve<T>(&self, handle: HandleRef) -> HandleResult<Resource<T>>
    where
        T: Send + Sync + 'static,
    {
        self.table(handle.table)?.get::<T>(handle.id)
    }

    pub fn resolve_any(&self, handle: HandleRef) -> HandleResult<ErasedResource> {
        self.table(handle.table)?.get_any(handle.id)
    }

    /// Decode `(table, id)` script numbers and resolve them.
    pub fn decode<T>(&self, table: f64, id: f64) -> HandleResult<Resource<T>>
    where
        T: Send + Sync + 'static,
    {
        let handle = HandleRef::decode(table, id, self.shared.config.max_handle_id)?;
        self.resolve(handle)
    }

    /// Ids of all live top-level tables, sorted
    pub fn root_tables(&self) -> Vec<TableId> {
        let mut roots: Vec<TableId> = self
            .shared
            .tables
            .iter()
            .filter(|entry| entry.value().parent().is_none())
            .map(|entry| *entry.key())
            .collect();
        roots.sort_unstable();
        roots
    }

    /// Number of live tables
    pub fn table_count(&self) -> usize {
        self.shared.tables.len()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.shared.queue
    }

    pub fn drain(&self) -> &Arc<DrainCounter> {
        &self.shared.drain
    }

    pub fn stats(&self) -> &HandleStats {
        &self.shared.stats
    }

    /// Orderly shutdown: wait for background tasks, let queued tasks run,
    /// then dispose every table and the queue.
    pub fn shutdown(&self) {
        debug!("Handle runtime shutting down");
        self.shared.drain.wait_for_drain();
        self.shared.queue.flush();
        self.dispose_all();
        self.shared.queue.dispose();
    }

    /// Abrupt shutdown: release drain waiters and dispose everything now.
    pub fn force_shutdown(&self) {
        debug!("Handle runtime forced shutdown");
        self.shared.drain.force_drain();
        self.shared.queue.dispose();
        self.dispose_all();
    }

    fn dispose_all(&self) {
        for id in self.root_tables() {
            if let Some(table) = self.shared.lookup(id) {
                self.shared.dispose_tree(&table);
            }
        }
    }
}

impl std::fmt::Debug for HandleRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRuntime")
            .field("tables", &self.shared.tables.len())
            .field("queue", &self.shared.queue)
            .field("outstanding_tasks", &self.shared.drain.count())
            .finish()
    }
}
