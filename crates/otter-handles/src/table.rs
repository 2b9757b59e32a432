//! Handle tables.
//!
//! One table exists per script execution scope. It maps small integer ids to
//! resources, and it links to its parent and children by [`TableId`] through
//! the runtime's table arena.
//!
//! ## Locking
//!
//! - `state` (`RwLock`): entry map, id cursor and disposed flag. Lookups take
//!   it shared; allocation, disposal and compaction take it exclusive.
//! - `children` (`Mutex`): the child set. Separate from `state` so creating
//!   or removing child scopes never contends with resource traffic.
//! - `compaction` (`Mutex`): serializes compaction passes of this table.
//!
//! Disposers always run after the locks are released, so a disposer may call
//! back into the table.
//!
//! ## Id allocation
//!
//! Ids come from a monotonic cursor. When the cursor passes the configured
//! ceiling, the table compacts: it waits for the configured pause (outside
//! the entry lock, so pending disposals can land), then under the exclusive
//! lock moves the cursor to `max(live ids) + 1`. If the highest live id sits
//! at the ceiling, the cursor restarts at the lowest free id and allocation
//! skips live ids from there. A live id is never handed out twice.

use crate::config::HandleConfig;
use crate::error::{HandleError, HandleResult};
use crate::id::{HandleId, TableId};
use crate::lock::ScriptLock;
use crate::resource::{Disposer, ErasedResource, Resource, ResourceCell, ResourceEntry};
use crate::runtime::RuntimeShared;
use crate::scope::ScopedTable;
use crate::stats::HandleStats;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace};

pub(crate) struct TableState {
    next_id: u32,
    entries: FxHashMap<HandleId, Arc<dyn ResourceEntry>>,
    disposed: bool,
}

impl TableState {
    fn new() -> Self {
        Self {
            next_id: 0,
            entries: FxHashMap::default(),
            disposed: false,
        }
    }

    /// Take the next free id at or above the cursor, if one fits under the ceiling.
    fn reserve(&mut self, ceiling: u32) -> Option<HandleId> {
        while self.next_id <= ceiling {
            let id = HandleId::new(self.next_id);
            self.next_id += 1;
            if !self.entries.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    /// New cursor after a compaction pass.
    fn compacted_cursor(&self, ceiling: u32) -> u32 {
        match self.entries.keys().map(|id| id.get()).max() {
            None => 0,
            Some(max) if max < ceiling => max + 1,
            Some(_) => (0..=ceiling)
                .find(|raw| !self.entries.contains_key(&HandleId::new(*raw)))
                .unwrap_or(ceiling.saturating_add(1)),
        }
    }
}

pub(crate) struct TableInner {
    id: TableId,
    parent: Option<TableId>,
    root: TableId,
    state: RwLock<TableState>,
    children: Mutex<FxHashSet<TableId>>,
    compaction: Mutex<()>,
    runtime: Weak<RuntimeShared>,
    ceiling: u32,
    compaction_pause: Duration,
    leak_detection: bool,
    stats: Arc<HandleStats>,
}

impl TableInner {
    pub(crate) fn new(
        id: TableId,
        parent: Option<(TableId, TableId)>,
        runtime: Weak<RuntimeShared>,
        config: &HandleConfig,
        stats: Arc<HandleStats>,
    ) -> Self {
        let (parent, root) = match parent {
            Some((parent, root)) => (Some(parent), root),
            None => (None, id),
        };
        Self {
            id,
            parent,
            root,
            state: RwLock::new(TableState::new()),
            children: Mutex::new(FxHashSet::default()),
            compaction: Mutex::new(()),
            runtime,
            ceiling: config.max_handle_id,
            compaction_pause: config.compaction_pause(),
            leak_detection: config.leak_detection,
            stats,
        }
    }

    pub(crate) fn id(&self) -> TableId {
        self.id
    }

    pub(crate) fn parent(&self) -> Option<TableId> {
        self.parent
    }

    pub(crate) fn root(&self) -> TableId {
        self.root
    }

    /// Whether this table was created by `runtime`.
    pub(crate) fn belongs_to(&self, runtime: &Arc<RuntimeShared>) -> bool {
        std::ptr::eq(self.runtime.as_ptr(), Arc::as_ptr(runtime))
    }

    pub(crate) fn stats(&self) -> &Arc<HandleStats> {
        &self.stats
    }

    pub(crate) fn leak_detection(&self) -> bool {
        self.leak_detection
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.read().disposed
    }

    /// Remove `id` if it still maps to the entry at `entry_ptr`.
    pub(crate) fn remove_entry(&self, id: HandleId, entry_ptr: *const ()) {
        let mut state = self.state.write();
        let matches = state
            .entries
            .get(&id)
            .is_some_and(|entry| Arc::as_ptr(entry) as *const () == entry_ptr);
        if matches {
            state.entries.remove(&id);
        }
    }

    /// Link a new child. Fails if this table is already disposed.
    pub(crate) fn link_child(&self, child: TableId) -> HandleResult<()> {
        assert_ne!(child, self.id, "handle table {} linked as its own child", self.id);

        let mut children = self.children.lock();
        // Disposal flips `disposed` before taking the child set, so checking
        // under the child lock means a linked child is always seen by the cascade.
        if self.is_disposed() {
            return Err(HandleError::TableDisposed(self.id));
        }
        children.insert(child);
        Ok(())
    }

    pub(crate) fn unlink_child(&self, child: TableId) -> bool {
        self.children.lock().remove(&child)
    }

    pub(crate) fn has_child(&self, child: TableId) -> bool {
        self.children.lock().contains(&child)
    }

    pub(crate) fn children(&self) -> Vec<TableId> {
        self.children.lock().iter().copied().collect()
    }

    /// Mark disposed and take the entries. `None` if already disposed.
    pub(crate) fn claim_disposal(&self) -> Option<Vec<Arc<dyn ResourceEntry>>> {
        let mut state = self.state.write();
        if state.disposed {
            return None;
        }
        state.disposed = true;
        Some(std::mem::take(&mut state.entries).into_values().collect())
    }

    pub(crate) fn take_children(&self) -> Vec<TableId> {
        std::mem::take(&mut *self.children.lock())
            .into_iter()
            .collect()
    }

    fn insert_with<T, F>(&self, build: F) -> HandleResult<Arc<ResourceCell<T>>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(HandleId) -> ResourceCell<T>,
    {
        let mut state = self.state.write();
        if state.disposed {
            return Err(HandleError::TableDisposed(self.id));
        }

        let id = match state.reserve(self.ceiling) {
            Some(id) => id,
            None => {
                drop(state);
                state = self.compact()?;
                self.reserve_compacted(&mut state)?
            }
        };

        let cell = Arc::new(build(id));
        state.entries.insert(id, cell.clone());
        drop(state);

        HandleStats::bump(&self.stats.resources_created);
        trace!(table = %self.id, id = %id, "Resource created");
        Ok(cell)
    }

    /// Recompute the cursor from the live set.
    ///
    /// Returns the exclusive guard so the caller allocates before anyone
    /// else can move the cursor again.
    fn compact(&self) -> HandleResult<RwLockWriteGuard<'_, TableState>> {
        let _compacting = self.compaction.lock();

        // Another caller may have compacted while we waited.
        {
            let state = self.state.write();
            if state.disposed {
                return Err(HandleError::TableDisposed(self.id));
            }
            if state.next_id <= self.ceiling {
                return Ok(state);
            }
        }

        if !self.compaction_pause.is_zero() {
            std::thread::sleep(self.compaction_pause);
        }

        let mut state = self.state.write();
        if state.disposed {
            return Err(HandleError::TableDisposed(self.id));
        }
        self.recompute_cursor(&mut state);
        Ok(state)
    }

    /// Allocate after [`Self::compact`].
    ///
    /// A pass run by another caller may have left the cursor in front of ids
    /// that are all live while ids below it were freed since. Recompute
    /// under the held guard before giving up; only a full table is exhausted.
    fn reserve_compacted(&self, state: &mut TableState) -> HandleResult<HandleId> {
        if let Some(id) = state.reserve(self.ceiling) {
            return Ok(id);
        }
        self.recompute_cursor(state);
        state.reserve(self.ceiling).ok_or(HandleError::IdSpaceExhausted {
            table: self.id,
            ceiling: self.ceiling,
        })
    }

    fn recompute_cursor(&self, state: &mut TableState) {
        let previous = state.next_id;
        state.next_id = state.compacted_cursor(self.ceiling);
        HandleStats::bump(&self.stats.compactions);
        info!(
            table = %self.id,
            previous,
            next = state.next_id,
            live = state.entries.len(),
            "Compacted handle ids"
        );
    }
}

/// A scoped map from integer ids to host resources.
///
/// `HandleTable` is a cheap, clonable reference; the table itself lives in
/// the runtime's arena until it is disposed.
#[derive(Clone)]
pub struct HandleTable {
    inner: Arc<TableInner>,
}

impl HandleTable {
    pub(crate) fn from_inner(inner: Arc<TableInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<TableInner> {
        &self.inner
    }

    pub fn id(&self) -> TableId {
        self.inner.id
    }

    /// Parent table, `None` for a root
    pub fn parent(&self) -> Option<TableId> {
        self.inner.parent
    }

    /// Root of this table's tree (the top-level script context)
    pub fn root(&self) -> TableId {
        self.inner.root()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Number of live resources
    pub fn len(&self) -> usize {
        self.inner.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live ids, sorted ascending
    pub fn live_ids(&self) -> Vec<HandleId> {
        let mut ids: Vec<HandleId> = self.inner.state.read().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Current allocation cursor
    pub fn next_id(&self) -> u32 {
        self.inner.state.read().next_id
    }

    /// Live child tables
    pub fn children(&self) -> Vec<TableId> {
        self.inner.children()
    }

    pub fn has_child(&self, child: TableId) -> bool {
        self.inner.has_child(child)
    }

    /// Expose `value` to scripts.
    pub fn new_resource<T>(&self, value: T) -> HandleResult<Resource<T>>
    where
        T: Send + Sync + 'static,
    {
        self.insert(value, None)
    }

    /// Expose `value` to scripts; `disposer` runs exactly once on disposal.
    pub fn new_resource_with_disposer<T, F>(
        &self,
        value: T,
        disposer: F,
    ) -> HandleResult<Resource<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) + Send + 'static,
    {
        self.insert(value, Some(Box::new(disposer)))
    }

    fn insert<T>(&self, value: T, disposer: Option<Disposer<T>>) -> HandleResult<Resource<T>>
    where
        T: Send + Sync + 'static,
    {
        let cell = self
            .inner
            .insert_with(|id| ResourceCell::new(id, &self.inner, value, disposer))?;
        Ok(Resource::from_cell(cell))
    }

    /// Look up a live resource of type `T`.
    ///
    /// Stale or forged ids give [`HandleError::NotFound`]; a live id holding
    /// another type gives [`HandleError::TypeMismatch`].
    pub fn get<T>(&self, id: HandleId) -> HandleResult<Resource<T>>
    where
        T: Send + Sync + 'static,
    {
        self.get_any(id)?
            .downcast::<T>()
            .ok_or(HandleError::TypeMismatch {
                table: self.inner.id,
                id,
                expected: std::any::type_name::<T>(),
            })
    }

    /// Look up a live resource without fixing its type.
    pub fn get_any(&self, id: HandleId) -> HandleResult<ErasedResource> {
        let entry = self.inner.state.read().entries.get(&id).cloned();
        entry.map(ErasedResource::new).ok_or(HandleError::NotFound {
            table: self.inner.id,
            id,
        })
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.inner.state.read().entries.contains_key(&id)
    }

    /// Dispose a resource. Same as [`Resource::dispose`].
    pub fn dispose_resource<T>(&self, resource: &Resource<T>) -> bool
    where
        T: Send + Sync + 'static,
    {
        debug_assert_eq!(resource.table(), self.inner.id);
        resource.dispose()
    }

    /// Dispose the resource at `id`, for script-side dispose calls.
    ///
    /// Returns `false` if nothing live was there.
    pub fn dispose_id(&self, id: HandleId) -> bool {
        let entry = self.inner.state.read().entries.get(&id).cloned();
        entry.is_some_and(|entry| entry.dispose())
    }

    /// Create a nested table for a child scope.
    pub fn new_child(&self) -> HandleResult<HandleTable> {
        let runtime = self.inner.runtime.upgrade().ok_or(HandleError::RuntimeGone)?;
        runtime.create_table(Some(self))
    }

    /// Dispose this table, its whole subtree and every resource they own.
    ///
    /// Returns `false` if the table was already disposed.
    pub fn dispose(&self) -> bool {
        match self.inner.runtime.upgrade() {
            Some(runtime) => runtime.dispose_tree(&self.inner),
            None => self.dispose_detached(),
        }
    }

    /// Disposal without a runtime: children are unreachable, own entries only.
    fn dispose_detached(&self) -> bool {
        let Some(entries) = self.inner.claim_disposal() else {
            return false;
        };
        self.inner.take_children();
        for entry in entries {
            entry.dispose_detached();
        }
        HandleStats::bump(&self.inner.stats.tables_disposed);
        debug!(table = %self.inner.id, "Handle table disposed without runtime");
        true
    }

    /// Create a locked [`ScriptLock`] and expose it as a resource.
    ///
    /// Host code waits on the returned lock; script code releases it through
    /// the handle. Disposing the resource releases it too.
    pub fn new_lock(&self) -> HandleResult<(ScriptLock, Resource<ScriptLock>)> {
        let lock = ScriptLock::new();
        let resource = self.new_resource_with_disposer(lock.clone(), |lock: &ScriptLock| {
            lock.release();
        })?;
        Ok((lock, resource))
    }

    /// Bind this table to a scope: it is disposed when the guard drops.
    pub fn scoped(self) -> ScopedTable {
        ScopedTable::new(self)
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("HandleTable")
            .field("id", &self.inner.id)
            .field("parent", &self.inner.parent)
            .field("live", &state.entries.len())
            .field("next_id", &state.next_id)
            .field("disposed", &state.disposed)
            .finish()
    }
}
