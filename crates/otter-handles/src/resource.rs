//! Typed resource handles.
//!
//! A [`Resource<T>`] wraps one host value exposed to script code. The owning
//! [`crate::HandleTable`] keeps an erased entry for it; the typed handle is
//! recovered with [`crate::HandleTable::get`].
//!
//! Disposal is explicit. If a resource is dropped without ever being
//! disposed (its table was never torn down), the disposer still runs from
//! `Drop` as a last-resort backstop and the event is counted in
//! [`crate::HandleStats::backstop_disposals`].

use crate::id::{HandleId, HandleRef, TableId};
use crate::stats::HandleStats;
use crate::table::TableInner;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

/// Callback run exactly once when a resource is disposed.
pub type Disposer<T> = Box<dyn FnOnce(&T) + Send + 'static>;

pub(crate) struct ResourceCell<T> {
    id: HandleId,
    table: TableId,
    /// Non-owning link back to the table holding the entry
    owner: Weak<TableInner>,
    value: T,
    disposer: Mutex<Option<Disposer<T>>>,
    disposed: AtomicBool,
    stats: Arc<HandleStats>,
    leak_detection: bool,
}

impl<T: Send + Sync + 'static> ResourceCell<T> {
    pub(crate) fn new(
        id: HandleId,
        owner: &Arc<TableInner>,
        value: T,
        disposer: Option<Disposer<T>>,
    ) -> Self {
        Self {
            id,
            table: owner.id(),
            owner: Arc::downgrade(owner),
            value,
            disposer: Mutex::new(disposer),
            disposed: AtomicBool::new(false),
            stats: owner.stats().clone(),
            leak_detection: owner.leak_detection(),
        }
    }
}

impl<T> ResourceCell<T> {
    /// Claim disposal. Only the first caller gets `true`.
    fn claim(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    fn run_disposer(&self) {
        let disposer = self.disposer.lock().take();
        if let Some(disposer) = disposer {
            disposer(&self.value);
        }
        HandleStats::bump(&self.stats.resources_disposed);
        trace!(table = %self.table, id = %self.id, "Resource disposed");
    }
}

impl<T> Drop for ResourceCell<T> {
    fn drop(&mut self) {
        if *self.disposed.get_mut() {
            return;
        }
        let Some(disposer) = self.disposer.get_mut().take() else {
            return;
        };

        HandleStats::bump(&self.stats.backstop_disposals);
        if self.leak_detection {
            warn!(
                table = %self.table,
                id = %self.id,
                "Resource dropped without being disposed"
            );
        }
        disposer(&self.value);
    }
}

/// Type-erased view of a table entry.
pub(crate) trait ResourceEntry: Send + Sync {
    fn handle_ref(&self) -> HandleRef;

    fn type_name(&self) -> &'static str;

    fn is_disposed(&self) -> bool;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Run the disposer once, without touching the owner's entry map.
    /// Used when the table already removed the entry itself.
    fn dispose_detached(&self) -> bool;

    /// Remove from the owner and run the disposer once.
    fn dispose(&self) -> bool;
}

impl<T: Send + Sync + 'static> ResourceEntry for ResourceCell<T> {
    fn handle_ref(&self) -> HandleRef {
        HandleRef::new(self.table, self.id)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn dispose_detached(&self) -> bool {
        if !self.claim() {
            return false;
        }
        self.run_disposer();
        true
    }

    fn dispose(&self) -> bool {
        if !self.claim() {
            return false;
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.remove_entry(self.id, self as *const Self as *const ());
        }
        self.run_disposer();
        true
    }
}

/// Handle to a host value owned by a handle table.
///
/// Cloning is cheap and every clone refers to the same entry. Disposing
/// any clone disposes the resource; further calls are no-ops.
pub struct Resource<T: Send + Sync + 'static> {
    cell: Arc<ResourceCell<T>>,
}

impl<T: Send + Sync + 'static> Resource<T> {
    pub(crate) fn from_cell(cell: Arc<ResourceCell<T>>) -> Self {
        Self { cell }
    }

    /// Id inside the owning table
    pub fn id(&self) -> HandleId {
        self.cell.id
    }

    /// Owning table
    pub fn table(&self) -> TableId {
        self.cell.table
    }

    /// Fully qualified reference for the script side
    pub fn handle_ref(&self) -> HandleRef {
        HandleRef::new(self.cell.table, self.cell.id)
    }

    pub fn value(&self) -> &T {
        &self.cell.value
    }

    pub fn is_disposed(&self) -> bool {
        self.cell.is_disposed()
    }

    /// Remove the entry from its table and run the disposer.
    ///
    /// Returns `true` only for the call that actually disposed. The disposer
    /// has finished by the time this returns.
    pub fn dispose(&self) -> bool {
        self.cell.dispose()
    }

    /// Erase the value type
    pub fn erase(&self) -> ErasedResource {
        ErasedResource {
            entry: self.cell.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Deref for Resource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.cell.value
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("table", &self.cell.table)
            .field("id", &self.cell.id)
            .field("type", &std::any::type_name::<T>())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Resource handle with its value type erased.
///
/// Returned by [`crate::HandleTable::get_any`] for callers that only need
/// to dispose or inspect a handle.
#[derive(Clone)]
pub struct ErasedResource {
    entry: Arc<dyn ResourceEntry>,
}

impl ErasedResource {
    pub(crate) fn new(entry: Arc<dyn ResourceEntry>) -> Self {
        Self { entry }
    }

    pub fn id(&self) -> HandleId {
        self.entry.handle_ref().id
    }

    pub fn handle_ref(&self) -> HandleRef {
        self.entry.handle_ref()
    }

    /// Rust type name of the wrapped value
    pub fn type_name(&self) -> &'static str {
        self.entry.type_name()
    }

    pub fn is_disposed(&self) -> bool {
        self.entry.is_disposed()
    }

    pub fn dispose(&self) -> bool {
        self.entry.dispose()
    }

    /// Recover the typed handle, or `None` if `T` is not the wrapped type.
    pub fn downcast<T: Send + Sync + 'static>(self) -> Option<Resource<T>> {
        self.entry
            .into_any()
            .downcast::<ResourceCell<T>>()
            .ok()
            .map(Resource::from_cell)
    }
}

impl fmt::Debug for ErasedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedResource")
            .field("handle", &self.entry.handle_ref())
            .field("type", &self.entry.type_name())
            .field("disposed", &self.entry.is_disposed())
            .finish()
    }
}
