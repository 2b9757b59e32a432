//! RAII binding of a handle table to a script scope.

use crate::table::HandleTable;
use std::ops::Deref;

/// Disposes its table (and subtree) when dropped.
///
/// Meant to live exactly as long as the script execution scope it mirrors,
/// so context teardown cannot skip disposal on early returns or panics.
#[derive(Debug)]
pub struct ScopedTable {
    table: HandleTable,
    armed: bool,
}

impl ScopedTable {
    pub(crate) fn new(table: HandleTable) -> Self {
        Self { table, armed: true }
    }

    /// Open a nested scope
    pub fn child(&self) -> crate::HandleResult<ScopedTable> {
        Ok(self.table.new_child()?.scoped())
    }

    /// Give up ownership without disposing.
    pub fn release(mut self) -> HandleTable {
        self.armed = false;
        self.table.clone()
    }
}

impl Deref for ScopedTable {
    type Target = HandleTable;

    fn deref(&self) -> &HandleTable {
        &self.table
    }
}

impl Drop for ScopedTable {
    fn drop(&mut self) {
        if self.armed {
            self.table.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{HandleConfig, HandleRuntime};

    #[test]
    fn test_drop_disposes_subtree() {
        let runtime = HandleRuntime::new(HandleConfig::default()).unwrap();
        let outer = runtime.new_root_table().unwrap().scoped();
        let inner = outer.child().unwrap();
        let inner_id = inner.id();
        let res = inner.new_resource(3u16).unwrap();

        drop(outer);

        assert!(res.is_disposed());
        assert!(inner.is_disposed());
        assert!(runtime.table(inner_id).is_err());
    }

    #[test]
    fn test_release_keeps_table() {
        let runtime = HandleRuntime::new(HandleConfig::default()).unwrap();
        let scoped = runtime.new_root_table().unwrap().scoped();
        let table = scoped.release();

        assert!(!table.is_disposed());
        assert!(table.dispose());
    }
}
