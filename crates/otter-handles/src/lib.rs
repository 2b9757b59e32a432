//! otter-handles - Handle and lifetime management for embedded script engines.
//!
//! Script engines cannot safely hold native pointers. This crate exposes host
//! values to scripts as small integer handles, owned by scoped tables that
//! mirror the engine's execution contexts, and disposes them deterministically
//! when a context ends.
//!
//! # Features
//!
//! - **Scoped handle tables**: one table per script context, nested tables for
//!   nested scopes, cascading disposal of a whole subtree
//! - **Exact numeric ids**: ids stay below a ceiling that script numbers
//!   represent exactly; the id space is compacted instead of overflowing
//! - **Typed resources**: `Resource<T>` with an optional disposer that runs
//!   exactly once
//! - **Serializing task queue**: funnels completions from any thread onto one
//!   consumer thread for safe engine re-entry
//! - **Drain counter**: tracks outstanding background work to gate shutdown
//!
//! # Example
//!
//! ```no_run
//! use otter_handles::{HandleConfig, HandleRuntime};
//!
//! let runtime = HandleRuntime::new(HandleConfig::default()).unwrap();
//! let context = runtime.new_root_table().unwrap();
//!
//! let file = context
//!     .new_resource_with_disposer(String::from("/tmp/data"), |path| {
//!         println!("closing {path}");
//!     })
//!     .unwrap();
//!
//! // The script only ever sees (table, id) numbers.
//! let (table, id) = file.handle_ref().encode();
//! let again = runtime.decode::<String>(table, id).unwrap();
//! assert_eq!(again.value(), "/tmp/data");
//!
//! // Context teardown disposes everything it owns.
//! context.dispose();
//! assert!(file.is_disposed());
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HandleRuntime                            │
//! │  ┌──────────────────────┐ ┌──────────────┐ ┌─────────────┐  │
//! │  │ Table arena          │ │  TaskQueue   │ │ DrainCounter│  │
//! │  │ TableId -> table     │ │ (1 consumer) │ │ (one-shot)  │  │
//! │  └──────────────────────┘ └──────────────┘ └─────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                           ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HandleTable                              │
//! │  - RwLock: id cursor + entries (HandleId -> resource)       │
//! │  - Mutex: child set (TableId links)                         │
//! │  - compaction when the cursor passes the ceiling            │
//! └─────────────────────────────────────────────────────────────┘
//!                           ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Resource<T>                              │
//! │  - host value + disposer, weak link to its table            │
//! │  - idempotent dispose, drop backstop for leaks              │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod drain;
pub mod error;
pub mod id;
pub mod lock;
pub mod queue;
pub mod resource;
pub mod runtime;
pub mod scope;
pub mod stats;
pub mod table;

pub use config::HandleConfig;
pub use drain::{DrainCounter, TaskGuard, spawn_background};
pub use error::{HandleError, HandleResult, QueueError};
pub use id::{HandleId, HandleRef, MAX_SAFE_HANDLE_ID, MAX_SAFE_INTEGER, TableId};
pub use lock::ScriptLock;
pub use queue::{Task, TaskQueue};
pub use resource::{Disposer, ErasedResource, Resource};
pub use runtime::HandleRuntime;
pub use scope::ScopedTable;
pub use stats::{HandleStats, HandleStatsSnapshot, QueueStats, QueueStatsSnapshot};
pub use table::HandleTable;

pub mod prelude {
    pub use crate::config::HandleConfig;
    pub use crate::drain::{DrainCounter, TaskGuard, spawn_background};
    pub use crate::error::{HandleError, HandleResult, QueueError};
    pub use crate::id::{HandleId, HandleRef, TableId};
    pub use crate::lock::ScriptLock;
    pub use crate::queue::TaskQueue;
    pub use crate::resource::{ErasedResource, Resource};
    pub use crate::runtime::HandleRuntime;
    pub use crate::scope::ScopedTable;
    pub use crate::table::HandleTable;
}
