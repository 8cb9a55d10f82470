//! # vitals-core
//!
//! Core abstractions shared by the vitals project-health services.
//!
//! - **Identifiers**: content-derived project ids and fixed-width hashes
//! - **Clock**: microsecond logical clock with a test double
//! - **Context**: explicit request-scoped handle for every collaborator call
//! - **Collaborators**: event store, look-aside cache and deferred task queue
//!   traits, each with an in-memory implementation
//! - **Error Types**: shared error definitions and result types
//! - **Observability**: logging initialisation and span helpers
//!
//! ## Example
//!
//! ```rust
//! use vitals_core::prelude::*;
//!
//! let id = ProjectId::derive("dev@example.com", "widget");
//! let key = RecordKey::new(Kind::Project, id.as_str());
//! assert_eq!(key.kind(), Kind::Project);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod clock;
pub mod context;
pub mod error;
pub mod id;
pub mod observability;
pub mod queue;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cache::{Cache, MemoryCache};
    pub use crate::clock::{Clock, ManualClock, SystemClock, Timestamp};
    pub use crate::context::Context;
    pub use crate::error::{Error, Result};
    pub use crate::id::ProjectId;
    pub use crate::queue::{EnqueueResult, InMemoryTaskQueue, TaskQueue};
    pub use crate::store::{
        EventStore, Filter, Kind, MemoryEventStore, Order, Query, RecordKey, RecordStream,
        StoredRecord,
    };
}

// Re-export key types at crate root for ergonomics
pub use cache::{Cache, MemoryCache};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use context::Context;
pub use error::{Error, Result};
pub use id::ProjectId;
pub use observability::{LogFormat, init_logging};
pub use queue::{EnqueueResult, InMemoryTaskQueue, QueuedTask, TaskQueue};
pub use store::{
    EventStore, Filter, Kind, MemoryEventStore, Order, Query, RecordKey, RecordStream,
    StoredRecord,
};
