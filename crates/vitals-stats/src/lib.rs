//! # vitals-stats
//!
//! Project health statistics derived from a stream of countable events
//! (commits, builds, architecture pings, ratings, failure reports).
//!
//! ## Components
//!
//! - [`populate::StatsPopulator`]: lazily computes a project's derived
//!   statistics, serving them from the cache when fresh
//! - [`score`]: the bounded quality score
//! - [`reconcile::ReconcileJob`]: periodic whole-corpus recount and prune,
//!   the only writer of counted flags and all-time totals
//! - [`ingest::Ingestor`]: webhook entry point that records events and
//!   schedules refreshes
//! - [`refresh::RefreshHandler`]: runs the deferred refresh tasks
//! - [`leaderboard`]: projects ranked by score
//! - [`scheduler`]: runs reconciliation on an interval
//!
//! ## Control flow
//!
//! ```text
//! webhook ─▶ Ingestor ─▶ event store
//!                │
//!                ├─▶ cache entry marked dirty
//!                └─▶ refresh task ─▶ RefreshHandler ─▶ StatsPopulator ─▶ cache
//!
//! scheduler ─▶ ReconcileJob ─▶ load ─▶ join ─▶ diff ─▶ writer pool ─▶ event store
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod leaderboard;
pub mod metrics;
pub mod populate;
pub mod project;
pub mod reconcile;
pub mod refresh;
pub mod scheduler;
pub mod score;

pub use config::StatsConfig;
pub use error::{IngestError, Result, StatsError};
pub use events::Countable;
pub use ingest::{EventCategory, IngestReceipt, Ingestor};
pub use populate::{LiveProject, StatsPopulator};
pub use project::{DerivedStats, Project, ProjectCounters};
pub use reconcile::{ReconcileJob, ReconcilePlan, ReconcileSummary, WorkItem};
pub use refresh::{RefreshHandler, RefreshSummary};
