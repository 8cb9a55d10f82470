//! Shared test utilities for vitals integration tests.
//!
//! This crate provides:
//! - [`TracingEventStore`]: in-memory event store with operation recording
//!   and failure injection
//! - [`StatsHarness`]: every stats component wired to in-memory collaborators
//! - [`ProjectFactory`] for test projects
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use vitals_test_utils::{StatsHarness, assert_clean_run};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let h = StatsHarness::new();
//!     let project = h.register("widget").await;
//!     let summary = h.job.run(&h.ctx()).await.unwrap();
//!     assert_clean_run(&summary);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod storage;

pub use assertions::*;
pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("vitals=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
