//! The project aggregate.
//!
//! A [`Project`] carries two sets of numbers:
//!
//! - [`ProjectCounters`]: the persisted, reconciled counters. Only the
//!   reconciliation job writes them.
//! - [`DerivedStats`]: the nine read-side statistics computed by the
//!   populator. They live in memory and in the cache, never in the store, and
//!   are only readable once the project is populated.

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use vitals_core::{
    Context, EventStore, Filter, Kind, Order, ProjectId, Query, RecordKey, Timestamp,
};

use crate::error::{Result, StatsError};

/// Counters owned by the reconciliation job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectCounters {
    /// All-time successful builds.
    pub compile_total: u64,
    /// Builds in the weekly window.
    pub compile_week: u64,
    /// Builds newer than the latest commit.
    pub compile_at_head: u64,
    /// All-time commits.
    pub checkin_total: u64,
    /// Commits in the weekly window.
    pub checkin_week: u64,
    /// Time of the newest build.
    pub last_compile: Timestamp,
    /// Time of the newest commit.
    pub last_checkin: Timestamp,
}

/// Read-side statistics produced by the populator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedStats {
    /// Rating votes.
    pub rating: u64,
    /// "Won't build" reports.
    pub failures: u64,
    /// All-time builds.
    pub compile_total: u64,
    /// Builds in the weekly window.
    pub compile_week: u64,
    /// Builds newer than the latest commit.
    pub compile_at_head: u64,
    /// All-time commits.
    pub checkin_total: u64,
    /// Commits in the weekly window.
    pub checkin_week: u64,
    /// Time of the newest build.
    pub last_compile: Timestamp,
    /// Time of the newest commit.
    pub last_checkin: Timestamp,
}

/// A registered project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Content-derived identity.
    pub id: ProjectId,
    /// Owner identity (e.g. an email address).
    pub owner: String,
    /// Sanitised display name.
    pub name: String,
    /// Home page URL, or empty.
    #[serde(default)]
    pub home_url: String,
    /// Source repository URL, or empty.
    #[serde(default)]
    pub source_url: String,
    /// Bug tracker URL, or empty.
    #[serde(default)]
    pub bug_url: String,
    /// Registration time.
    #[serde(default)]
    pub created: Timestamp,
    /// Reconciled counters.
    #[serde(flatten)]
    pub counters: ProjectCounters,
    #[serde(skip)]
    stats: Option<DerivedStats>,
    #[serde(skip)]
    dirty: bool,
}

impl Project {
    /// Registers a new project owned by `owner`.
    ///
    /// The name is stripped down to `[A-Za-z0-9-_. ]` and trimmed.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the owner is empty or nothing of the
    /// name survives sanitising.
    pub fn register(owner: &str, name: &str, now: Timestamp) -> Result<Self> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(StatsError::validation("owner is required"));
        }
        let name = sanitize_name(name);
        if name.is_empty() {
            return Err(StatsError::validation("project name is required"));
        }
        Ok(Self {
            id: ProjectId::derive(owner, &name),
            owner: owner.to_string(),
            name,
            home_url: String::new(),
            source_url: String::new(),
            bug_url: String::new(),
            created: now,
            counters: ProjectCounters::default(),
            stats: None,
            dirty: false,
        })
    }

    /// Store key of this project.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        key_for(&self.id)
    }

    /// Updates the informational URLs.
    ///
    /// Values that are not plain `http`/`https` URLs are stored as empty.
    pub fn set_urls(&mut self, home: &str, source: &str, bug: &str) {
        self.home_url = fix_url(&self.id, "home", home);
        self.source_url = fix_url(&self.id, "source", source);
        self.bug_url = fix_url(&self.id, "bug", bug);
    }

    /// Returns the derived statistics, or `None` until populated.
    #[must_use]
    pub const fn stats(&self) -> Option<&DerivedStats> {
        self.stats.as_ref()
    }

    /// Returns true once derived statistics are available.
    #[must_use]
    pub const fn is_populated(&self) -> bool {
        self.stats.is_some()
    }

    /// Returns true if the next population must bypass the cache.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Forces the next population to recompute from the event store.
    ///
    /// Discards any derived statistics already held.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.stats = None;
    }

    pub(crate) fn set_stats(&mut self, stats: DerivedStats) {
        self.stats = Some(stats);
        self.dirty = false;
    }
}

/// Store key of the project with `id`.
#[must_use]
pub fn key_for(id: &ProjectId) -> RecordKey {
    RecordKey::new(Kind::Project, id.as_str())
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
        .collect::<String>()
        .trim()
        .to_string()
}

fn fix_url(id: &ProjectId, which: &str, raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    let lower = raw.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"));
    let host_present = rest.is_some_and(|r| !r.is_empty() && !r.starts_with('/'));
    if !host_present || raw.contains('\'') || raw.chars().any(char::is_whitespace) {
        tracing::warn!(project = %id, which, url = raw, "rejecting project url");
        return String::new();
    }
    raw.to_string()
}

/// Loads a project.
///
/// # Errors
///
/// Returns [`StatsError::UnknownProject`] if no such project exists, or a
/// store/decode error.
pub async fn load(ctx: &Context, store: &dyn EventStore, id: &ProjectId) -> Result<Project> {
    let value = store.get(ctx, &key_for(id)).await.map_err(|e| {
        if e.is_not_found() {
            StatsError::UnknownProject { id: id.to_string() }
        } else {
            StatsError::Store(e)
        }
    })?;
    Ok(serde_json::from_value(value)?)
}

/// Writes a project, replacing the stored record.
///
/// # Errors
///
/// Returns an error if encoding or the store write fails.
pub async fn save(ctx: &Context, store: &dyn EventStore, project: &Project) -> Result<()> {
    let value = serde_json::to_value(project)?;
    store
        .put(ctx, &project.key(), value)
        .await
        .map_err(StatsError::Store)?;
    Ok(())
}

/// Loads every registered project.
///
/// # Errors
///
/// Returns the first store or decode error.
pub async fn load_all(ctx: &Context, store: &dyn EventStore) -> Result<Vec<Project>> {
    collect(ctx, store, Query::new(Kind::Project)).await
}

/// Loads the projects owned by `owner`, ordered by name.
///
/// # Errors
///
/// Returns the first store or decode error.
pub async fn load_by_owner(
    ctx: &Context,
    store: &dyn EventStore,
    owner: &str,
) -> Result<Vec<Project>> {
    let query = Query::new(Kind::Project)
        .filter(Filter::eq("owner", owner))
        .order(Order::asc("name"));
    collect(ctx, store, query).await
}

async fn collect(ctx: &Context, store: &dyn EventStore, query: Query) -> Result<Vec<Project>> {
    store
        .query(ctx, query)
        .await
        .map_err(StatsError::Store)?
        .map_err(StatsError::Store)
        .and_then(|record| async move { Ok(serde_json::from_value(record.value)?) })
        .try_collect()
        .await
}
