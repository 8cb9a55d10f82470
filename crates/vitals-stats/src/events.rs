//! Countable events and their store encoding.
//!
//! Every event belongs to one project and carries a logical-clock time.
//! Commits and compilations also carry a `counted` flag that flips
//! false → true exactly once, when reconciliation folds the event into the
//! project's all-time totals.
//!
//! Record names double as uniqueness keys:
//!
//! | kind | name |
//! |---|---|
//! | commit, compilation | `{project}:{tick}` |
//! | architecture | `{project}:{architecture hash}` |
//! | rating, failure | `{project}:{hash(category, submitter)}` |

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use vitals_core::id::content_hash;
use vitals_core::{
    Context, EventStore, Filter, Kind, ProjectId, Query, RecordKey, StoredRecord, Timestamp,
};

use crate::error::{Result, StatsError};

/// Field holding the owning project id.
pub const PROJECT_FIELD: &str = "project";
/// Field holding the logical-clock time.
pub const TIME_FIELD: &str = "time";
/// Field holding the counted flag.
pub const COUNTED_FIELD: &str = "counted";

/// Submitter identity used when the request carried no address.
const DEFAULT_SUBMITTER: &str = "devel";

/// One countable event as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countable {
    /// Store address (and uniqueness key) of the event.
    pub key: RecordKey,
    /// Owning project.
    pub project: ProjectId,
    /// Ingestion tick.
    pub time: Timestamp,
    /// Folded into the project's all-time total. Only meaningful for commits
    /// and compilations.
    pub counted: bool,
    /// Architecture hash for pings, submitter for ratings and failures.
    pub source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventBody {
    project: ProjectId,
    time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    counted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

/// Returns true for kinds that carry a `counted` flag.
#[must_use]
pub const fn is_counted_kind(kind: Kind) -> bool {
    matches!(kind, Kind::Commit | Kind::Compilation)
}

impl Countable {
    /// A commit or compilation keyed by its ingestion tick.
    #[must_use]
    pub fn ticked(kind: Kind, project: &ProjectId, time: Timestamp) -> Self {
        Self {
            key: RecordKey::new(kind, format!("{project}:{}", time.as_micros())),
            project: project.clone(),
            time,
            counted: false,
            source: None,
        }
    }

    /// An architecture-has-built ping; one per (project, architecture).
    ///
    /// `architecture` must already be a validated hash.
    #[must_use]
    pub fn architecture(project: &ProjectId, architecture: &str, time: Timestamp) -> Self {
        Self {
            key: RecordKey::new(Kind::Architecture, format!("{project}:{architecture}")),
            project: project.clone(),
            time,
            counted: false,
            source: Some(architecture.to_string()),
        }
    }

    /// A rating or failure vote; one per (project, category, submitter).
    ///
    /// An empty submitter address is recorded as `devel`.
    #[must_use]
    pub fn vote(kind: Kind, project: &ProjectId, submitter: &str, time: Timestamp) -> Self {
        let submitter = if submitter.trim().is_empty() {
            DEFAULT_SUBMITTER
        } else {
            submitter.trim()
        };
        let hash = content_hash(&format!("{kind}|{submitter}"));
        Self {
            key: RecordKey::new(kind, format!("{project}:{hash}")),
            project: project.clone(),
            time,
            counted: false,
            source: Some(submitter.to_string()),
        }
    }

    /// Returns the event's kind.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        self.key.kind()
    }

    /// Encodes the event as a store record.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_record(&self) -> Result<serde_json::Value> {
        let body = EventBody {
            project: self.project.clone(),
            time: self.time,
            counted: is_counted_kind(self.kind()).then_some(self.counted),
            source: self.source.clone(),
        };
        Ok(serde_json::to_value(body)?)
    }

    /// Decodes a stored record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record doesn't have the event shape.
    pub fn from_stored(record: StoredRecord) -> Result<Self> {
        let StoredRecord { key, value } = record;
        let body: EventBody = serde_json::from_value(value).map_err(|e| {
            StatsError::Serialization {
                message: format!("malformed event {key}: {e}"),
            }
        })?;
        Ok(Self {
            key,
            project: body.project,
            time: body.time,
            counted: body.counted.unwrap_or(false),
            source: body.source,
        })
    }
}

/// Query for every event of `kind` belonging to `project`.
#[must_use]
pub fn for_project(kind: Kind, project: &ProjectId) -> Query {
    Query::new(kind).filter(Filter::eq(PROJECT_FIELD, project.as_str()))
}

/// Loads every event of `kind` in the store.
///
/// # Errors
///
/// Returns the first store or decode error.
pub async fn load_all(
    ctx: &Context,
    store: &dyn EventStore,
    kind: Kind,
) -> Result<Vec<Countable>> {
    store
        .query(ctx, Query::new(kind))
        .await
        .map_err(StatsError::Store)?
        .map_err(StatsError::Store)
        .and_then(|record| async move { Countable::from_stored(record) })
        .try_collect()
        .await
}

/// Writes an event, replacing any previous record under its key.
///
/// # Errors
///
/// Returns an error if encoding or the store write fails.
pub async fn save(ctx: &Context, store: &dyn EventStore, event: &Countable) -> Result<()> {
    store
        .put(ctx, &event.key, event.to_record()?)
        .await
        .map_err(StatsError::Store)?;
    Ok(())
}
