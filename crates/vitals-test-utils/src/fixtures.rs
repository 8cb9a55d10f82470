//! Pre-wired test fixtures.
//!
//! [`StatsHarness`] connects every stats component to in-memory
//! collaborators and a manual clock so tests can drive time explicitly.

use std::sync::Arc;

use vitals_core::clock::MICROS_PER_HOUR;
use vitals_core::id::content_hash;
use vitals_core::{
    Cache, Clock, Context, EventStore, InMemoryTaskQueue, Kind, ManualClock, MemoryCache,
    ProjectId, TaskQueue, Timestamp,
};
use vitals_stats::events::{self, Countable};
use vitals_stats::project::{self, Project, ProjectCounters};
use vitals_stats::{Ingestor, ReconcileJob, RefreshHandler, StatsConfig, StatsPopulator};

use crate::storage::TracingEventStore;

/// Default harness start time: thirty days after the epoch.
pub const HARNESS_START: Timestamp = Timestamp::from_micros(30 * 24 * MICROS_PER_HOUR);

/// Owner used for factory-built projects.
pub const TEST_OWNER: &str = "owner@example.com";

/// Every stats component wired to in-memory collaborators.
pub struct StatsHarness {
    /// Traced event store.
    pub store: Arc<TracingEventStore>,
    /// Stats cache.
    pub cache: Arc<MemoryCache>,
    /// Refresh task queue.
    pub queue: Arc<InMemoryTaskQueue>,
    /// Manual clock shared by all components.
    pub clock: Arc<ManualClock>,
    /// Configuration shared by all components.
    pub config: StatsConfig,
    /// Stats populator.
    pub populator: Arc<StatsPopulator>,
    /// Reconciliation job.
    pub job: ReconcileJob,
    /// Webhook ingestor.
    pub ingestor: Ingestor,
    /// Refresh task handler.
    pub refresher: RefreshHandler,
}

impl StatsHarness {
    /// Creates a harness with default configuration at [`HARNESS_START`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StatsConfig::default(), HARNESS_START)
    }

    /// Creates a harness with `config`, starting the clock at `start`.
    #[must_use]
    pub fn with_config(config: StatsConfig, start: Timestamp) -> Self {
        let queue = Arc::new(InMemoryTaskQueue::new(config.refresh_queue.clone()));
        Self::with_queue(config, start, queue)
    }

    /// Creates a harness around an existing queue.
    #[must_use]
    pub fn with_queue(
        config: StatsConfig,
        start: Timestamp,
        queue: Arc<InMemoryTaskQueue>,
    ) -> Self {
        let store = Arc::new(TracingEventStore::new());
        let cache = Arc::new(MemoryCache::new());
        let clock = Arc::new(ManualClock::new(start));

        let dyn_store: Arc<dyn EventStore> = store.clone();
        let dyn_cache: Arc<dyn Cache> = cache.clone();
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let dyn_queue: Arc<dyn TaskQueue> = queue.clone();

        let populator = Arc::new(StatsPopulator::new(
            Arc::clone(&dyn_store),
            dyn_cache,
            Arc::clone(&dyn_clock),
            config.clone(),
        ));
        let job = ReconcileJob::new(
            Arc::clone(&dyn_store),
            Arc::clone(&dyn_clock),
            config.clone(),
        );
        let ingestor = Ingestor::new(
            Arc::clone(&dyn_store),
            dyn_queue,
            dyn_clock,
            Arc::clone(&populator),
            config.clone(),
        );
        let refresher = RefreshHandler::new(dyn_store, Arc::clone(&populator));

        Self {
            store,
            cache,
            queue,
            clock,
            config,
            populator,
            job,
            ingestor,
            refresher,
        }
    }

    /// Returns a fresh request context.
    #[must_use]
    pub fn ctx(&self) -> Context {
        Context::new("test")
    }

    /// Returns the current clock reading.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Moves the clock to `micros`.
    pub fn set_time(&self, micros: i64) {
        self.clock.set(Timestamp::from_micros(micros));
    }

    /// Timestamp `secs` seconds before now.
    #[must_use]
    pub fn secs_ago(&self, secs: u64) -> Timestamp {
        self.now().minus_secs(secs)
    }

    /// Registers and stores a project named `name`.
    pub async fn register(&self, name: &str) -> Project {
        let project = ProjectFactory::named(name);
        self.save_project(&project).await;
        project
    }

    /// Stores `project` as is.
    pub async fn save_project(&self, project: &Project) {
        project::save(&self.ctx(), self.store.as_ref(), project)
            .await
            .expect("save project");
    }

    /// Stores a commit or compilation at `at`.
    pub async fn seed_event(
        &self,
        kind: Kind,
        project: &ProjectId,
        at: Timestamp,
        counted: bool,
    ) -> Countable {
        let mut event = Countable::ticked(kind, project, at);
        event.counted = counted;
        self.save_event(&event).await;
        event
    }

    /// Stores an architecture ping at `at`.
    pub async fn seed_architecture(
        &self,
        project: &ProjectId,
        name: &str,
        at: Timestamp,
    ) -> Countable {
        let event = Countable::architecture(project, &architecture_hash(name), at);
        self.save_event(&event).await;
        event
    }

    /// Stores a rating or failure vote from `submitter`.
    pub async fn seed_vote(&self, kind: Kind, project: &ProjectId, submitter: &str) -> Countable {
        let event = Countable::vote(kind, project, submitter, self.now());
        self.save_event(&event).await;
        event
    }

    async fn save_event(&self, event: &Countable) {
        events::save(&self.ctx(), self.store.as_ref(), event)
            .await
            .expect("save event");
    }

    /// Loads a project as stored, without derived stats.
    pub async fn load(&self, id: &ProjectId) -> Project {
        project::load(&self.ctx(), self.store.as_ref(), id)
            .await
            .expect("load project")
    }

    /// Loads a project and populates its stats.
    pub async fn populated(&self, id: &ProjectId) -> Project {
        let mut project = self.load(id).await;
        self.populator
            .populate(&self.ctx(), &mut project)
            .await
            .expect("populate project");
        project
    }

    /// Loads every stored event of `kind`.
    pub async fn events_of(&self, kind: Kind) -> Vec<Countable> {
        events::load_all(&self.ctx(), self.store.as_ref(), kind)
            .await
            .expect("load events")
    }
}

impl Default for StatsHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Valid architecture hash for a readable architecture name.
#[must_use]
pub fn architecture_hash(name: &str) -> String {
    content_hash(&format!("arch|{name}"))
}

/// Factory for test projects.
pub struct ProjectFactory;

impl ProjectFactory {
    /// A project owned by [`TEST_OWNER`].
    #[must_use]
    pub fn named(name: &str) -> Project {
        Project::register(TEST_OWNER, name, HARNESS_START).expect("valid project")
    }

    /// A project with preset reconciled counters.
    #[must_use]
    pub fn with_counters(name: &str, counters: ProjectCounters) -> Project {
        let mut project = Self::named(name);
        project.counters = counters;
        project
    }

    /// A project with all three informational URLs set.
    #[must_use]
    pub fn with_urls(name: &str) -> Project {
        let mut project = Self::named(name);
        project.set_urls(
            "https://example.com/home",
            "https://example.com/source",
            "https://example.com/bugs",
        );
        project
    }
}
