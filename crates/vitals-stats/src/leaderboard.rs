//! Project ranking.

use std::cmp::Ordering;

use vitals_core::{Context, EventStore, ProjectId};

use crate::error::Result;
use crate::populate::StatsPopulator;
use crate::project::{self, Project};
use crate::score;

/// A project with its score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedProject {
    /// The populated project.
    pub project: Project,
    /// Its quality score.
    pub score: u8,
}

impl RankedProject {
    fn rating(&self) -> u64 {
        self.project.stats().map_or(0, |s| s.rating)
    }
}

/// Ranks every project by score, then rating, then name; keeps the top `limit`.
///
/// Projects whose stats cannot be populated are left out and logged.
///
/// # Errors
///
/// Returns an error if the projects cannot be listed.
pub async fn top_projects(
    ctx: &Context,
    store: &dyn EventStore,
    populator: &StatsPopulator,
    limit: usize,
) -> Result<Vec<RankedProject>> {
    let mut ranked = Vec::new();
    for mut project in project::load_all(ctx, store).await? {
        if let Err(e) = populator.populate(ctx, &mut project).await {
            tracing::warn!(
                project = %project.id,
                error = %e,
                "leaving project off the leaderboard"
            );
            continue;
        }
        if let Some(score) = score::project_score(&project) {
            ranked.push(RankedProject { project, score });
        }
    }
    ranked.sort_by(compare);
    ranked.truncate(limit);
    Ok(ranked)
}

fn compare(a: &RankedProject, b: &RankedProject) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.rating().cmp(&a.rating()))
        .then_with(|| a.project.name.cmp(&b.project.name))
}

/// Project ids of a ranking, in order.
#[must_use]
pub fn ids_only(ranked: &[RankedProject]) -> Vec<ProjectId> {
    ranked.iter().map(|r| r.project.id.clone()).collect()
}
