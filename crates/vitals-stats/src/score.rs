//! Project quality score.

use crate::project::{DerivedStats, Project};

/// Highest achievable score.
pub const MAX_SCORE: u8 = 5;

const MIN_RATING: u64 = 5;
const MAX_FAILURES: u64 = 1;
const MIN_BUILDS: u64 = 50;
const MIN_BUILDS_AT_HEAD: u64 = 5;
const MIN_URL_LEN: usize = 16;

/// Scores a project from its derived statistics; one point per criterion.
///
/// - rating of at least 5
/// - at most one failure report
/// - at least 50 builds
/// - at least 5 builds at HEAD
/// - all three URLs set and longer than 15 characters
#[must_use]
pub fn score(stats: &DerivedStats, urls: [&str; 3]) -> u8 {
    let criteria = [
        stats.rating >= MIN_RATING,
        stats.failures <= MAX_FAILURES,
        stats.compile_total >= MIN_BUILDS,
        stats.compile_at_head >= MIN_BUILDS_AT_HEAD,
        urls.iter().all(|url| url.len() >= MIN_URL_LEN),
    ];
    criteria.iter().map(|met| u8::from(*met)).sum()
}

/// Scores a populated project. Returns `None` until the project is populated.
#[must_use]
pub fn project_score(project: &Project) -> Option<u8> {
    project.stats().map(|stats| {
        score(
            stats,
            [
                project.home_url.as_str(),
                project.source_url.as_str(),
                project.bug_url.as_str(),
            ],
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://a.example"; // 16 chars

    fn top() -> DerivedStats {
        DerivedStats {
            rating: 5,
            failures: 1,
            compile_total: 50,
            compile_at_head: 5,
            ..DerivedStats::default()
        }
    }

    #[test]
    fn boundary_project_scores_max() {
        assert_eq!(URL.len(), 16);
        assert_eq!(score(&top(), [URL, URL, URL]), MAX_SCORE);
    }

    #[test]
    fn each_criterion_drops_exactly_one_point() {
        let below: [fn(&mut DerivedStats); 4] = [
            |s| s.rating = 4,
            |s| s.failures = 2,
            |s| s.compile_total = 49,
            |s| s.compile_at_head = 4,
        ];
        for lower in below {
            let mut stats = top();
            lower(&mut stats);
            assert_eq!(score(&stats, [URL, URL, URL]), MAX_SCORE - 1);
        }

        let short = &URL[..15];
        assert_eq!(score(&top(), [URL, short, URL]), MAX_SCORE - 1);
        assert_eq!(score(&top(), [URL, URL, ""]), MAX_SCORE - 1);
    }

    #[test]
    fn empty_project_scores_one_for_no_failures() {
        assert_eq!(score(&DerivedStats::default(), ["", "", ""]), 1);
    }

    #[test]
    fn unpopulated_project_has_no_score() {
        let project =
            Project::register("o", "widget", vitals_core::Timestamp::ZERO).expect("register");
        assert_eq!(project_score(&project), None);
    }
}
