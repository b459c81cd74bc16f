//! Keyset pagination and visibility scopes for build history queries.

use serde::{Deserialize, Serialize};

use crate::Build;

/// Limit applied when a page does not ask for one.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Which builds a history query may see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisibilityScope {
    /// Builds owned by any of these teams, plus builds of public pipelines.
    Teams(Vec<String>),
    /// Every build (administrative view).
    All,
    /// Only builds of public pipelines.
    Public,
}

/// Bounds for one page of results.
///
/// `from` and `to` are inclusive. They are build ids, or unix seconds of
/// the creation time when `use_date` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: usize,
    pub use_date: bool,
}

impl Page {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            self.limit
        }
    }

    /// The effective limit as a SQL `LIMIT` value, saturating at `i64::MAX`.
    pub fn sql_limit(&self) -> i64 {
        i64::try_from(self.effective_limit()).unwrap_or(i64::MAX)
    }

    fn key(&self, build: &Build) -> i64 {
        if self.use_date {
            build.created_at.timestamp()
        } else {
            build.id.get()
        }
    }

    /// Whether a build falls within this page's bounds.
    pub fn contains(&self, build: &Build) -> bool {
        let key = self.key(build);
        self.from.is_none_or(|from| key >= from) && self.to.is_none_or(|to| key <= to)
    }

    /// A page anchored at its lower bound selects the rows closest to it.
    pub fn anchored_at_from(&self) -> bool {
        self.from.is_some() && self.to.is_none()
    }
}

/// Cursors to the neighbouring pages of a result set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Page immediately newer than the first returned build.
    pub previous: Option<Page>,
    /// Page immediately older than the last returned build.
    pub next: Option<Page>,
}

impl Pagination {
    /// Build cursors from the boundary ids of a non-empty result.
    pub fn around(
        newest_id: i64,
        oldest_id: i64,
        has_newer: bool,
        has_older: bool,
        limit: usize,
    ) -> Self {
        Self {
            previous: has_newer.then_some(Page {
                from: Some(newest_id + 1),
                to: None,
                limit,
                use_date: false,
            }),
            next: has_older.then_some(Page {
                from: None,
                to: Some(oldest_id - 1),
                limit,
                use_date: false,
            }),
        }
    }
}

/// Select one page out of an already visibility-filtered set of builds.
pub fn paginate(mut builds: Vec<Build>, page: &Page) -> (Vec<Build>, Pagination) {
    builds.sort_by(|a, b| b.id.cmp(&a.id));

    let limit = page.effective_limit();
    let matching: Vec<&Build> = builds.iter().filter(|b| page.contains(b)).collect();

    let selected: Vec<Build> = if page.anchored_at_from() {
        let start = matching.len().saturating_sub(limit);
        matching[start..].iter().map(|b| (*b).clone()).collect()
    } else {
        matching.iter().take(limit).map(|b| (*b).clone()).collect()
    };

    let (Some(newest), Some(oldest)) = (selected.first(), selected.last()) else {
        return (selected, Pagination::default());
    };

    let has_newer = builds.iter().any(|b| b.id > newest.id);
    let has_older = builds.iter().any(|b| b.id < oldest.id);
    let pagination = Pagination::around(
        newest.id.get(),
        oldest.id.get(),
        has_newer,
        has_older,
        limit,
    );

    (selected, pagination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BuildId, BuildStatus, TeamId};
    use chrono::{TimeZone, Utc};

    fn builds(n: i64) -> Vec<Build> {
        (1..=n)
            .map(|i| Build {
                id: BuildId::new(i),
                name: i.to_string(),
                team_id: TeamId::new(1),
                pipeline_id: None,
                job_id: None,
                job_name: None,
                status: BuildStatus::Pending,
                scheduled: false,
                interceptible: true,
                drained: false,
                abort_url: None,
                created_at: Utc.timestamp_opt(1_000 + i * 10, 0).unwrap(),
                started_at: None,
                ended_at: None,
            })
            .collect()
    }

    fn ids(builds: &[Build]) -> Vec<i64> {
        builds.iter().map(|b| b.id.get()).collect()
    }

    #[test]
    fn test_sql_limit_saturates() {
        assert_eq!(Page::default().sql_limit(), DEFAULT_PAGE_LIMIT as i64);
        assert_eq!(Page::with_limit(10).sql_limit(), 10);
        assert_eq!(Page::with_limit(usize::MAX).sql_limit(), i64::MAX);
    }

    #[test]
    fn test_first_page_is_newest() {
        let (page, pagination) = paginate(builds(5), &Page::with_limit(2));
        assert_eq!(ids(&page), vec![5, 4]);
        assert_eq!(pagination.previous, None);
        assert_eq!(
            pagination.next,
            Some(Page {
                from: None,
                to: Some(3),
                limit: 2,
                use_date: false
            })
        );
    }

    #[test]
    fn test_following_cursors_walks_history() {
        let all = builds(5);
        let (_, first) = paginate(all.clone(), &Page::with_limit(2));
        let (second, cursors) = paginate(all.clone(), &first.next.unwrap());
        assert_eq!(ids(&second), vec![3, 2]);

        let (back, _) = paginate(all, &cursors.previous.unwrap());
        assert_eq!(ids(&back), vec![5, 4]);
    }

    #[test]
    fn test_from_selects_rows_closest_to_bound() {
        let page = Page {
            from: Some(2),
            limit: 2,
            ..Page::default()
        };
        let (selected, pagination) = paginate(builds(5), &page);
        assert_eq!(ids(&selected), vec![3, 2]);
        assert!(pagination.previous.is_some());
        assert!(pagination.next.is_some());
    }

    #[test]
    fn test_out_of_range_bounds_are_empty() {
        let future = Page {
            from: Some(100),
            limit: 10,
            ..Page::default()
        };
        let (selected, pagination) = paginate(builds(3), &future);
        assert!(selected.is_empty());
        assert_eq!(pagination.previous, None);

        let ancient = Page {
            to: Some(0),
            limit: 10,
            ..Page::default()
        };
        let (selected, pagination) = paginate(builds(3), &ancient);
        assert!(selected.is_empty());
        assert_eq!(pagination.next, None);
    }

    #[test]
    fn test_date_bounds_use_creation_time() {
        let page = Page {
            from: Some(1_015),
            to: Some(1_035),
            limit: 10,
            use_date: true,
        };
        let (selected, _) = paginate(builds(5), &page);
        assert_eq!(ids(&selected), vec![3, 2]);
    }

    #[test]
    fn test_zero_limit_uses_default() {
        let (selected, pagination) = paginate(builds(3), &Page::default());
        assert_eq!(selected.len(), 3);
        assert_eq!(pagination, Pagination::default());
    }
}
