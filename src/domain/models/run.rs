use chrono::{DateTime, TimeDelta, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub id: u64,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Whether the run is strictly older than `max_age` at `now`.
    ///
    /// A run whose age equals `max_age` is kept.
    pub fn is_older_than(&self, max_age: TimeDelta, now: DateTime<Utc>) -> bool {
        now - self.created_at > max_age
    }
}

/// One page of the workflow-runs listing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkflowRunsPage {
    pub runs: Vec<WorkflowRun>,
    /// Absolute URL of the following page, `None` on the last page.
    pub next: Option<String>,
}

/// Where to read the next page from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// The canonical runs-list endpoint, without any page parameter.
    First,
    /// A URL handed out by the server's pagination metadata.
    Next(String),
}
