use crate::domain::models::run::{PageCursor, WorkflowRunsPage};
use anyhow::Error;
use async_trait::async_trait;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    pub owner: String,
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Outcome of a DELETE against a single workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The API answered 204 No Content.
    Deleted,
    /// Any other status, e.g. 404 for a run that is already gone.
    Rejected { status: u16 },
}

#[async_trait]
pub trait GitHubApi {
    /// Fetches one page of workflow runs. Any non-200 answer is an error.
    async fn fetch_workflow_runs_page(
        &self,
        repository: &Repository,
        cursor: &PageCursor,
    ) -> Result<WorkflowRunsPage, Error>;

    /// Deletes one workflow run. `Err` is reserved for transport failures;
    /// status codes other than 204 come back as [`DeleteOutcome::Rejected`].
    async fn delete_workflow_run(
        &self,
        repository: &Repository,
        run_id: u64,
    ) -> Result<DeleteOutcome, Error>;
}
