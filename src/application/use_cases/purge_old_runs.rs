use crate::domain::clock::Clock;
use crate::domain::external_apis::github::{DeleteOutcome, GitHubApi, Repository};
use crate::domain::models::run::{PageCursor, WorkflowRun, WorkflowRunsPage};
use anyhow::{Context, Error};
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::{Stream, StreamExt};
use std::num::NonZeroU32;
use std::sync::Arc;

/// When the purger reads its clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NowPolicy {
    /// Read once when `execute` starts and reuse it for every sweep.
    #[default]
    CaptureOnce,
    /// Read again at the start of each sweep.
    PerSweep,
}

#[derive(Debug, Clone)]
pub struct PurgeOldRunsUseCaseInput {
    pub repository: Repository,
    /// Runs strictly older than this are deleted.
    pub max_age: TimeDelta,
    /// `None` keeps sweeping until a sweep deletes nothing.
    pub max_sweeps: Option<NonZeroU32>,
    pub now_policy: NowPolicy,
    /// Log the runs that would be deleted without deleting them.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOldRunsUseCaseOutput {
    pub sweeps: u32,
    pub deleted: u32,
    pub failed_deletions: u32,
    pub sweep_limit_reached: bool,
}

#[async_trait]
pub trait PurgeOldRunsUseCase {
    async fn execute(&self, input: PurgeOldRunsUseCaseInput) -> PurgeOldRunsUseCaseOutput;
}

/// What happened during a single pass over every page.
#[derive(Debug, Default)]
struct SweepReport {
    /// Set as soon as a DELETE is issued, whatever its outcome.
    any_deleted: bool,
    deleted: u32,
    failed_deletions: u32,
    expired_seen: u32,
}

pub struct PurgeOldRunsInteractor<G, C>
where
    G: GitHubApi + Send + Sync + 'static,
    C: Clock + Send + Sync,
{
    github_api: Arc<G>,
    clock: Arc<C>,
}

impl<G, C> PurgeOldRunsInteractor<G, C>
where
    G: GitHubApi + Send + Sync + 'static,
    C: Clock + Send + Sync,
{
    pub fn new(github_api: Arc<G>, clock: Arc<C>) -> Self {
        Self { github_api, clock }
    }

    #[tracing::instrument(name = "sweep", skip_all, fields(sweep = sweep_number))]
    async fn sweep(
        &self,
        input: &PurgeOldRunsUseCaseInput,
        now: DateTime<Utc>,
        sweep_number: u32,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        let pages = workflow_run_pages(self.github_api.clone(), input.repository.clone());
        tokio::pin!(pages);

        while let Some(page) = pages.next().await {
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    // The rest of the sweep is abandoned; deletions made so far still count.
                    tracing::error!("{e:#}");
                    break;
                }
            };

            for run in page
                .runs
                .iter()
                .filter(|run| run.is_older_than(input.max_age, now))
            {
                report.expired_seen += 1;
                if input.dry_run {
                    tracing::info!(
                        "Would delete run with ID {} created at {}",
                        run.id,
                        run.created_at
                    );
                    continue;
                }
                self.delete_run(&input.repository, run, &mut report).await;
            }
        }

        report
    }

    async fn delete_run(
        &self,
        repository: &Repository,
        run: &WorkflowRun,
        report: &mut SweepReport,
    ) {
        report.any_deleted = true;
        match self
            .github_api
            .delete_workflow_run(repository, run.id)
            .await
        {
            Ok(DeleteOutcome::Deleted) => {
                tracing::info!("Deleted run with ID {}", run.id);
                report.deleted += 1;
            }
            Ok(DeleteOutcome::Rejected { status }) => {
                tracing::warn!(
                    "Failed to delete run with ID {}. Status code: {}",
                    run.id,
                    status
                );
                report.failed_deletions += 1;
            }
            Err(e) => {
                tracing::error!("Failed to delete run with ID {}: {e:#}", run.id);
                report.failed_deletions += 1;
            }
        }
    }
}

#[async_trait]
impl<G, C> PurgeOldRunsUseCase for PurgeOldRunsInteractor<G, C>
where
    G: GitHubApi + Send + Sync + 'static,
    C: Clock + Send + Sync,
{
    async fn execute(&self, input: PurgeOldRunsUseCaseInput) -> PurgeOldRunsUseCaseOutput {
        let mut output = PurgeOldRunsUseCaseOutput::default();
        let mut now = self.clock.now();

        loop {
            if let Some(max_sweeps) = input.max_sweeps
                && output.sweeps >= max_sweeps.get()
            {
                tracing::warn!(
                    "Stopping after {} sweeps even though the last one still deleted runs",
                    output.sweeps
                );
                output.sweep_limit_reached = true;
                break;
            }

            if output.sweeps > 0 && input.now_policy == NowPolicy::PerSweep {
                now = self.clock.now();
            }

            output.sweeps += 1;
            tracing::info!("Starting sweep {} of {}", output.sweeps, input.repository);
            let report = self.sweep(&input, now, output.sweeps).await;
            output.deleted += report.deleted;
            output.failed_deletions += report.failed_deletions;
            tracing::info!(
                "Sweep {} finished: {} expired, {} deleted, {} failed",
                output.sweeps,
                report.expired_seen,
                report.deleted,
                report.failed_deletions
            );

            // A dry run never changes the listing, so one pass is all there is to see.
            if input.dry_run || !report.any_deleted {
                break;
            }
        }

        output
    }
}

/// Walks the runs listing page by page, following the server's `next` links.
///
/// The stream ends with an error item on the first failed fetch.
fn workflow_run_pages<G>(
    github_api: Arc<G>,
    repository: Repository,
) -> impl Stream<Item = Result<WorkflowRunsPage, Error>> + Send
where
    G: GitHubApi + Send + Sync + 'static,
{
    try_stream! {
        let mut cursor = Some(PageCursor::First);
        let mut page_number: u32 = 1;

        while let Some(current) = cursor.take() {
            tracing::info!("Fetching page {}", page_number);
            let page = github_api
                .fetch_workflow_runs_page(&repository, &current)
                .await
                .with_context(|| format!("Failed to fetch page {page_number} of runs for {repository}"))?;
            tracing::debug!("Page {} holds {} runs", page_number, page.runs.len());

            cursor = page.next.clone().map(PageCursor::Next);
            page_number += 1;
            yield page;
        }
    }
}
