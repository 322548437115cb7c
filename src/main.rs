use anyhow::Context;
use gha_run_purger::application::use_cases::purge_old_runs::{
    PurgeOldRunsInteractor, PurgeOldRunsUseCase,
};
use gha_run_purger::domain::clock::SystemClock;
use gha_run_purger::infrastructures::adapters::secondary::external_apis::github::GitHubApiAdapter;
use gha_run_purger::infrastructures::config::PurgeConfig;
use gha_run_purger::infrastructures::telemetry;
use std::sync::Arc;
use tracing::{info, info_span};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry = telemetry::init_tracing()?;
    let result = run().await;
    telemetry.shutdown();
    result
}

async fn run() -> anyhow::Result<()> {
    let config = {
        let initialize_span = info_span!("initialize");
        let _enter = initialize_span.enter();
        let config = PurgeConfig::from_env().context("Invalid configuration")?;
        info!(
            "Purging runs of {} older than {} hours",
            config.repository,
            config.max_age.num_hours()
        );
        config
    };

    let mut client = reqwest::Client::builder();
    if let Some(timeout) = config.request_timeout {
        client = client.timeout(timeout);
    }
    let client = client.build().context("Failed to build HTTP client")?;

    // Build dependencies
    let github_api_adapter = Arc::new(
        GitHubApiAdapter::new(config.api_base_url.clone(), config.github_token.clone())
            .with_client(client)
            .with_per_page(config.per_page),
    );
    let purge_use_case = PurgeOldRunsInteractor::new(github_api_adapter, Arc::new(SystemClock));

    let output = purge_use_case.execute(config.use_case_input()).await;
    info!(
        "Done after {} sweeps: {} runs deleted, {} deletions failed",
        output.sweeps, output.deleted, output.failed_deletions
    );

    Ok(())
}
