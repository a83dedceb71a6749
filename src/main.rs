use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use lead_ledger::config::PipelineConfig;
use lead_ledger::crm::IdentityResolver;
use lead_ledger::error::{PipelineError, RunStateError};
use lead_ledger::llm::create_provider;
use lead_ledger::mailbox::GraphMailbox;
use lead_ledger::pipeline::{LeadPipeline, LlmExtractor, RunSummary, ScreeningRules};
use lead_ledger::run_state::{FileRunStateStore, RunLock, RunStateTracker};
use lead_ledger::store::LibSqlLedger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("Invalid configuration")?;

    // Held for the life of the process so buffered log lines are flushed.
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📬 Lead Ledger v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Folder: {}", config.mailbox.folder);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Run state: {}", config.state_path.display());

    // ── LLM ──────────────────────────────────────────────────────────────
    let llm = create_provider(&config.llm).context("Failed to create LLM provider")?;

    // ── Ledger ───────────────────────────────────────────────────────────
    let ledger = Arc::new(
        LibSqlLedger::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open ledger at {}", config.db_path.display()))?,
    );

    // ── Pipeline ─────────────────────────────────────────────────────────
    let mailbox = Arc::new(GraphMailbox::new(
        config.mailbox.credentials.provider(),
        config.mailbox.folder.clone(),
    ));
    let tracker = RunStateTracker::new(
        Arc::new(FileRunStateStore::new(config.state_path.clone())),
        config.run_state.clone(),
    );
    let pipeline = LeadPipeline::new(mailbox, Arc::new(LlmExtractor::new(llm)), ledger, tracker)
        .with_resolver(IdentityResolver::new(config.resolver.clone()))
        .with_rules(ScreeningRules::default_rules(&config.internal_domains));

    let Some(schedule) = config.schedule.clone() else {
        let summary = run_locked(&pipeline, &config.lock_path).await?;
        print_summary(&summary);
        return Ok(());
    };

    // ── Scheduled mode ───────────────────────────────────────────────────
    eprintln!("   Schedule: enabled\n");
    // Runs are awaited in turn, so a slow batch delays the next tick
    // instead of overlapping it.
    while let Some(next) = schedule.upcoming(Utc).next() {
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tracing::debug!(next = %next.to_rfc3339(), "Waiting for next scheduled run");
        tokio::time::sleep(wait).await;

        match run_locked(&pipeline, &config.lock_path).await {
            Ok(summary) => print_summary(&summary),
            Err(PipelineError::RunState(RunStateError::RunInProgress { path })) => {
                tracing::warn!(lock = %path, "Previous run still active, skipping tick");
            }
            Err(e) => tracing::error!(error = %e, "Run aborted, state not committed"),
        }
    }

    Ok(())
}

/// One run under the advisory lock.
async fn run_locked(pipeline: &LeadPipeline, lock_path: &Path) -> Result<RunSummary, PipelineError> {
    let _lock = RunLock::acquire(lock_path)?;
    pipeline.run().await
}

fn print_summary(summary: &RunSummary) {
    eprintln!("✅ {summary}");
    if let Some(boundary) = summary.committed_boundary {
        eprintln!("   Committed boundary: {}", boundary.to_rfc3339());
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lead-ledger.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    guard
}
