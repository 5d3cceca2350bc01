use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use support_pipeline::api::{AppState, api_routes};
use support_pipeline::channels::{
    EmailSource, ImapConfig, ImapSource, LogSink, NotificationSink, SlackWebhook,
};
use support_pipeline::config::{DigestConfig, PipelineConfig, ScheduleConfig, ServerConfig};
use support_pipeline::llm::{LlmConfig, create_provider};
use support_pipeline::pipeline::types::TimeWindow;
use support_pipeline::pipeline::{DigestAggregator, LlmClassifier, Orchestrator};
use support_pipeline::scheduler::Scheduler;
use support_pipeline::store::{LibSqlBackend, NotionConfig, NotionStore, TicketStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let server_config = ServerConfig::from_env()?;
    let _log_guard = init_tracing(server_config.log_dir.as_deref());

    let pipeline_config = PipelineConfig::from_env()?;
    let schedule_config = ScheduleConfig::from_env()?;
    let digest_config = DigestConfig::from_env()?;
    let timeout = pipeline_config.call_timeout;

    // ── Classifier ───────────────────────────────────────────────────────
    let llm_config = LlmConfig::from_env()?;
    let llm = create_provider(&llm_config)?;
    let classifier = Arc::new(LlmClassifier::new(llm).with_body_limit(pipeline_config.body_limit));

    // ── Ledger + ticket store ────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&pipeline_config.db_path)
            .await
            .with_context(|| {
                format!("Failed to open database at {}", pipeline_config.db_path.display())
            })?,
    );
    let store: Arc<dyn TicketStore> = match NotionConfig::from_env()? {
        Some(notion) => Arc::new(NotionStore::new(notion, timeout)?),
        None => {
            tracing::info!("NOTION_DATABASE_ID not set, tickets stay in the local database");
            db.clone()
        }
    };

    // ── Edges ────────────────────────────────────────────────────────────
    let imap = ImapConfig::from_env()?
        .context("EMAIL_IMAP_HOST is not set; an email source is required")?;
    let source: Arc<dyn EmailSource> = Arc::new(ImapSource::new(imap, timeout));
    let sink: Arc<dyn NotificationSink> = match SlackWebhook::from_env(timeout) {
        Some(hook) => Arc::new(hook?),
        None => {
            tracing::info!("SLACK_WEBHOOK_URL not set, digests are only logged");
            Arc::new(LogSink)
        }
    };

    let orchestrator = Arc::new(
        Orchestrator::new(source, db, classifier, store.clone())
            .with_concurrency(pipeline_config.concurrency)
            .with_call_timeout(timeout),
    );
    let digest = Arc::new(
        DigestAggregator::new(store, sink)
            .with_top_n(digest_config.top_n)
            .with_call_timeout(timeout),
    );

    eprintln!("📬 Support Pipeline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Store: {}", orchestrator.store_name());
    eprintln!("   Digest sink: {}", digest.sink_name());

    // `run-once`: one full run plus digest, then exit.
    if std::env::args().nth(1).as_deref() == Some("run-once") {
        let window = TimeWindow::last_hours(schedule_config.window_hours);
        let report = orchestrator.run(window).await?;
        eprintln!(
            "   Fetched {} · skipped {} · stored {} · failed {}",
            report.fetched, report.skipped_duplicate, report.stored, report.failed
        );
        let delivery = digest.send_digest(window.through_now()).await?;
        eprintln!("   Digest delivered: {}", delivery.delivered);
        return Ok(());
    }

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = if schedule_config.enabled {
        let scheduler = Arc::new(Scheduler::new(
            &schedule_config,
            Arc::clone(&orchestrator),
            Arc::clone(&digest),
        )?);
        Arc::clone(&scheduler).spawn();
        eprintln!("   Schedule: {}", scheduler.expression());
        Some(scheduler)
    } else {
        eprintln!("   Schedule: disabled");
        None
    };

    // ── HTTP surface ─────────────────────────────────────────────────────
    let app = api_routes(AppState {
        orchestrator,
        digest,
        scheduler,
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server_config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", server_config.port))?;
    eprintln!("   API: http://0.0.0.0:{}/api/status\n", server_config.port);
    tracing::info!(port = server_config.port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}

/// Console logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "support-pipeline.log");
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
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}
