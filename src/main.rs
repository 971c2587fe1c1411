use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use inbox_triage::analysis::HttpAnalyzer;
use inbox_triage::api::{AppState, api_routes};
use inbox_triage::channels::{ImapFetcher, SmtpDispatcher, spawn_email_poller};
use inbox_triage::config::TriageConfig;
use inbox_triage::pipeline::worker::{spawn_recovery, spawn_workers};
use inbox_triage::pipeline::{MailFetcher, RecordProcessor, ReplyDispatcher};
use inbox_triage::privacy::PatternRedactor;
use inbox_triage::review::ReviewService;
use inbox_triage::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // IMAP and SMTP both use rustls; a second install attempt is harmless.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = TriageConfig::from_env().context("invalid configuration")?;

    // Keep the guard alive for the whole run so buffered log lines are flushed.
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting inbox triage");

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    tracing::info!(path = %config.db_path.display(), "Database ready");

    // ── Pipeline ─────────────────────────────────────────────────────────
    let policy = Arc::new(config.load_policy().context("failed to load triage policy")?);
    tracing::info!(version = %policy.version, "Triage policy loaded");

    let analyzer = HttpAnalyzer::new(config.analyzer.clone())?;
    tracing::info!(url = %config.analyzer.url, model = %config.analyzer.model, "Analysis engine configured");

    let processor = Arc::new(
        RecordProcessor::new(
            Arc::clone(&db),
            Arc::new(PatternRedactor::new()),
            Arc::new(analyzer),
            policy,
            config.retry.clone(),
        )
        .with_analysis_timeout(config.analyzer.timeout),
    );

    let (worker_handles, worker_shutdown) = spawn_workers(processor, &config.worker);
    let (recovery_handle, recovery_shutdown) =
        spawn_recovery(Arc::clone(&db), &config.worker, config.retry.max_retries);

    // ── Mailbox ──────────────────────────────────────────────────────────
    let mut dispatcher: Option<Arc<dyn ReplyDispatcher>> = None;
    let mut poller = None;
    match &config.email {
        Some(email) => {
            let fetcher: Arc<dyn MailFetcher> = Arc::new(ImapFetcher::new(email.clone()));
            poller = Some(spawn_email_poller(
                fetcher,
                Arc::clone(&db),
                std::time::Duration::from_secs(email.poll_interval_secs),
            ));
            dispatcher = Some(Arc::new(SmtpDispatcher::new(email.clone())));
            tracing::info!(
                imap = %email.imap_host,
                smtp = %email.smtp_host,
                poll_secs = email.poll_interval_secs,
                "Mailbox enabled"
            );
        }
        None => tracing::info!("Mailbox disabled (EMAIL_IMAP_HOST not set), manual injection only"),
    }

    // ── API ──────────────────────────────────────────────────────────────
    let review = Arc::new(ReviewService::new(Arc::clone(&db), dispatcher));
    let app = api_routes(AppState {
        db: Arc::clone(&db),
        review,
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "API server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("API server failed")?;

    // ── Shutdown ─────────────────────────────────────────────────────────
    if let Some((handle, shutdown)) = poller {
        shutdown.store(true, Ordering::Relaxed);
        handle.abort();
    }
    recovery_shutdown.store(true, Ordering::Relaxed);
    recovery_handle.abort();

    // Workers finish the record they hold; anything left PROCESSING is
    // released by the next run's recovery pass.
    worker_shutdown.store(true, Ordering::Relaxed);
    futures::future::join_all(worker_handles).await;

    tracing::info!("Stopped");
    Ok(())
}
