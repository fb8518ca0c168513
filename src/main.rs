use std::sync::Arc;

use anyhow::Context;

use coverdesk::channels::{Channel, TelegramChannel};
use coverdesk::config::Settings;
use coverdesk::documents::{InsuranceDocumentExtractor, MindeeRecognizer};
use coverdesk::llm::{LlmConfig, RigReasoningAgent};
use coverdesk::logging;
use coverdesk::orchestrator::{Collaborators, Orchestrator, Runtime};
use coverdesk::policy::ChannelPolicyDelivery;
use coverdesk::session::LibSqlSessionStore;
use coverdesk::upload::UploadAggregator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    settings
        .ensure_data_dir()
        .with_context(|| format!("creating {}", settings.data_dir.display()))?;

    let _log_guard = logging::init(&settings.log_level, Some(&settings.log_file));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        model = %settings.model,
        database = %settings.database_path.display(),
        "Coverdesk starting"
    );

    // ── Session store ────────────────────────────────────────────────────
    let config = settings.orchestrator.clone();
    let store = Arc::new(
        LibSqlSessionStore::new_local(&settings.database_path, config.max_history)
            .await
            .context("opening session store")?,
    );

    // ── Channel ──────────────────────────────────────────────────────────
    let telegram = Arc::new(TelegramChannel::new(
        settings.bot_token.clone(),
        settings.allowed_users.clone(),
    ));
    if let Err(e) = telegram.health_check().await {
        tracing::warn!(error = %e, "Telegram health check failed, continuing");
    }
    let channel: Arc<dyn Channel> = telegram.clone();

    // ── Collaborators ────────────────────────────────────────────────────
    let reasoning = RigReasoningAgent::new(&LlmConfig {
        api_key: settings.openai_api_key.clone(),
        model: settings.model.clone(),
    })
    .context("creating reasoning agent")?;
    let recognizer = MindeeRecognizer::new(
        settings.mindee_api_key.clone(),
        settings.mindee_account_name.clone(),
    );
    let extractor = InsuranceDocumentExtractor::new(telegram.clone(), Arc::new(recognizer));
    let collaborators = Collaborators {
        reasoning: Arc::new(reasoning),
        extractor: Arc::new(extractor),
        delivery: Arc::new(ChannelPolicyDelivery::new(channel.clone())),
    };

    // ── Orchestrator ─────────────────────────────────────────────────────
    let (aggregator, flushes) = UploadAggregator::new(config.quiet_period);
    let orchestrator = Arc::new(Orchestrator::new(store, aggregator, collaborators, config));

    Runtime::new(orchestrator, channel)
        .run(flushes, shutdown_signal())
        .await
        .context("running event pump")?;

    tracing::info!("Coverdesk stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
