use std::sync::Arc;

use anyhow::Context;

use lead_agent::channels::{HttpTransport, Transport, webhook_routes};
use lead_agent::config::{EngineConfig, PacingConfig, ServerConfig};
use lead_agent::llm::{LlmConfig, create_provider};
use lead_agent::media::UnsupportedMediaExtractor;
use lead_agent::notify::{AdminNotifier, FanoutNotifier, LogNotifier, TransportNotifier};
use lead_agent::pipeline::{Orchestrator, OrchestratorDeps};
use lead_agent::store::{LeadStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let engine_config = EngineConfig::from_env()?;
    let pacing = PacingConfig::from_env()?;
    let server = ServerConfig::from_env()?;
    let llm_config = LlmConfig::from_env()?;

    eprintln!("☀️  Lead Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook", server.port);
    eprintln!("   Database: {}", server.db_path);

    let llm = create_provider(&llm_config).context("Failed to create LLM provider")?;

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn LeadStore> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&server.db_path))
            .await
            .with_context(|| format!("Failed to open database at {}", server.db_path))?,
    );

    // ── Transport + admin alerts ─────────────────────────────────────────
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        server.transport_url.clone(),
        server.transport_token.clone(),
    ));

    let mut sinks: Vec<Arc<dyn AdminNotifier>> = vec![Arc::new(LogNotifier)];
    if let Some(ref admin) = server.admin_contact {
        eprintln!("   Admin alerts: {admin}");
        sinks.push(Arc::new(TransportNotifier::new(
            Arc::clone(&transport),
            admin.clone(),
        )));
    }
    let notifier: Arc<dyn AdminNotifier> = Arc::new(FanoutNotifier::new(sinks));

    // ── Orchestrator ─────────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(
        engine_config,
        pacing,
        OrchestratorDeps {
            store,
            llm,
            media: Arc::new(UnsupportedMediaExtractor),
            transport,
            notifier,
        },
    ));

    let app = webhook_routes(orchestrator);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", server.port))?;
    tracing::info!(port = server.port, "Webhook server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("Webhook server failed")?;

    Ok(())
}
