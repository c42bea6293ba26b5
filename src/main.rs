use std::sync::Arc;

use anyhow::Context;

use studioflow::api::api_routes;
use studioflow::channels::{
    DeliveryRouter, SmsConfig, SmtpConfig, SmtpEmailTransport, WebhookSmsTransport,
};
use studioflow::collab::{EmailTransport, SmsTransport};
use studioflow::config::EngineConfig;
use studioflow::dispatch::spawn_ticker;
use studioflow::engine::Engine;
use studioflow::store::{LibSqlStore, Store, StoreCollaborators};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env();

    let port: u16 = std::env::var("STUDIOFLOW_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let db_path = std::env::var("STUDIOFLOW_DB_PATH")
        .unwrap_or_else(|_| "./data/studioflow.db".to_string());

    eprintln!("📸 StudioFlow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{port}/api");
    eprintln!("   Database: {db_path}");
    eprintln!("   Tick: every {}s", config.tick_interval.as_secs());

    // ── Database ────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .with_context(|| format!("Failed to open database at {db_path}"))?,
    );

    // ── Transports ──────────────────────────────────────────────────
    let email: Option<Arc<dyn EmailTransport>> = match SmtpConfig::from_env() {
        Some(smtp) => {
            eprintln!("   Email: SMTP via {}", smtp.host);
            Some(Arc::new(SmtpEmailTransport::new(smtp)))
        }
        None => {
            eprintln!("   Email: disabled (SMTP_HOST not set)");
            None
        }
    };
    let sms: Option<Arc<dyn SmsTransport>> = match SmsConfig::from_env() {
        Some(sms) => {
            eprintln!("   SMS: webhook via {}", sms.endpoint);
            Some(Arc::new(WebhookSmsTransport::new(sms)))
        }
        None => {
            eprintln!("   SMS: disabled (SMS_ENDPOINT not set)");
            None
        }
    };

    // ── Engine ──────────────────────────────────────────────────────
    // Pipeline, calendar, and directory are served from the same database
    // (monolith deployment). Smart files require an external collaborator
    // and stay unconfigured here.
    let collaborators = Arc::new(StoreCollaborators::new(store.clone()));
    let router = Arc::new(DeliveryRouter::new(
        email,
        sms,
        None,
        collaborators.clone(),
        collaborators.clone(),
    ));
    let engine = Arc::new(Engine::new(
        config.clone(),
        store.clone(),
        router,
        collaborators.clone(),
        collaborators.clone(),
        collaborators,
    ));

    // ── Scheduler ticker ────────────────────────────────────────────
    let _ticker = spawn_ticker(engine.dispatcher(), config.tick_interval);

    // ── API server ──────────────────────────────────────────────────
    let app = api_routes(engine, store);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    tracing::info!(port, "StudioFlow listening");
    axum::serve(listener, app).await.context("API server exited")?;

    Ok(())
}
