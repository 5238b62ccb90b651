use std::sync::Arc;

use anyhow::Context;
use bulkjobs_api::app::{ApiSettings, AppServices, build_app};
use bulkjobs_infra::PipelineConfig;

/// Tickets available in in-memory mode so the API is usable without a database.
const DEMO_TICKETS: std::ops::RangeInclusive<i64> = 1..=100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bulkjobs_observability::init("bulkjobs-api");

    let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
        "dev-secret".to_string()
    });
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    let persistent = std::env::var("USE_PERSISTENT_STORES")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;

    let services = if persistent {
        AppServices::persistent(&config)
            .await
            .context("failed to connect persistent stores")?
    } else {
        let services = AppServices::in_memory(&config).context("failed to start in-memory pipeline")?;
        services.seed_tickets(DEMO_TICKETS);
        tracing::info!(first = DEMO_TICKETS.start(), last = DEMO_TICKETS.end(), "seeded demo tickets");
        services
    };
    let services = Arc::new(services);

    let settings = ApiSettings::new(jwt_secret).with_internal_token(config.internal_token.clone());
    let app = build_app(settings, services.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!(addr = %listener.local_addr()?, persistent, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
}
