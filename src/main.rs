//! OpenSASE Loyalty - points ledger service

use anyhow::Result;
use opensase_loyalty::{
    api::{self, AppState},
    audit::{ActivityLog, AuditOutbox, NatsActivityLog, TracingActivityLog},
    config::load_app_config,
    store::{self, LedgerStore, MemoryLedgerStore, PgLedgerStore, PoolConfig},
    PointsService,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_app_config()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let ledger: Arc<dyn LedgerStore> = match &config.database_url {
        Some(url) => {
            let pool_config = PoolConfig { max_connections: config.db_max_connections, ..PoolConfig::default() };
            let pool = store::connect_pool(url, pool_config).await?;
            store::run_migrations(&pool).await?;
            Arc::new(PgLedgerStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; points are kept in memory and lost on restart");
            Arc::new(MemoryLedgerStore::new())
        }
    };

    let sink: Arc<dyn ActivityLog> = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Arc::new(NatsActivityLog::new(client)),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unreachable; activity goes to the log only");
                Arc::new(TracingActivityLog)
            }
        },
        None => Arc::new(TracingActivityLog),
    };
    let (outbox, _audit_worker) = AuditOutbox::spawn(sink, config.audit_queue_capacity);

    let service = Arc::new(PointsService::new(ledger, config.tiers.clone(), outbox, config.service.clone()));
    let app = api::router(AppState { service: service.clone() });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("🚀 OpenSASE Loyalty listening on {}", config.bind_addr);
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    if let Err(e) = service.flush_audit().await {
        tracing::warn!(error = %e, "audit outbox not flushed");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal, starting graceful shutdown");
}
