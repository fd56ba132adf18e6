use std::sync::Arc;

use stockflow::api;
use stockflow::config;
use stockflow::db;
use stockflow::events::EventBroadcaster;
use stockflow::jobs::{HandlerRegistry, JobScheduler, JobStore, MemoryJobStore, PgJobsRepo};
use stockflow::telemetry;

mod handlers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    telemetry::init();

    tracing::info!(
        http_addr = %cfg.http_addr,
        store = if cfg.database_url.is_some() { "postgres" } else { "memory" },
        scheduler_interval_ms = cfg.scheduler_interval.as_millis() as u64,
        heartbeat_interval_ms = cfg.heartbeat_interval.as_millis() as u64,
        migrate_on_startup = cfg.migrate_on_startup,
        "stockflow starting"
    );

    let store: Arc<dyn JobStore> = match &cfg.database_url {
        Some(url) => {
            let pool = db::make_pool(url).await?;
            if cfg.migrate_on_startup {
                db::run_migrations(&pool).await?;
            }
            Arc::new(PgJobsRepo::new(pool))
        }
        None => {
            tracing::warn!("no database configured, jobs will not survive a restart");
            Arc::new(MemoryJobStore::new())
        }
    };

    let events = EventBroadcaster::new();
    let registry = HandlerRegistry::new();
    handlers::register_all(&registry);
    tracing::info!(job_types = ?registry.job_types(), "handlers ready");

    let scheduler = JobScheduler::new(Arc::clone(&store), registry, events.clone());

    let app = api::router(api::ApiState {
        store,
        scheduler: scheduler.clone(),
        events: events.clone(),
        observer_buffer: cfg.observer_buffer,
    });

    let listener = tokio::net::TcpListener::bind(&cfg.http_addr).await?;
    tracing::info!("api listening on http://{}", cfg.http_addr);

    scheduler.start(cfg.scheduler_interval);
    events.start_heartbeat(cfg.heartbeat_interval);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler, events))
        .await?;

    tracing::info!("stockflow stopped");
    Ok(())
}

/// Resolves on Ctrl-C after stopping both timers. Event streams never end on
/// their own, so they are closed here or axum would wait on them forever.
async fn shutdown_signal(scheduler: JobScheduler, events: EventBroadcaster) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");

    scheduler.stop();
    events.stop_heartbeat();
    events.close_all();
}
