use std::sync::Arc;

use anyhow::Context;
use bim_vcs::config::AppConfig;
use bim_vcs::context::OpContext;
use bim_vcs::logic::{ChangeTracker, ObjectStorage};
use bim_vcs::store::PostgresStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // DATABASE_URL and BIMVCS_* may come from a local .env
    dotenvy::dotenv().ok();

    // sqlx logs every statement at info; RUST_LOG still overrides both levels
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load().context("loading configuration")?;
    log::info!(
        "Configuration loaded: objects under {}",
        config.storage.object_root.display()
    );

    let database_url = config.database_url()?;
    let store = PostgresStore::new(&database_url, config.max_connections())
        .await
        .context("connecting to PostgreSQL")?;
    store.migrate().await.context("running migrations")?;
    log::info!("Database ready");

    let store = Arc::new(store);
    let objects = ObjectStorage::new(store.clone(), &config.storage);
    let tracker = ChangeTracker::new(store, &config.tracker);

    run_maintenance(&objects, &tracker, &config).await;

    Ok(())
}

/// Periodic garbage collection and change-log pruning until Ctrl-C.
async fn run_maintenance(
    objects: &ObjectStorage<PostgresStore>,
    tracker: &ChangeTracker<PostgresStore>,
    config: &AppConfig,
) {
    let (ctx, cancel) = OpContext::cancelable();
    let mut ticker = tokio::time::interval(config.gc.interval());

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                cancel.cancel();
                return;
            }
        }

        let cutoff = chrono::Utc::now() - config.gc.retention();
        if let Err(e) = objects.delete_unreferenced(&ctx, cutoff).await {
            log::error!("Garbage collection failed: {}", e);
        }

        if let Err(e) = tracker.prune_old_changes(&ctx, config.tracker.retention()).await {
            log::error!("Change pruning failed: {}", e);
        }
    }
}
