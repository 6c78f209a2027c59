//! `spindle` daemon: runs the reaper and heartbeat pruning against the
//! configured store until Ctrl-C.

use anyhow::Context;

use spindle_infra::config::StoreBackend;
use spindle_infra::{InMemoryStore, JobQueue, QueueConfig, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    spindle_observability::init();

    let config = QueueConfig::from_env().context("invalid SPINDLE_* configuration")?;

    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("memory backend selected; queue state lives only in this process");
            run(InMemoryStore::arc(), config).await
        }
        StoreBackend::Redis => run_redis(config).await,
    }
}

#[cfg(feature = "redis")]
async fn run_redis(config: QueueConfig) -> anyhow::Result<()> {
    use spindle_infra::store::RedisStore;

    let store = RedisStore::new(
        &config.store.redis_url,
        config.store.connect_timeout,
        config.store.max_txn_attempts,
    )
    .context("invalid redis url")?;
    store
        .ping()
        .with_context(|| format!("cannot reach redis at {}", config.store.redis_url))?;
    run(store, config).await
}

#[cfg(not(feature = "redis"))]
async fn run_redis(_config: QueueConfig) -> anyhow::Result<()> {
    anyhow::bail!("SPINDLE_STORE_BACKEND=redis needs a build with the `redis` feature")
}

async fn run<S>(store: S, config: QueueConfig) -> anyhow::Result<()>
where
    S: Store + Clone + Send + Sync + 'static,
{
    let namespace = config.namespace.clone();
    let reaper_interval = config.reaper.interval;
    let queue = JobQueue::new(store, config)?;

    let reaper = queue.reaper().spawn(Some(queue.fleet()));
    tracing::info!(
        namespace = %namespace,
        reaper_interval_ms = reaper_interval.as_millis() as u64,
        "spindle daemon running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    tokio::task::spawn_blocking(move || reaper.shutdown()).await?;
    tracing::info!("spindle daemon stopped");
    Ok(())
}
