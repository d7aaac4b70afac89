use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;

use crate::db::Store;
use crate::db::memory::MemoryStore;
use crate::db::pg::{PgStore, db_pool};
use crate::db::redis::SnapshotCache;
use crate::engine::{Engine, EngineConfig};
use crate::util::env::{self, StoreBackend};
use crate::util::telemetry;

mod api;
mod clock;
mod constants;
mod db;
mod engine;
mod util;

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Env(#[from] env::EnvErr),

    #[error(transparent)]
    Store(#[from] db::StoreError),

    #[error(transparent)]
    Route(#[from] api::server::RouteError),

    #[error(transparent)]
    Std(#[from] Box<dyn std::error::Error>),
}

type Result<T> = core::result::Result<T, RunnerErr>;

#[tokio::main]
async fn main() -> Result<()> {
    let env = env::env().await?;
    let telemetry_registry = telemetry::Telemetry::new(env)?.register();

    tracing::info!("starting main application");

    let store: Arc<dyn Store> = match env.store_backend {
        StoreBackend::Postgres => {
            let store = PgStore::new(db_pool().await?, Duration::from_millis(env.store_timeout_ms));
            store.migrate().await?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store, nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let cache = match env.redis_url.as_deref() {
        Some(url) => match SnapshotCache::connect(url).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!(error = %e, "snapshot cache unavailable, reading from the store");
                None
            }
        },
        None => None,
    };

    let engine = Engine::new(store, EngineConfig::from(env), cache);

    let handles = vec![
        api::server::start_server(env, engine.clone()).await?,
        tokio::task::spawn(engine.scheduler().run()),
    ];

    _ = join_all(handles).await;

    telemetry_registry.shutdown();
    Ok(())
}
