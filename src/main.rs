//! Gateway binary: configuration from the environment, shutdown on Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use coedit::{
    AcceptAll, CollabServer, EngineConfig, RocksStore, SharedSecretVerifier, StoreConfig,
    TokenVerifier,
};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let defaults = EngineConfig::default();
    let config = EngineConfig {
        bind_addr: std::env::var("COEDIT_BIND").unwrap_or(defaults.bind_addr),
        permissive_auth: env_or("COEDIT_PERMISSIVE", defaults.permissive_auth),
        debounce: Duration::from_millis(env_or(
            "COEDIT_DEBOUNCE_MS",
            defaults.debounce.as_millis() as u64,
        )),
        idle_eviction: Duration::from_secs(env_or(
            "COEDIT_IDLE_SECS",
            defaults.idle_eviction.as_secs(),
        )),
        ..defaults
    };

    let data_path = std::env::var("COEDIT_DATA").unwrap_or_else(|_| "coedit_data".to_string());
    let store = Arc::new(RocksStore::open(StoreConfig {
        path: data_path.into(),
        ..StoreConfig::default()
    })?);

    let verifier: Arc<dyn TokenVerifier> = match std::env::var("COEDIT_SECRET") {
        Ok(secret) => Arc::new(SharedSecretVerifier::new(secret)),
        Err(_) => {
            log::warn!("COEDIT_SECRET not set, accepting any non-empty token");
            Arc::new(AcceptAll)
        }
    };

    let server = CollabServer::new(config, store, verifier);
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
