//! Process-wide default cache
//!
//! A single lazily created [`SecureCache`] for callers that do not manage their own
//! instance. It is built from [`CacheConfig::from_env`] on first use unless [`init`]
//! supplied a configuration earlier. [`shutdown`] closes it; the closed instance is
//! kept so later calls fail with `CacheClosed` rather than silently recreating it.

use std::future::Future;

use parking_lot::{const_mutex, Mutex};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::SecureCache;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

static DEFAULT: Mutex<Option<SecureCache>> = const_mutex(None);

// == Init ==
/// Creates the default instance from an explicit configuration.
///
/// Fails with `InvalidConfig` if the default instance already exists.
pub fn init(config: CacheConfig) -> Result<SecureCache> {
    let mut slot = DEFAULT.lock();
    if slot.is_some() {
        return Err(CacheError::InvalidConfig(
            "default cache is already initialized".to_string(),
        ));
    }
    let cache = SecureCache::new(config)?;
    *slot = Some(cache.clone());
    Ok(cache)
}

// == Instance ==
/// Returns the default instance, creating it from the environment on first use.
pub fn instance() -> Result<SecureCache> {
    let mut slot = DEFAULT.lock();
    if let Some(cache) = slot.as_ref() {
        return Ok(cache.clone());
    }
    let cache = SecureCache::new(CacheConfig::from_env())?;
    *slot = Some(cache.clone());
    Ok(cache)
}

/// Returns the default instance only if it has been created.
pub fn try_instance() -> Option<SecureCache> {
    DEFAULT.lock().clone()
}

// == Shutdown ==
/// Shuts the default instance down if it exists. Idempotent.
pub async fn shutdown() {
    let cache = DEFAULT.lock().clone();
    if let Some(cache) = cache {
        cache.shutdown().await;
    }
}

/// Spawns a task that shuts the default instance down on Ctrl+C or SIGTERM.
///
/// Must be called from within a tokio runtime.
pub fn install_shutdown_hook() -> JoinHandle<()> {
    shutdown_on(shutdown_signal())
}

/// Spawns a task that shuts the default instance down once `trigger` completes.
pub fn shutdown_on<F>(trigger: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        trigger.await;
        shutdown().await;
        info!("Default cache shut down by termination hook");
    })
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down default cache...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down default cache...");
        }
    }
}
