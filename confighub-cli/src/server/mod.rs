mod auth;
pub mod config;
mod hub;
mod metrics;
mod releases;
mod routes;
mod state;
mod store;
mod versions;
mod watch;

#[cfg(test)]
mod api_tests;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use confighub_lib::AccessKey;
use tower_http::compression::CompressionLayer;
use tracing::{error, info, warn};

use self::auth::require_access_key;
use self::config::{ConfigHubConfig, StorageBackend};
use self::metrics::{handle_health_check, handle_metrics, handle_readyz, metrics, track_metrics};
use self::routes::{
    handle_cancel, handle_create_config, handle_delete_document, handle_diff,
    handle_get_config, handle_get_document, handle_get_version, handle_gray_release,
    handle_list_releases, handle_list_versions, handle_promote, handle_put_config,
    handle_register_key, handle_release, handle_rollback, handle_rollback_release,
    handle_update_percentage, handle_watch_config,
};
use self::state::AppState;
use self::store::memory::MemoryStore;
use self::store::sled_store::SledStore;
use self::store::ConfigStore;

/// Assemble the HTTP surface. Everything under `/api/v1` requires an access
/// key; health, readiness and metrics do not.
fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/api/v1/config",
            get(handle_get_config)
                .put(handle_put_config)
                .post(handle_create_config),
        )
        .route("/api/v1/config/watch", get(handle_watch_config))
        .route(
            "/api/v1/configs/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/api/v1/configs/{id}/versions", get(handle_list_versions))
        .route(
            "/api/v1/configs/{id}/versions/{version}",
            get(handle_get_version),
        )
        .route("/api/v1/configs/{id}/diff", get(handle_diff))
        .route(
            "/api/v1/configs/{id}/rollback/{version}",
            post(handle_rollback),
        )
        .route("/api/v1/configs/{id}/release", post(handle_release))
        .route("/api/v1/configs/{id}/releases", get(handle_list_releases))
        .route("/api/v1/configs/{id}/gray-release", post(handle_gray_release))
        .route("/api/v1/releases/{id}/promote", post(handle_promote))
        .route("/api/v1/releases/{id}/cancel", post(handle_cancel))
        .route("/api/v1/releases/{id}/rollback", post(handle_rollback_release))
        .route(
            "/api/v1/releases/{id}/percentage",
            put(handle_update_percentage),
        )
        .route("/api/v1/keys", post(handle_register_key))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_access_key,
        ));

    Router::new()
        .route("/health", get(handle_health_check))
        .route("/readyz", get(handle_readyz))
        .route("/metrics", get(handle_metrics))
        .merge(api)
        .layer(middleware::from_fn(track_metrics))
        .layer(CompressionLayer::new())
        .with_state(state)
}

fn open_store(config: &ConfigHubConfig) -> Arc<dyn ConfigStore> {
    match config.server.storage {
        StorageBackend::Sled => match SledStore::open(&config.server.data_dir) {
            Ok(store) => {
                info!(data_dir = %config.server.data_dir, "sled store opened");
                Arc::new(store)
            }
            Err(e) => {
                error!(data_dir = %config.server.data_dir, error = %e, "failed to open store");
                process::exit(1);
            }
        },
        StorageBackend::Memory => {
            warn!("using in-memory storage, nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    }
}

pub async fn run_serve(config: ConfigHubConfig) {
    let storage = config.server.storage;
    let store = open_store(&config);
    metrics()
        .storage_backend
        .with_label_values(&[storage.as_str()])
        .set(1);

    for entry in &config.access_keys {
        let key: AccessKey = entry.clone().into();
        if let Err(e) = store.put_access_key(key).await {
            error!(access_key = %entry.access_key, error = %e, "failed to seed access key");
            process::exit(1);
        }
    }
    if !config.access_keys.is_empty() {
        info!(count = config.access_keys.len(), "access keys seeded");
    }
    if config.server.allow_unsigned {
        warn!("unsigned requests are accepted");
    }
    if !config.server.trusted_proxies.is_empty() {
        info!(proxies = ?config.server.trusted_proxies, "trusting X-Forwarded-For from proxies");
    }

    let state = AppState::new(
        store,
        storage,
        config.watch.clone(),
        config.server.allow_unsigned,
        config.server.trusted_proxies.clone(),
    );
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.hostname, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(%addr, storage = storage.as_str(), "confighub listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    if let Err(e) = served {
        error!(error = %e, "server error");
        process::exit(1);
    }

    info!("server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await.ok();

    info!("shutdown signal received, finishing in-flight requests");
}
