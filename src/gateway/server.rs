//! Gateway server construction and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    routing::{delete, get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{api, auth};
use crate::access::AccessPipeline;
use crate::admin::AdminService;
use crate::config::Config;
use crate::keys::KeyCache;
use crate::session::SessionManager;
use crate::storage::{
    AdminStore, MemoryAdminStore, MemoryTokenStore, RedisAdminStore, RedisTokenStore, TokenStore,
};
use crate::tokens::TokenService;
use crate::{Error, Result};

/// Shared state injected into every handler.
///
/// There are no application singletons: everything a handler needs travels
/// through this struct, so tests can assemble a gateway around an in-memory
/// store without touching globals.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration.
    pub config: Arc<Config>,
    /// Token issuance and lookup.
    pub tokens: Arc<TokenService>,
    /// Session cookie crypto.
    pub sessions: Arc<SessionManager>,
    /// Compiled capability pipeline.
    pub access: Arc<AccessPipeline>,
    /// Administrator roster.
    pub admins: Arc<AdminService>,
}

/// The gateway server.
pub struct Gateway {
    state: AppState,
}

impl Gateway {
    /// Assemble the gateway from validated configuration.
    ///
    /// Selects the storage backend (Redis when `redis_url` is set, memory
    /// otherwise), compiles the capability pipeline, and seeds the admin
    /// roster.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for configuration problems and
    /// [`Error::Storage`] if Redis is configured but unreachable.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let (token_store, admin_store): (Arc<dyn TokenStore>, Arc<dyn AdminStore>) =
            match config.redis_url {
                Some(ref url) => {
                    let client = redis::Client::open(url.as_str())
                        .map_err(|e| Error::Storage(e.to_string()))?;
                    let conn = redis::aio::ConnectionManager::new(client)
                        .await
                        .map_err(|e| Error::Storage(e.to_string()))?;
                    info!("Using Redis token storage");
                    (
                        Arc::new(RedisTokenStore::with_connection(conn.clone())),
                        Arc::new(RedisAdminStore::with_connection(conn)),
                    )
                }
                None => {
                    info!("Using in-memory token storage");
                    (
                        Arc::new(MemoryTokenStore::new()),
                        Arc::new(MemoryAdminStore::new()),
                    )
                }
            };

        let keys = Arc::new(KeyCache::new(config.jwks_ttl, config.http_timeout));
        let tokens = Arc::new(TokenService::new(
            Arc::clone(&config),
            token_store,
            keys,
        )?);
        let access = Arc::new(AccessPipeline::from_config(&config)?);
        let sessions = Arc::new(SessionManager::new(
            &config.session_key()?,
            config.cookie.name.clone(),
            config.cookie.secure,
        ));
        let admins = Arc::new(AdminService::new(admin_store));
        admins.seed(&config.admins).await?;

        Ok(Self {
            state: AppState {
                config,
                tokens,
                sessions,
                access,
                admins,
            },
        })
    }

    /// The shared state (for tests that drive components directly).
    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router. Public so tests can drive it without a socket.
    #[must_use]
    pub fn router(&self) -> Router {
        let timeout = self.state.config.http_timeout;
        Router::new()
            .route("/health", get(health))
            .route("/auth", get(auth::authorize))
            .route(
                "/auth/tokens",
                get(api::list_tokens).post(api::create_token),
            )
            .route(
                "/auth/tokens/{key}",
                get(api::get_token).delete(api::delete_token),
            )
            .route("/auth/api/v1/login", get(api::login))
            .route("/auth/api/v1/logout", post(api::logout))
            .route(
                "/auth/api/v1/admins",
                get(api::list_admins).post(api::add_admin),
            )
            .route("/auth/api/v1/admins/{username}", delete(api::remove_admin))
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(timeout.max(Duration::from_secs(1))))
            .with_state(self.state.clone())
    }

    /// Bind and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the configured address
    /// or an unrecoverable runtime error occurs.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.state
                .config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.state.config.server.port,
        );

        let router = self.router();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("Cannot bind {addr}: {e}")))?;
        info!(addr = %addr, "Gateway listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(format!("Server error: {e}")))
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
