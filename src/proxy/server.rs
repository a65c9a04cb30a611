//! HTTP server setup and configuration.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use reqwest::Client;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{admission, handlers, metrics::MetricsRecorder};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::credits::{CreditsService, Ledger};
use crate::error::Result;
use crate::providers::{ProviderRegistry, SubProviderPool};
use crate::router::LoadBalancer;
use crate::storage;
use crate::tokens::TokenCounter;

/// Request/response header carrying the correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Uploads on the audio endpoint may exceed axum's 2 MB default.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Correlation id of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: SqlitePool,
    pub catalog: Arc<Catalog>,
    pub registry: Arc<ProviderRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub sub_providers: SubProviderPool,
    pub ledger: Ledger,
    pub metrics: MetricsRecorder,
    pub tokens: Arc<TokenCounter>,
}

impl AppState {
    /// Wire up every component and mirror the static catalog into storage:
    /// provider rows are synced, configured credentials and accounts seeded.
    pub async fn build(config: Config, db: SqlitePool, client: Client) -> Result<Self> {
        let catalog = Catalog::from_config(&config.models);
        let registry = ProviderRegistry::from_config(&config.providers, &client)?;
        registry.sync(&db).await?;

        let sub_providers = SubProviderPool::new(db.clone());
        sub_providers.seed(&config.providers).await?;

        let ledger = Ledger::new(db.clone());
        let created = ledger.seed(&config.accounts).await?;
        if created > 0 {
            tracing::info!(count = created, "Seeded accounts");
        }

        Ok(Self {
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            registry: Arc::new(registry),
            balancer: Arc::new(LoadBalancer::new(db.clone())),
            sub_providers,
            ledger,
            metrics: MetricsRecorder::new(db.clone()),
            tokens: Arc::new(TokenCounter::new()?),
            db,
        })
    }

    /// Swap the load balancer, e.g. for one with a seeded random source.
    pub fn with_balancer(mut self, balancer: LoadBalancer) -> Self {
        self.balancer = Arc::new(balancer);
        self
    }
}

/// Reuse the caller's `x-request-id` or mint one, and echo it on the response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/moderations", post(handlers::moderations))
        .route("/v1/images/generations", post(handlers::images_generations))
        .route("/v1/text/translations", post(handlers::text_translations))
        .route("/v1/audio/speech", post(handlers::audio_speech))
        .route("/v1/audio/translations", post(handlers::audio_translations))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admission::admit,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/v1/models", get(handlers::list_models))
        .merge(authenticated)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        // State and middleware
        .with_state(state)
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Run the HTTP server until `shutdown` resolves.
///
/// The credit replenishment task runs alongside and is stopped once the
/// server has drained.
pub async fn run_server(
    config: Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let db_path = config.database().path;

    let db = storage::init_pool(&db_path).await?;
    tracing::info!(path = %db_path, "Database ready");

    // Per-request timeouts are set by each adapter
    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let state = AppState::build(config, db.clone(), http_client).await?;
    let credits = CreditsService::spawn(
        db,
        state.config.credits.clone(),
        CancellationToken::new(),
    );

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting switchyard gateway");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    credits.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}
