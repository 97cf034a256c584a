//! Fedshelf - ActivityPub federation for a social reading server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inboxes, actor documents                                 │
//! │  - WebFinger, metrics                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Signature verification, actor resolution                 │
//! │  - Dispatch to side-effect handlers                         │
//! │  - Broadcaster and delivery queue                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - DomainStore trait                                        │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `data`: Domain store and SQLite implementation
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;
use std::time::Duration;

use data::DomainStore;
use federation::{
    ActorResolver, Broadcaster, DeliveryQueue, Dispatcher, FederationContext, InboxProcessor,
};

/// Maximum accepted inbox body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// Cheap to clone; every component is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Domain store (SQLite)
    pub store: Arc<dyn DomainStore>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,

    pub resolver: Arc<ActorResolver>,
    pub broadcaster: Arc<Broadcaster>,

    /// Persisted outbound delivery queue; started by the binary
    pub queue: Arc<DeliveryQueue>,

    /// Inbound verification and dispatch
    pub inbox: Arc<InboxProcessor>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the HTTP client
    /// 3. Wire resolver, queue, broadcaster and dispatcher
    /// 4. Provision configured local accounts
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = data::Database::connect(&config.database.path).await?;
        let store: Arc<dyn DomainStore> = Arc::new(db);

        // 2. Initialize HTTP client; per-request timeouts come from config
        let http_client = reqwest::Client::builder()
            .user_agent(config.federation.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.federation.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let http_client = Arc::new(http_client);

        Self::from_parts(config, store, http_client).await
    }

    /// Wire the federation components around an existing store
    ///
    /// # Errors
    /// Returns error if account provisioning fails
    pub async fn from_parts(
        config: config::AppConfig,
        store: Arc<dyn DomainStore>,
        http_client: Arc<reqwest::Client>,
    ) -> Result<Self, error::AppError> {
        let federation_config = Arc::new(config.federation.clone());

        let resolver = Arc::new(ActorResolver::new(
            store.clone(),
            http_client.clone(),
            federation_config.clone(),
        ));
        let queue = Arc::new(DeliveryQueue::new(
            store.clone(),
            http_client.clone(),
            federation_config.clone(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            store.clone(),
            resolver.clone(),
            queue.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(FederationContext {
            store: store.clone(),
            resolver: resolver.clone(),
            broadcaster: broadcaster.clone(),
            config: federation_config.clone(),
        }));

        for account in &config.accounts {
            Self::ensure_local_account(store.as_ref(), &federation_config, account).await?;
        }

        tracing::info!(
            accounts = config.accounts.len(),
            "Application state initialized successfully"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            http_client,
            resolver,
            broadcaster,
            queue,
            inbox: Arc::new(InboxProcessor::new(dispatcher)),
        })
    }

    /// Ensure a configured local account exists
    ///
    /// Creates the actor with a new RSA key pair, or updates its profile
    /// flags when the configuration changed. Existing keys are kept.
    async fn ensure_local_account(
        store: &dyn DomainStore,
        federation: &config::FederationConfig,
        account: &config::AccountConfig,
    ) -> Result<(), error::AppError> {
        if let Some(mut actor) = store.get_local_actor_by_username(&account.username).await? {
            let mut updated = false;

            if actor.display_name != account.display_name {
                actor.display_name = account.display_name.clone();
                updated = true;
            }
            if actor.manually_approves_followers != account.manually_approves_followers {
                actor.manually_approves_followers = account.manually_approves_followers;
                updated = true;
            }

            if updated {
                actor.updated_at = chrono::Utc::now();
                store.upsert_actor(&actor).await?;
                tracing::info!(username = %actor.username, "Local account updated");
            } else {
                tracing::info!(username = %actor.username, "Local account exists");
            }
            return Ok(());
        }

        tracing::info!(username = %account.username, "Creating local account...");

        let (private_key_pem, public_key_pem) =
            federation::generate_keypair(federation.key_size_bits)?;
        let mut actor = federation::build_local_actor(
            federation,
            &account.username,
            private_key_pem,
            public_key_pem,
        );
        actor.display_name = account.display_name.clone();
        actor.manually_approves_followers = account.manually_approves_followers;

        store.upsert_actor(&actor).await?;

        tracing::info!(username = %actor.username, id = %actor.id, "Local account created");
        Ok(())
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer,
    };

    // Leave the inbox its own timeout budget before cutting the connection
    let timeout = state.config.federation.inbound_timeout() + Duration::from_secs(5);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .merge(api::metrics_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
