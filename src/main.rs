//! Livestream Lobby Backend
//!
//! REST backend for the DJ livestream rotation, the lobby around it and artist
//! payouts, with SQLite persistence.

mod api;
mod auth;
mod chat;
mod config;
mod db;
mod errors;
mod jobs;
mod models;
mod payouts;
mod presence;
mod push;
mod ratelimit;
mod scheduler;

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chat::ChatService;
use config::{Config, LogFormat};
use db::Repository;
use payouts::{PaypalPayouts, PayoutService, Providers, StripeTransfers, TransferProvider};
use presence::PresenceService;
use push::{Broadcaster, HttpPushBroadcaster, LogBroadcaster};
use scheduler::SlotScheduler;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub scheduler: SlotScheduler,
    pub presence: Arc<PresenceService>,
    pub chat: Arc<ChatService>,
    pub payouts: Arc<PayoutService>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire up the services from configuration.
    pub fn build(
        repo: Arc<Repository>,
        config: Config,
        push: Arc<dyn Broadcaster>,
        providers: Providers,
    ) -> Self {
        let scheduler = SlotScheduler::new(
            repo.clone(),
            push.clone(),
            config.lobby_open,
            config.max_slot_length,
        );
        let presence = Arc::new(PresenceService::new(
            repo.clone(),
            push.clone(),
            config.presence_stale,
            config.presence_cache_ttl,
            config.heartbeat_rate_per_minute,
        ));
        let chat = Arc::new(ChatService::new(
            repo.clone(),
            push,
            config.chat_retention,
            config.chat_rate_per_minute,
        ));
        let payouts = Arc::new(PayoutService::new(
            repo.clone(),
            providers,
            config.payouts.clone(),
        ));

        Self {
            repo,
            scheduler,
            presence,
            chat,
            payouts,
            config: Arc::new(config),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    tracing::info!("Starting Livestream Lobby Backend");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Bind address: {}", config.bind_addr);

    // Warn if PSK is not configured
    if config.api_psk.is_none() {
        tracing::warn!("No API PSK configured (LOBBY_API_PSK). Authentication is disabled!");
    }
    if config.cron_secret.is_none() {
        tracing::warn!("No cron secret configured (LOBBY_CRON_SECRET). /cron routes will reject every call");
    }

    // Initialize database
    let pool = db::init_database(&config.db_path).await?;
    let repo = Arc::new(Repository::new(pool));

    let push: Arc<dyn Broadcaster> = match config.push.clone() {
        Some(push_config) => {
            tracing::info!("Publishing lobby events to {}", push_config.url);
            Arc::new(HttpPushBroadcaster::new(push_config))
        }
        None => {
            tracing::warn!("No push service configured (LOBBY_PUSH_URL), events are only logged");
            Arc::new(LogBroadcaster)
        }
    };

    let providers = Providers {
        stripe: config
            .stripe
            .clone()
            .map(|c| Arc::new(StripeTransfers::new(c)) as Arc<dyn TransferProvider>),
        paypal: config
            .paypal
            .clone()
            .map(|c| Arc::new(PaypalPayouts::new(c)) as Arc<dyn TransferProvider>),
    };
    if providers.stripe.is_none() && providers.paypal.is_none() {
        tracing::warn!("No payout provider configured, queued payouts will wait");
    }

    // Create application state
    let state = AppState::build(repo, config.clone(), push, providers);

    // Background jobs
    if let Some(interval) = config.switchover_interval {
        jobs::spawn_switchover(state.scheduler.clone(), interval);
    }
    if let Some(interval) = config.cleanup_interval {
        jobs::spawn_cleanup(state.presence.clone(), state.chat.clone(), interval);
    }
    if let Some(interval) = config.payout_interval {
        jobs::spawn_payout_retry(state.payouts.clone(), interval);
    }

    // Build router
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let psk = state.config.api_psk.clone();
    let cron_secret = state.config.cron_secret.clone();

    // API routes
    let api_routes = Router::new()
        // Livestream
        .route("/livestream/status", get(api::livestream_status))
        .route("/livestream/switchover", post(api::switchover))
        .route(
            "/livestream/slots",
            get(api::list_slots).post(api::reserve_slot),
        )
        .route(
            "/livestream/slots/{id}",
            get(api::get_slot).delete(api::cancel_slot),
        )
        .route("/livestream/slots/{id}/check-in", post(api::check_in))
        .route("/livestream/slots/{id}/end", post(api::end_slot))
        .route("/livestream/slots/{id}/stream-key", get(api::stream_key))
        // Lobby
        .route("/lobby/presence", get(api::list_presence))
        .route("/lobby/presence/join", post(api::join_lobby))
        .route("/lobby/presence/heartbeat", post(api::heartbeat))
        .route("/lobby/presence/update", post(api::update_presence))
        .route("/lobby/presence/leave", post(api::leave_lobby))
        .route("/lobby/chat", get(api::recent_chat).post(api::send_chat))
        // Payouts
        .route(
            "/payouts/pending",
            get(api::list_pending_payouts).post(api::enqueue_payout),
        )
        .route(
            "/payouts/accounts/{artist_id}",
            get(api::get_payout_account).put(api::upsert_payout_account),
        )
        // Apply PSK auth middleware
        .layer(middleware::from_fn(move |req, next| {
            auth::psk_auth_layer(psk.clone(), req, next)
        }));

    let cron_routes = Router::new()
        .route("/livestream/switchover", post(api::cron_switchover))
        .route("/presence/cleanup", post(api::cron_presence_cleanup))
        .route("/chat/cleanup", post(api::cron_chat_cleanup))
        .route("/payouts/retry", post(api::cron_payout_retry))
        .layer(middleware::from_fn(move |req, next| {
            auth::cron_auth_layer(cron_secret.clone(), req, next)
        }));

    // Health check (no auth required)
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .nest("/cron", cron_routes)
        .merge(health_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.repo.ping().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "DATABASE UNAVAILABLE")
        }
    }
}

#[cfg(test)]
mod test_support;
