//! Application Startup
//!
//! Wires the stores, ports, and process-local state together and starts
//! the server. All shared context is carried in an explicit `AppState`
//! handed to each handler group at registration time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use chrono::Utc;
use sqlx::PgPool;
use tokio::net::TcpListener;

use crate::application::services::{AbuseEngine, AuthService, SlidingWindowLimiter};
use crate::config::Settings;
use crate::domain::{
    FriendsProvider, PermissionChecker, ProfileStore, RoomDirectory, RuntimeSettings, Sanctions,
};
use crate::infrastructure::collaborators::{
    PgCredentialVerifier, PgFriendsProvider, PgPermissionChecker, PgProfileStore, PgRoomDirectory,
    PgRuntimeSettings, PgSanctions,
};
use crate::infrastructure::database;
use crate::infrastructure::repositories::{PgSessionRepository, PgTokenRepository};
use crate::presentation::gateway::{
    ConnectionLifecycle, ConnectionRegistry, PresenceBroadcaster, RoomService, SignalingTable,
    VoiceRosterManager,
};
use crate::presentation::http::routes;
use crate::presentation::middleware::{cors, logging};

/// How often the background sweeper prunes cold limiter and abuse state.
const SWEEP_INTERVAL_SECS: u64 = 300;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub settings: Arc<Settings>,
    pub auth: Arc<AuthService<PgTokenRepository, PgSessionRepository>>,
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomService>,
    pub signaling: Arc<SignalingTable>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub abuse: Arc<AbuseEngine>,
    pub presence: Arc<PresenceBroadcaster>,
    pub lifecycle: Arc<ConnectionLifecycle>,
    pub runtime: Arc<dyn RuntimeSettings>,
    pub profiles: Arc<dyn ProfileStore>,
    pub sanctions: Arc<dyn Sanctions>,
}

/// Application instance
pub struct Application {
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build the application from settings
    pub async fn build(settings: Settings) -> Result<Self> {
        let db = database::create_pool(&settings.database).await?;
        tracing::info!("Database connection pool created");

        database::run_migrations(&db).await?;
        tracing::info!("Database migrations applied");

        let state = build_state(db, settings.clone());
        spawn_sweeper(state.limiter.clone(), state.abuse.clone());

        let router = routes::create_router(state)
            .layer(logging::create_trace_layer())
            .layer(cors::create_cors_layer(&settings.cors));

        let addr = SocketAddr::from(([0, 0, 0, 0], settings.server.port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening on {}", addr);

        Ok(Self { listener, router })
    }

    /// Run the server until stopped
    pub async fn run_until_stopped(self) -> Result<()> {
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }

    /// Get the bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

fn build_state(db: PgPool, settings: Settings) -> AppState {
    let settings = Arc::new(settings);

    let tokens = Arc::new(PgTokenRepository::new(db.clone()));
    let sessions = Arc::new(PgSessionRepository::new(db.clone()));
    let credentials = Arc::new(PgCredentialVerifier::new(db.clone()));

    let sanctions: Arc<dyn Sanctions> = Arc::new(PgSanctions::new(db.clone()));
    let permissions: Arc<dyn PermissionChecker> = Arc::new(PgPermissionChecker::new(db.clone()));
    let friends: Arc<dyn FriendsProvider> = Arc::new(PgFriendsProvider::new(db.clone()));
    let profiles: Arc<dyn ProfileStore> = Arc::new(PgProfileStore::new(db.clone()));
    let directory: Arc<dyn RoomDirectory> = Arc::new(PgRoomDirectory::new(db.clone()));
    let runtime: Arc<dyn RuntimeSettings> = Arc::new(PgRuntimeSettings::new(db.clone()));

    let auth = Arc::new(AuthService::new(
        tokens,
        sessions,
        credentials,
        settings.auth.clone(),
    ));

    let registry = Arc::new(ConnectionRegistry::new());
    let voice = Arc::new(VoiceRosterManager::new());
    let signaling = Arc::new(SignalingTable::new(
        settings.limits.signal_offer_ttl_seconds,
        settings.limits.signal_active_ttl_seconds,
    ));
    let limiter = Arc::new(SlidingWindowLimiter::new());
    let abuse = Arc::new(AbuseEngine::new(
        sanctions.clone(),
        permissions.clone(),
        runtime.clone(),
        settings.limits.clone(),
    ));

    let rooms = Arc::new(RoomService::new(
        registry.clone(),
        voice,
        directory,
        sanctions.clone(),
        permissions,
        runtime.clone(),
        settings.limits.clone(),
    ));
    let presence = Arc::new(PresenceBroadcaster::new(
        registry.clone(),
        friends,
        profiles.clone(),
    ));
    let lifecycle = Arc::new(ConnectionLifecycle::new(
        registry.clone(),
        rooms.clone(),
        signaling.clone(),
        presence.clone(),
        sanctions.clone(),
    ));

    AppState {
        db,
        settings,
        auth,
        registry,
        rooms,
        signaling,
        limiter,
        abuse,
        presence,
        lifecycle,
        runtime,
        profiles,
        sanctions,
    }
}

/// Periodic pruning of cold rate buckets, strike records, and duplicate
/// histories. The hourly quota window is the longest-lived bucket.
fn spawn_sweeper(limiter: Arc<SlidingWindowLimiter>, abuse: Arc<AbuseEngine>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = Utc::now();
            limiter.sweep(3600, now);
            abuse.sweep(now).await;
        }
    });
}
