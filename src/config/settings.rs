//! Application settings and configuration structures.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Root configuration structure containing all application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Server configuration (host, port)
    pub server: ServerSettings,

    /// Database configuration (PostgreSQL)
    pub database: DatabaseSettings,

    /// Token/session authentication settings
    pub auth: AuthSettings,

    /// Rate limiting and abuse-engine defaults
    pub limits: LimitSettings,

    /// Gateway (persistent connection) configuration
    pub gateway: GatewaySettings,

    /// CORS configuration
    pub cors: CorsSettings,

    /// Current environment (development, staging, production)
    pub environment: String,
}

/// Server binding configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Host address to bind to (e.g., "0.0.0.0")
    pub host: String,

    /// Port number to listen on
    pub port: u16,
}

/// PostgreSQL database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Minimum number of connections to maintain
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    pub acquire_timeout: u64,
}

/// Token and session authentication configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// Secret key for signing tokens
    pub jwt_secret: String,

    /// Access token expiry in minutes
    pub access_token_expiry_minutes: i64,

    /// Refresh token expiry in days
    pub refresh_token_expiry_days: i64,

    /// Seconds after a rotation during which presenting the replaced
    /// refresh token is treated as a benign duplicate rather than replay.
    /// Small on purpose: just wide enough to absorb double submission.
    pub refresh_grace_seconds: i64,

    /// Idle timeout measured from last_activity_at (0 = disabled)
    pub max_idle_seconds: i64,
}

/// Rate limiting and abuse-engine defaults. Most of these can be overridden
/// live through the runtime-settings store; these are the fallbacks.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitSettings {
    /// Room messages allowed per window per user
    pub room_msg_limit: i64,

    /// Room message window in seconds
    pub room_msg_window_seconds: i64,

    /// Strikes within the strike window before an automatic mute
    pub strikes_before_mute: i64,

    /// Strike accumulation window (also the auto-mute re-trigger cooldown)
    pub strike_window_seconds: i64,

    /// Duration of an automatic mute in minutes
    pub auto_mute_minutes: i64,

    /// Distinct-user capacity of a room before shard autoscaling (0 = unlimited)
    pub room_capacity: i64,

    /// Voice participants per room (0 = unlimited)
    pub voice_max_peers: i64,

    /// Maximum URL-like tokens per plaintext message
    pub max_urls_per_message: i64,

    /// Maximum @mentions per plaintext message
    pub max_mentions_per_message: i64,

    /// Repeats of the same normalized message before flagging
    pub dup_msg_max: i64,

    /// Duplicate-detection window in seconds
    pub dup_msg_window_seconds: i64,

    /// Minimum message length before duplicate detection applies
    pub dup_msg_min_len: i64,

    /// TTL of a signaling session still in the offered/invited state
    pub signal_offer_ttl_seconds: i64,

    /// TTL of an accepted/active signaling session
    pub signal_active_ttl_seconds: i64,
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsSettings {
    /// Allowed origins (comma-separated in env)
    pub allowed_origins: Vec<String>,
}

/// Persistent-connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    /// Maximum inbound message size in bytes
    pub max_message_size: usize,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Connection timeout for identify in seconds
    pub identify_timeout_secs: u64,
}

/// Minimum required length for JWT secret (256 bits = 32 bytes)
pub const MIN_JWT_SECRET_LENGTH: usize = 32;

impl Settings {
    /// Load settings from environment variables and configuration files.
    ///
    /// The loading order is:
    /// 1. config/default.toml (base configuration)
    /// 2. config/{RUN_ENV}.toml (environment-specific overrides)
    /// 3. Environment variables (highest priority)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if configuration cannot be loaded or parsed,
    /// or if the JWT secret is too short.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        // Determine the running environment
        let environment = std::env::var("RUN_ENV").unwrap_or_else(|_| "development".into());

        Config::builder()
            .set_default("environment", environment.clone())?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout", 30)?
            .set_default("auth.access_token_expiry_minutes", 15)?
            .set_default("auth.refresh_token_expiry_days", 7)?
            .set_default("auth.refresh_grace_seconds", 10)?
            .set_default("auth.max_idle_seconds", 2_592_000)? // 30 days
            .set_default("limits.room_msg_limit", 20)?
            .set_default("limits.room_msg_window_seconds", 10)?
            .set_default("limits.strikes_before_mute", 5)?
            .set_default("limits.strike_window_seconds", 300)?
            .set_default("limits.auto_mute_minutes", 10)?
            .set_default("limits.room_capacity", 50)?
            .set_default("limits.voice_max_peers", 12)?
            .set_default("limits.max_urls_per_message", 4)?
            .set_default("limits.max_mentions_per_message", 8)?
            .set_default("limits.dup_msg_max", 3)?
            .set_default("limits.dup_msg_window_seconds", 60)?
            .set_default("limits.dup_msg_min_len", 16)?
            .set_default("limits.signal_offer_ttl_seconds", 45)?
            .set_default("limits.signal_active_ttl_seconds", 600)?
            .set_default("cors.allowed_origins", vec!["http://localhost:3000"])?
            .set_default("gateway.max_message_size", 65536_i64)? // 64KB
            .set_default("gateway.heartbeat_interval_ms", 45000_i64)?
            .set_default("gateway.identify_timeout_secs", 30_i64)?
            // Load from config files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Load from environment variables
            // APP__SERVER__PORT=3000 -> server.port = 3000
            .add_source(
                Environment::default()
                    .prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            // Map simple environment variables
            .set_override_option("server.host", std::env::var("SERVER_HOST").ok())?
            .set_override_option("server.port", std::env::var("SERVER_PORT").ok())?
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("auth.jwt_secret", std::env::var("JWT_SECRET").ok())?
            .build()?
            .try_deserialize()
            .and_then(|settings: Self| {
                // Validate JWT secret length for security
                if settings.auth.jwt_secret.len() < MIN_JWT_SECRET_LENGTH {
                    return Err(ConfigError::Message(format!(
                        "JWT secret must be at least {} characters for security. Current length: {}",
                        MIN_JWT_SECRET_LENGTH,
                        settings.auth.jwt_secret.len()
                    )));
                }
                Ok(settings)
            })
    }

    /// Get the full server address as a string.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
