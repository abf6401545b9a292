//! Application settings and configuration structures.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Root configuration structure containing all application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Server configuration (host, port)
    pub server: ServerSettings,

    /// Database configuration (PostgreSQL)
    pub database: DatabaseSettings,

    /// JWT authentication settings
    pub jwt: JwtSettings,

    /// CORS configuration
    pub cors: CorsSettings,

    /// Message bus configuration (producer, consumer, dead-letter topic)
    #[serde(default)]
    pub kafka: KafkaSettings,

    /// WebSocket configuration
    #[serde(default)]
    pub websocket: WebSocketSettings,

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

/// JWT authentication configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtSettings {
    /// Secret key for verifying tokens
    pub secret: String,
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsSettings {
    /// Allowed origins (comma-separated in env)
    pub allowed_origins: Vec<String>,
}

/// Which broker implementation backs the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// Apache Kafka through librdkafka (requires the `kafka` cargo feature)
    Kafka,
    /// In-process partitioned log, for development and tests
    Memory,
}

impl Default for BusBackend {
    fn default() -> Self {
        if cfg!(feature = "kafka") {
            Self::Kafka
        } else {
            Self::Memory
        }
    }
}

/// Producer compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    /// Codec name as understood by the broker client.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Message bus configuration.
///
/// Covers both sides of the pipeline: the producer publishing outbound chat
/// messages and the consumer group feeding the worker pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    pub backend: BusBackend,

    /// Bootstrap brokers (`host:port`)
    pub brokers: Vec<String>,

    /// Main topic carrying JSON chat messages
    pub topic_messages: String,

    /// Dead-letter topic; empty disables consumer-side quarantine writes
    pub topic_dlq: String,

    /// Consumer group id
    pub group_id: String,

    pub min_bytes: i32,
    pub max_bytes: i32,

    /// Broker fetch wait in milliseconds; also the base of the retry backoff
    pub max_wait_ms: u64,

    pub batch_size: usize,
    pub linger_ms: u64,
    pub compression: Compression,

    /// -1 = all in-sync replicas, 0 = none, 1 = leader only
    pub required_acks: i16,

    pub write_timeout_secs: u64,
    pub read_timeout_secs: u64,

    /// Processing attempts per consumed message before quarantine
    pub max_retry: u32,

    /// Attempts made by the send path when publishing
    pub publish_attempts: u32,

    /// Worker tasks pulling from the job queue
    pub worker_pool_size: usize,

    /// Concurrency tokens shared by all workers
    pub max_in_flight: usize,

    pub job_queue_capacity: usize,
    pub dispatch_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    pub processing_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,

    /// How often stale `sent` messages are republished (0 disables)
    pub reconcile_interval_secs: u64,

    /// Age after which a `sent` message is considered stuck
    pub reconcile_after_secs: u64,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            backend: BusBackend::default(),
            brokers: vec!["localhost:9092".to_string()],
            topic_messages: "chat-messages".to_string(),
            topic_dlq: "chat-messages-dlq".to_string(),
            group_id: "messenger".to_string(),
            min_bytes: 1,
            max_bytes: 10_000_000,
            max_wait_ms: 500,
            batch_size: 100,
            linger_ms: 10,
            compression: Compression::None,
            required_acks: -1,
            write_timeout_secs: 10,
            read_timeout_secs: 10,
            max_retry: 3,
            publish_attempts: 5,
            worker_pool_size: 10,
            max_in_flight: 10,
            job_queue_capacity: 100,
            dispatch_timeout_ms: 5000,
            fetch_timeout_ms: 100,
            processing_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            reconcile_interval_secs: 60,
            reconcile_after_secs: 120,
        }
    }
}

impl KafkaSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Upper bound for consumer retry backoff: the larger I/O timeout, or 30s
    /// when neither is set.
    pub fn retry_backoff_cap(&self) -> Duration {
        match self.write_timeout_secs.max(self.read_timeout_secs) {
            0 => Duration::from_secs(30),
            secs => Duration::from_secs(secs),
        }
    }
}

/// WebSocket configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    /// Deadline for a single frame write
    pub write_wait_secs: u64,

    /// Read deadline, refreshed whenever the peer shows liveness
    pub pong_wait_secs: u64,

    /// Ping interval; must be shorter than `pong_wait_secs`
    pub ping_period_secs: u64,

    /// Maximum inbound message size in bytes
    pub max_message_size: usize,

    /// Per-client outbound queue capacity
    pub outbound_queue_capacity: usize,

    /// Consecutive failed ping round-trips before the write pump gives up
    pub max_ping_failures: u32,

    /// Inactivity sweep interval (0 disables the sweep)
    pub health_check_interval_secs: u64,

    pub max_inactivity_secs: u64,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            write_wait_secs: 10,
            pong_wait_secs: 60,
            ping_period_secs: 54,
            max_message_size: 512,
            outbound_queue_capacity: 256,
            max_ping_failures: 3,
            health_check_interval_secs: 30,
            max_inactivity_secs: 30,
        }
    }
}

impl WebSocketSettings {
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }

    pub fn max_inactivity(&self) -> Duration {
        Duration::from_secs(self.max_inactivity_secs)
    }
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
    /// or if a value fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let environment = std::env::var("RUN_ENV").unwrap_or_else(|_| "development".into());

        let settings: Self = Config::builder()
            .set_default("environment", environment.clone())?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout", 30)?
            .set_default("cors.allowed_origins", vec!["http://localhost:3000"])?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // APP__KAFKA__TOPIC_MESSAGES=chat -> kafka.topic_messages = chat
            .add_source(
                Environment::default()
                    .prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .with_list_parse_key("cors.allowed_origins")
                    .try_parsing(true),
            )
            .set_override_option("server.port", std::env::var("SERVER_PORT").ok())?
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("jwt.secret", std::env::var("JWT_SECRET").ok())?
            .set_override_option(
                "kafka.brokers",
                std::env::var("KAFKA_BROKERS")
                    .ok()
                    .map(|b| b.split(',').map(str::to_string).collect::<Vec<_>>()),
            )?
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt.secret.len() < MIN_JWT_SECRET_LENGTH {
            return Err(ConfigError::Message(format!(
                "JWT secret must be at least {} characters for security. Current length: {}",
                MIN_JWT_SECRET_LENGTH,
                self.jwt.secret.len()
            )));
        }

        if self.websocket.ping_period_secs >= self.websocket.pong_wait_secs {
            return Err(ConfigError::Message(
                "websocket.ping_period_secs must be shorter than websocket.pong_wait_secs".into(),
            ));
        }

        let kafka = &self.kafka;
        if kafka.max_retry == 0
            || kafka.publish_attempts == 0
            || kafka.worker_pool_size == 0
            || kafka.max_in_flight == 0
            || kafka.job_queue_capacity == 0
        {
            return Err(ConfigError::Message(
                "kafka retry counts, worker pool, in-flight limit and job queue must be at least 1"
                    .into(),
            ));
        }

        Ok(())
    }

    /// Get the full server address as a string.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
