use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub cache: CacheConfig,
    pub kafka: KafkaConfig,
    pub auth: AuthConfig,
    pub gateway: GatewayConfig,
    pub business_rules: BusinessRules,
    pub rate_limits: RateLimits,
    pub refunds: RefundConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Retry and fallback behaviour of the shared cache.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub notification_topic: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub webhook_secret: String,
    pub signature_tolerance_seconds: i64,
    pub checkout_base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusinessRules {
    pub hold_ttl_seconds: u64,
    pub idempotency_ttl_seconds: u64,
    pub webhook_dedup_ttl_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RateLimitPolicy {
    pub per_user: i64,
    pub per_ip: i64,
    pub global: i64,
    pub window_seconds: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimits {
    pub checkout: RateLimitPolicy,
    pub approval: RateLimitPolicy,
    pub release: RateLimitPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefundConfig {
    pub base_backoff_seconds: i64,
    pub max_backoff_seconds: i64,
    pub poll_interval_seconds: u64,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. SLOTBOOK__GATEWAY__WEBHOOK_SECRET=whsec_live
            .add_source(config::Environment::with_prefix("SLOTBOOK").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
