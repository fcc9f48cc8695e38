use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub store: StoreBackend,
    pub session_ttl_seconds: u64,
    /// Connections that send nothing (not even a ping) for this long are dropped.
    pub relay_idle_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl StoreBackend {
    fn from_env() -> Self {
        match env::var("DESKPILOT_STORE")
            .unwrap_or_else(|_| "redis".into())
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            _ => StoreBackend::Redis,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("DESKPILOT_ROAD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            store: StoreBackend::from_env(),
            session_ttl_seconds: env::var("SESSION_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(2_592_000), // default 30 days
            relay_idle_timeout_seconds: env::var("DESKPILOT_RELAY_IDLE_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(120),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            store: StoreBackend::Redis,
            session_ttl_seconds: 2_592_000,
            relay_idle_timeout_seconds: 120,
        }
    }
}
