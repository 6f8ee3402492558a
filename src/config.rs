//! Configuration (D1)
//!
//! Environment-sourced startup configuration, validated eagerly so a
//! misconfigured deployment fails at boot rather than on the first session.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "transcribe-relay", about = "Real-time speech transcription and translation relay")]
pub struct Config {
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0")]
    pub listen_addr: String,

    #[arg(long, env = "LISTEN_PORT", default_value_t = 8080)]
    pub listen_port: u16,

    #[arg(long, env = "UPSTREAM_STT_URL")]
    pub upstream_stt_url: String,

    #[arg(long, env = "UPSTREAM_STT_API_KEY")]
    pub upstream_stt_api_key: String,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Comma-separated list of allowed client origins.
    #[arg(long, env = "ALLOWED_ORIGINS", default_value = "")]
    pub allowed_origins: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "WRITE_QUEUE_MAX_CONCURRENCY", default_value_t = 3)]
    pub write_queue_max_concurrency: usize,

    #[arg(long, env = "WRITE_QUEUE_MAX_RETRIES", default_value_t = 3)]
    pub write_queue_max_retries: u32,

    #[arg(long, env = "PERIODIC_SAVE_INTERVAL_MS", default_value_t = 60_000)]
    pub periodic_save_interval_ms: u64,
}

impl Config {
    /// Parse from environment/CLI and fail fast on anything structurally
    /// invalid that `clap`'s own parsing wouldn't already catch.
    pub fn load() -> Result<Self, String> {
        let config = Self::parse();

        url::Url::parse(&config.upstream_stt_url)
            .map_err(|e| format!("UPSTREAM_STT_URL is not a valid URL: {e}"))?;

        if config.upstream_stt_api_key.trim().is_empty() {
            return Err("UPSTREAM_STT_API_KEY must not be empty".into());
        }

        Ok(config)
    }

    pub fn allowed_origins(&self) -> Vec<&str> {
        self.allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn listen_socket_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_origins_splits_and_trims() {
        let config = Config {
            listen_addr: "0.0.0.0".into(),
            listen_port: 8080,
            upstream_stt_url: "wss://example.test/stream".into(),
            upstream_stt_api_key: "k".into(),
            database_url: "postgres://localhost/db".into(),
            allowed_origins: "https://a.test, https://b.test".into(),
            log_level: "info".into(),
            write_queue_max_concurrency: 3,
            write_queue_max_retries: 3,
            periodic_save_interval_ms: 60_000,
        };
        assert_eq!(config.allowed_origins(), vec!["https://a.test", "https://b.test"]);
    }
}
