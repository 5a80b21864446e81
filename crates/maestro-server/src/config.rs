//! Process configuration, resolved once at startup from `MAESTRO_`
//! environment variables and immutable afterwards.

use maestro_runtime::{ProjectQuota, RetryPolicy};

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub require_approval: bool,
    pub cors_origins: String,
    pub rate_limit_per_min: usize,
    pub secret_key: Option<String>,
    /// Seconds between background scheduler ticks; 0 disables the loop.
    pub scheduler_background_interval: f64,
    pub max_retries: u32,
    pub backoff_base_seconds: i64,
    pub backoff_jitter_seconds: i64,
    pub default_claim_ttl_seconds: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "maestro.db".into(),
            bind_addr: "127.0.0.1:8080".into(),
            require_approval: true,
            cors_origins: "*".into(),
            rate_limit_per_min: 1000,
            secret_key: None,
            scheduler_background_interval: 0.0,
            max_retries: 2,
            backoff_base_seconds: 30,
            backoff_jitter_seconds: 0,
            default_claim_ttl_seconds: 300,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("MAESTRO_DATABASE_URL", &defaults.database_url),
            bind_addr: env_string("MAESTRO_BIND_ADDR", &defaults.bind_addr),
            require_approval: env_parse("MAESTRO_REQUIRE_APPROVAL", defaults.require_approval),
            cors_origins: env_string("MAESTRO_CORS_ORIGINS", &defaults.cors_origins),
            rate_limit_per_min: env_parse("MAESTRO_RATE_LIMIT_PER_MIN", defaults.rate_limit_per_min),
            secret_key: std::env::var("MAESTRO_SECRET_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            scheduler_background_interval: env_parse(
                "MAESTRO_SCHEDULER_BACKGROUND_INTERVAL",
                defaults.scheduler_background_interval,
            ),
            max_retries: env_parse("MAESTRO_MAX_RETRIES", defaults.max_retries),
            backoff_base_seconds: env_parse(
                "MAESTRO_BACKOFF_BASE_SECONDS",
                defaults.backoff_base_seconds,
            ),
            backoff_jitter_seconds: env_parse(
                "MAESTRO_BACKOFF_JITTER_SECONDS",
                defaults.backoff_jitter_seconds,
            ),
            default_claim_ttl_seconds: env_parse(
                "MAESTRO_DEFAULT_CLAIM_TTL_SECONDS",
                defaults.default_claim_ttl_seconds,
            ),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base_seconds: self.backoff_base_seconds,
            backoff_jitter_seconds: self.backoff_jitter_seconds,
        }
    }

    /// Default quota applied to new projects that do not specify one.
    pub fn default_quota(&self) -> ProjectQuota {
        ProjectQuota::default()
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        if self.cors_origins.trim() == "*" {
            return Vec::new();
        }
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_published_table() {
        let config = Config::default();
        assert!(config.require_approval);
        assert_eq!(config.rate_limit_per_min, 1000);
        assert_eq!(config.default_claim_ttl_seconds, 300);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.backoff_base_seconds, 30);
        assert_eq!(config.scheduler_background_interval, 0.0);
        assert!(config.secret_key.is_none());
    }

    #[test]
    fn wildcard_cors_is_an_empty_origin_list() {
        let config = Config::default();
        assert!(config.cors_origin_list().is_empty());
        let scoped = Config {
            cors_origins: "https://a.example, https://b.example".into(),
            ..Config::default()
        };
        assert_eq!(
            scoped.cors_origin_list(),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }
}
