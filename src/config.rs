//! Process configuration
//!
//! Every component owns its own config struct with a `Default` and a
//! `from_env()`; this module stitches them together once at startup.

use std::str::FromStr;

use crate::ingest::backfill::BackfillConfig;
use crate::ingest::incremental::IncrementalConfig;
use crate::provider::client::ProviderConfig;
use crate::provider::retry::RetryPolicy;
use crate::provider::token::TokenConfig;

/// Read an env var and parse it, falling back to `default` when unset or invalid.
pub(crate) fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Top-level configuration for the ingestion process.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_path: String,
    pub provider: ProviderConfig,
    pub token: TokenConfig,
    pub retry: RetryPolicy,
    pub backfill: BackfillConfig,
    pub incremental: IncrementalConfig,
}

impl IngestConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            env_string("TELEMETRY_DB_PATH").unwrap_or_else(|| "./telemetry.db".to_string());

        Ok(Self {
            database_path,
            provider: ProviderConfig::from_env()?,
            token: TokenConfig::from_env(),
            retry: RetryPolicy::from_env(),
            backfill: BackfillConfig::from_env(),
            incremental: IncrementalConfig::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back() {
        std::env::set_var("TELEMETRY_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or::<u32>("TELEMETRY_TEST_ENV_OR", 7), 7);
        std::env::set_var("TELEMETRY_TEST_ENV_OR", " 42 ");
        assert_eq!(env_or::<u32>("TELEMETRY_TEST_ENV_OR", 7), 42);
        std::env::remove_var("TELEMETRY_TEST_ENV_OR");
        assert_eq!(env_or::<u32>("TELEMETRY_TEST_ENV_OR", 7), 7);
    }

    #[test]
    fn test_env_string_ignores_blank() {
        std::env::set_var("TELEMETRY_TEST_ENV_STRING", "   ");
        assert!(env_string("TELEMETRY_TEST_ENV_STRING").is_none());
        std::env::remove_var("TELEMETRY_TEST_ENV_STRING");
    }
}
