//! Environment-driven configuration.

use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::domain::rules::{TierConfig, TierThreshold};
use crate::service::ServiceOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Postgres connection string; the in-memory store is used when unset.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub nats_url: Option<String>,
    pub log_level: String,
    pub audit_queue_capacity: usize,
    pub service: ServiceOptions,
    pub tiers: TierConfig,
}

/// Loads `.env` if present, then reads the process environment.
pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();
    build_app_config(|key| std::env::var(key))
}

/// Parses configuration through `lookup` so tests never touch the real environment.
pub fn build_app_config<F>(lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let optional = |var: &str| lookup(var).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let invalid = |var: &str, reason: String| ConfigError::InvalidEnvVar { var: var.to_string(), reason };

    fn parse<T: std::str::FromStr>(raw: Option<String>, default: T) -> Result<T, String>
    where
        T::Err: std::fmt::Display,
    {
        raw.map_or(Ok(default), |v| v.parse::<T>().map_err(|e| e.to_string()))
    }

    let bind_addr = parse(optional("BIND_ADDR"), SocketAddr::from(([0, 0, 0, 0], 8083))).map_err(|e| invalid("BIND_ADDR", e))?;
    let db_max_connections = parse(optional("DB_MAX_CONNECTIONS"), 10u32).map_err(|e| invalid("DB_MAX_CONNECTIONS", e))?;
    let timeout_ms = parse(optional("LOYALTY_STORE_TIMEOUT_MS"), 5_000u64).map_err(|e| invalid("LOYALTY_STORE_TIMEOUT_MS", e))?;
    let max_conflict_retries = parse(optional("LOYALTY_MAX_CONFLICT_RETRIES"), 3u32).map_err(|e| invalid("LOYALTY_MAX_CONFLICT_RETRIES", e))?;
    let audit_queue_capacity = parse(optional("LOYALTY_AUDIT_QUEUE_CAPACITY"), 1_024usize).map_err(|e| invalid("LOYALTY_AUDIT_QUEUE_CAPACITY", e))?;
    let stream_capacity = parse(optional("LOYALTY_STREAM_CAPACITY"), 256usize).map_err(|e| invalid("LOYALTY_STREAM_CAPACITY", e))?;
    if timeout_ms == 0 {
        return Err(invalid("LOYALTY_STORE_TIMEOUT_MS", "must be greater than zero".into()));
    }

    let defaults = TierConfig::default();
    let earn_rate = parse(optional("LOYALTY_POINTS_PER_UNIT"), defaults.points_per_currency_unit())
        .map_err(|e| invalid("LOYALTY_POINTS_PER_UNIT", e))?;
    let thresholds = match optional("LOYALTY_TIERS") {
        Some(raw) => serde_json::from_str::<Vec<TierThreshold>>(&raw).map_err(|e| invalid("LOYALTY_TIERS", e.to_string()))?,
        None => defaults.thresholds().to_vec(),
    };
    let tiers = tier_config(thresholds, earn_rate).map_err(|e| invalid("LOYALTY_TIERS", e))?;

    Ok(AppConfig {
        bind_addr,
        database_url: optional("DATABASE_URL"),
        db_max_connections,
        nats_url: optional("NATS_URL"),
        log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        audit_queue_capacity,
        service: ServiceOptions { store_timeout: Duration::from_millis(timeout_ms), max_conflict_retries, stream_capacity },
        tiers,
    })
}

fn tier_config(thresholds: Vec<TierThreshold>, earn_rate: Decimal) -> Result<TierConfig, String> {
    TierConfig::new(thresholds, earn_rate).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rules::Tier;
    use std::collections::HashMap;

    fn build(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        build_app_config(|key| map.get(key).cloned().ok_or(std::env::VarError::NotPresent))
    }

    #[test]
    fn test_defaults() {
        let cfg = build(&[]).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8083);
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.service.store_timeout, Duration::from_secs(5));
        assert_eq!(cfg.service.max_conflict_retries, 3);
        assert_eq!(cfg.tiers, TierConfig::default());
    }

    #[test]
    fn test_custom_tiers() {
        let cfg = build(&[
            ("LOYALTY_TIERS", r#"[{"id":"bronze","minPoints":0},{"id":"gold","minPoints":300,"pointsMultiplier":"1.5"}]"#),
            ("LOYALTY_POINTS_PER_UNIT", "2"),
        ]).unwrap();
        assert_eq!(cfg.tiers.calculate_tier(300).tier, Tier::Gold);
        assert_eq!(cfg.tiers.points_for_purchase(Decimal::TEN, Tier::Gold), Ok(30));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(build(&[("BIND_ADDR", "nope")]), Err(ConfigError::InvalidEnvVar { var, .. }) if var == "BIND_ADDR"));
        assert!(build(&[("LOYALTY_STORE_TIMEOUT_MS", "0")]).is_err());
        assert!(build(&[("LOYALTY_TIERS", r#"[{"id":"silver","minPoints":10}]"#)]).is_err());
    }

    #[test]
    fn test_blank_database_url_is_unset() {
        assert!(build(&[("DATABASE_URL", "  ")]).unwrap().database_url.is_none());
    }
}
