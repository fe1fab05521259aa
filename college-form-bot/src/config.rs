use anyhow::{Context, Result, bail};
use form_flow::{EngineConfig, FileCarryOver, InMemoryOutbox, RetryPolicy};
use std::path::PathBuf;
use std::time::Duration;

/// Service settings read from the environment
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    /// PostgreSQL stores when set, in-memory otherwise
    pub database_url: Option<String>,
    pub upload_dir: PathBuf,
    /// YAML catalog seed
    pub catalog_path: PathBuf,
    pub session_ttl: Option<Duration>,
    pub file_carry_over: FileCarryOver,
    pub purge_interval: Duration,
    /// Prompts kept per owner until `GET /outbox` drains them
    pub outbox_capacity: usize,
    /// `pretty` for development, JSON otherwise
    pub log_format: String,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port: u16 = match lookup("PORT") {
            Some(port) => port.parse().with_context(|| format!("invalid PORT: {port}"))?,
            None => 3000,
        };
        let session_ttl = lookup("SESSION_TTL_SECS")
            .map(|secs| parse_secs("SESSION_TTL_SECS", &secs))
            .transpose()?;
        let purge_interval = match lookup("PURGE_INTERVAL_SECS") {
            Some(secs) => parse_secs("PURGE_INTERVAL_SECS", &secs)?,
            None => Duration::from_secs(300),
        };
        if purge_interval.is_zero() {
            bail!("PURGE_INTERVAL_SECS must be greater than zero");
        }
        let outbox_capacity: usize = match lookup("OUTBOX_CAPACITY") {
            Some(cap) => cap
                .parse()
                .with_context(|| format!("invalid OUTBOX_CAPACITY: {cap}"))?,
            None => InMemoryOutbox::DEFAULT_CAPACITY,
        };
        if outbox_capacity == 0 {
            bail!("OUTBOX_CAPACITY must be greater than zero");
        }
        let file_carry_over = match lookup("FILE_CARRY_OVER").as_deref() {
            None | Some("empty") => FileCarryOver::StartEmpty,
            Some("copy") => FileCarryOver::CopyPrevious,
            Some(other) => bail!("FILE_CARRY_OVER must be `copy` or `empty`, got `{other}`"),
        };

        Ok(Self {
            port,
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            upload_dir: lookup("UPLOAD_DIR").unwrap_or_else(|| "uploads".to_string()).into(),
            catalog_path: lookup("CATALOG_PATH")
                .unwrap_or_else(|| "config/catalog.yaml".to_string())
                .into(),
            session_ttl,
            file_carry_over,
            purge_interval,
            outbox_capacity,
            log_format: lookup("LOG_FORMAT").unwrap_or_else(|| "json".to_string()),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            file_carry_over: self.file_carry_over,
            session_ttl: self.session_ttl,
            retry: RetryPolicy::default(),
        }
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    let secs: u64 = value
        .parse()
        .with_context(|| format!("invalid {key}: {value}"))?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.database_url.is_none());
        assert_eq!(config.session_ttl, None);
        assert_eq!(config.file_carry_over, FileCarryOver::StartEmpty);
        assert_eq!(config.purge_interval, Duration::from_secs(300));
        assert_eq!(config.outbox_capacity, InMemoryOutbox::DEFAULT_CAPACITY);
        assert_eq!(config.catalog_path, PathBuf::from("config/catalog.yaml"));
        assert_eq!(config.log_format, "json");
    }

    #[test]
    fn test_overrides() {
        let config = ServiceConfig::from_lookup(lookup_from(&[
            ("PORT", "8080"),
            ("DATABASE_URL", "postgres://bot@localhost/college"),
            ("SESSION_TTL_SECS", "3600"),
            ("FILE_CARRY_OVER", "copy"),
            ("LOG_FORMAT", "pretty"),
        ]))
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.session_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(config.engine_config().file_carry_over, FileCarryOver::CopyPrevious);
        assert_eq!(config.log_format, "pretty");
    }

    #[test]
    fn test_bad_values_are_rejected() {
        assert!(ServiceConfig::from_lookup(lookup_from(&[("FILE_CARRY_OVER", "always")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup_from(&[("SESSION_TTL_SECS", "soon")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup_from(&[("PURGE_INTERVAL_SECS", "0")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup_from(&[("OUTBOX_CAPACITY", "0")])).is_err());
    }
}
