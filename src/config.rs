use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::tenant::TenantSettings;

/// Session-change approval server speaking the PostgreSQL wire protocol.
#[derive(Parser, Debug, Clone)]
#[command(name = "tutorflow")]
#[command(version)]
pub struct Config {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0", env = "TUTORFLOW_BIND")]
    pub bind: String,

    #[arg(long, default_value_t = 5434, env = "TUTORFLOW_PORT")]
    pub port: u16,

    /// Directory holding one journal per tenant
    #[arg(long, default_value = "./data", env = "TUTORFLOW_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Shared cleartext password
    #[arg(long, default_value = "tutorflow", env = "TUTORFLOW_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(long, default_value_t = 256, env = "TUTORFLOW_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// Journal appends before a tenant journal is compacted
    #[arg(long, default_value_t = 1000, env = "TUTORFLOW_COMPACT_THRESHOLD")]
    pub compact_threshold: u64,

    /// Period of the overdue-request sweep
    #[arg(long, default_value_t = 30, env = "TUTORFLOW_ESCALATION_INTERVAL_SECS")]
    pub escalation_interval_secs: u64,

    /// Bound on one journal write
    #[arg(long, default_value_t = 5000, env = "TUTORFLOW_JOURNAL_TIMEOUT_MS")]
    pub journal_timeout_ms: u64,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "TUTORFLOW_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    #[arg(long, env = "TUTORFLOW_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "TUTORFLOW_TLS_KEY")]
    pub tls_key: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--tls-cert and --tls-key must be given together")]
    TlsPair,
    #[error("{0} must be positive")]
    NotPositive(&'static str),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }
        let positive = [
            ("--max-connections", self.max_connections as u64),
            ("--compact-threshold", self.compact_threshold),
            ("--escalation-interval-secs", self.escalation_interval_secs),
            ("--journal-timeout-ms", self.journal_timeout_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::NotPositive(name));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tenant_settings(&self) -> TenantSettings {
        TenantSettings {
            compact_threshold: self.compact_threshold,
            escalation_interval: Duration::from_secs(self.escalation_interval_secs),
            journal_timeout: Duration::from_millis(self.journal_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("tutorflow").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.listen_addr(), "0.0.0.0:5434");
        assert_eq!(config.validate(), Ok(()));
        let settings = config.tenant_settings();
        assert_eq!(settings.compact_threshold, 1000);
        assert_eq!(settings.escalation_interval, Duration::from_secs(30));
        assert_eq!(settings.journal_timeout, Duration::from_secs(5));
    }

    #[test]
    fn tls_flags_come_in_pairs() {
        let config = parse(&["--tls-cert", "server.crt"]);
        assert_eq!(config.validate(), Err(ConfigError::TlsPair));
        let config = parse(&["--tls-cert", "server.crt", "--tls-key", "server.key"]);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn zero_thresholds_refused() {
        let config = parse(&["--compact-threshold", "0"]);
        assert_eq!(config.validate(), Err(ConfigError::NotPositive("--compact-threshold")));
        let config = parse(&["--journal-timeout-ms", "0"]);
        assert_eq!(config.validate(), Err(ConfigError::NotPositive("--journal-timeout-ms")));
    }
}
