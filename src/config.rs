//! Layered configuration: built-in defaults, then the TOML file, then
//! environment variables and command-line flags (the binary's clap layer
//! feeds both through [`Overrides`]).
//!
//! `RawConfig` mirrors the file format with every field optional;
//! `finalize()` applies defaults, validates, and produces the flat [`Config`]
//! the rest of the crate consumes.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("could not parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/health";
pub const DEFAULT_INFO_PATH: &str = "/info";
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_BACKEND_REQUEST_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_EWMA_ALPHA: f64 = 0.15;
pub const DEFAULT_BACKENDS: [&str; 2] = ["http://localhost:9091", "http://localhost:9092"];

/// The selection algorithm requested in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RoundRobin,
    LeastConnections,
    LeastResponseTime,
    WeightedRoundRobin,
}

impl Algorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "round-robin" => Some(Self::RoundRobin),
            "least-connections" => Some(Self::LeastConnections),
            "least-response-time" => Some(Self::LeastResponseTime),
            "weighted-round-robin" => Some(Self::WeightedRoundRobin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::LeastResponseTime => "least-response-time",
            Self::WeightedRoundRobin => "weighted-round-robin",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawConfig {
    pub server: Option<ServerSection>,
    pub balancer: Option<BalancerSection>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerSection {
    pub bind_addr: Option<String>,
    pub access_log: Option<bool>,
    pub access_log_payloads: Option<bool>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BalancerSection {
    pub backends: Option<Vec<String>>,
    pub weights: Option<Vec<u32>>,
    pub health_check_path: Option<String>,
    pub info_path: Option<String>,
    pub health_check_interval_secs: Option<u64>,
    pub backend_request_timeout_ms: Option<u64>,
    pub algorithm: Option<String>,
    pub ewma_alpha: Option<f64>,
}

/// Values the CLI/env layer places on top of the file. `None` leaves the
/// lower layer untouched.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub bind_addr: Option<String>,
    pub backends: Option<Vec<String>>,
    pub weights: Option<Vec<u32>>,
    pub health_check_path: Option<String>,
    pub info_path: Option<String>,
    pub health_check_interval_secs: Option<u64>,
    pub backend_request_timeout_ms: Option<u64>,
    pub algorithm: Option<String>,
    pub ewma_alpha: Option<f64>,
    pub access_log: Option<bool>,
    pub access_log_payloads: Option<bool>,
}

/// One configured upstream: its parsed URL plus the weight the weighted
/// strategy will schedule it with.
#[derive(Debug, Clone)]
pub struct BackendEntry {
    pub url: Url,
    pub weight: u32,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub backends: Vec<BackendEntry>,
    pub health_check_path: String,
    pub info_path: String,
    pub health_check_interval: Duration,
    pub backend_request_timeout: Duration,
    pub algorithm: Algorithm,
    pub ewma_alpha: f64,
    pub access_log: bool,
    pub access_log_payloads: bool,
}

impl RawConfig {
    /// Reads the TOML file at `path`. A missing file is not an error: the
    /// defaults (plus env/flag overrides) are a complete configuration.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let cfg = toml::from_str::<RawConfig>(&raw)
                    .map_err(|source| ConfigError::Parse { path: path.to_string(), source })?;
                info!(path, "loaded config file");
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path, "no config file found, using defaults");
                Ok(RawConfig::default())
            }
            Err(source) => Err(ConfigError::Read { path: path.to_string(), source }),
        }
    }

    /// Places the CLI/env layer on top of whatever the file provided.
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        let server = self.server.get_or_insert_with(ServerSection::default);
        if overrides.bind_addr.is_some() {
            server.bind_addr = overrides.bind_addr;
        }
        if overrides.access_log.is_some() {
            server.access_log = overrides.access_log;
        }
        if overrides.access_log_payloads.is_some() {
            server.access_log_payloads = overrides.access_log_payloads;
        }

        let balancer = self.balancer.get_or_insert_with(BalancerSection::default);
        if overrides.backends.is_some() {
            balancer.backends = overrides.backends;
        }
        if overrides.weights.is_some() {
            balancer.weights = overrides.weights;
        }
        if overrides.health_check_path.is_some() {
            balancer.health_check_path = overrides.health_check_path;
        }
        if overrides.info_path.is_some() {
            balancer.info_path = overrides.info_path;
        }
        if overrides.health_check_interval_secs.is_some() {
            balancer.health_check_interval_secs = overrides.health_check_interval_secs;
        }
        if overrides.backend_request_timeout_ms.is_some() {
            balancer.backend_request_timeout_ms = overrides.backend_request_timeout_ms;
        }
        if overrides.algorithm.is_some() {
            balancer.algorithm = overrides.algorithm;
        }
        if overrides.ewma_alpha.is_some() {
            balancer.ewma_alpha = overrides.ewma_alpha;
        }
    }

    /// Applies defaults and validates. Soft problems (unknown algorithm, bad
    /// alpha, weight count mismatch, an unparseable backend URL among valid
    /// ones) warn and fall back; an empty backend set is fatal.
    pub fn finalize(self) -> Result<Config, ConfigError> {
        let server = self.server.unwrap_or_default();
        let balancer = self.balancer.unwrap_or_default();

        let bind_addr = server.bind_addr.unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let algorithm_name =
            balancer.algorithm.unwrap_or_else(|| Algorithm::RoundRobin.as_str().to_string());
        let algorithm = Algorithm::from_name(&algorithm_name).unwrap_or_else(|| {
            warn!(algorithm = %algorithm_name, "unknown load balancing algorithm, falling back to round-robin");
            Algorithm::RoundRobin
        });

        let mut ewma_alpha = balancer.ewma_alpha.unwrap_or(DEFAULT_EWMA_ALPHA);
        if ewma_alpha <= 0.0 || ewma_alpha > 1.0 {
            warn!(
                alpha = ewma_alpha,
                fallback = DEFAULT_EWMA_ALPHA,
                "EWMA alpha outside (0, 1], using default"
            );
            ewma_alpha = DEFAULT_EWMA_ALPHA;
        }

        let backend_urls = balancer
            .backends
            .unwrap_or_else(|| DEFAULT_BACKENDS.iter().map(|s| s.to_string()).collect());

        let weights = balancer.weights.unwrap_or_default();
        let use_weights = algorithm == Algorithm::WeightedRoundRobin
            && !weights.is_empty()
            && weights.len() == backend_urls.len();
        if algorithm == Algorithm::WeightedRoundRobin
            && !weights.is_empty()
            && weights.len() != backend_urls.len()
        {
            warn!(
                backends = backend_urls.len(),
                weights = weights.len(),
                "backend/weight count mismatch, all weights default to 1"
            );
        }

        let mut backends = Vec::with_capacity(backend_urls.len());
        for (index, raw_url) in backend_urls.iter().enumerate() {
            let trimmed = raw_url.trim();
            if trimmed.is_empty() {
                continue;
            }
            match Url::parse(trimmed) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                    let weight = if use_weights { weights[index] } else { 1 };
                    backends.push(BackendEntry { url, weight });
                }
                Ok(url) => {
                    warn!(url = %url, "skipping backend with unsupported scheme");
                }
                Err(e) => {
                    warn!(url = %trimmed, error = %e, "skipping unparseable backend URL");
                }
            }
        }

        if backends.is_empty() {
            return Err(ConfigError::Invalid("no valid backend servers configured".to_string()));
        }

        Ok(Config {
            bind_addr,
            backends,
            health_check_path: balancer
                .health_check_path
                .unwrap_or_else(|| DEFAULT_HEALTH_CHECK_PATH.to_string()),
            info_path: balancer.info_path.unwrap_or_else(|| DEFAULT_INFO_PATH.to_string()),
            health_check_interval: Duration::from_secs(
                balancer.health_check_interval_secs.unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            ),
            backend_request_timeout: Duration::from_millis(
                balancer
                    .backend_request_timeout_ms
                    .unwrap_or(DEFAULT_BACKEND_REQUEST_TIMEOUT_MS),
            ),
            algorithm,
            ewma_alpha,
            access_log: server.access_log.unwrap_or(false),
            access_log_payloads: server.access_log_payloads.unwrap_or(false),
        })
    }
}

#[cfg(test)]
impl Config {
    /// A minimal valid configuration for unit tests.
    pub fn for_tests() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            backends: Vec::new(),
            health_check_path: DEFAULT_HEALTH_CHECK_PATH.to_string(),
            info_path: DEFAULT_INFO_PATH.to_string(),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            backend_request_timeout: Duration::from_millis(DEFAULT_BACKEND_REQUEST_TIMEOUT_MS),
            algorithm: Algorithm::RoundRobin,
            ewma_alpha: DEFAULT_EWMA_ALPHA,
            access_log: false,
            access_log_payloads: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn missing_file_yields_defaults() {
        let raw = RawConfig::load("does-not-exist.toml").unwrap();
        let cfg = raw.finalize().unwrap();
        assert_eq!(cfg.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(cfg.algorithm, Algorithm::RoundRobin);
        assert_eq!(cfg.health_check_path, "/health");
        assert_eq!(cfg.info_path, "/info");
        assert_eq!(cfg.health_check_interval, Duration::from_secs(10));
        assert_eq!(cfg.backend_request_timeout, Duration::from_millis(2_000));
        assert_eq!(cfg.backends.len(), DEFAULT_BACKENDS.len());
        assert!(cfg.backends.iter().all(|b| b.weight == 1));
    }

    #[test]
    fn full_file_round_trips() {
        let file = write_config(
            r#"
            [server]
            bind_addr = "127.0.0.1:9000"
            access_log = true

            [balancer]
            backends = ["http://10.0.0.1:8081", "http://10.0.0.2:8082"]
            weights = [5, 1]
            health_check_path = "/healthz"
            info_path = "/about"
            health_check_interval_secs = 3
            backend_request_timeout_ms = 750
            algorithm = "weighted-round-robin"
            ewma_alpha = 0.3
            "#,
        );
        let cfg = RawConfig::load(file.path().to_str().unwrap()).unwrap().finalize().unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert!(cfg.access_log);
        assert!(!cfg.access_log_payloads);
        assert_eq!(cfg.algorithm, Algorithm::WeightedRoundRobin);
        assert_eq!(cfg.health_check_path, "/healthz");
        assert_eq!(cfg.info_path, "/about");
        assert_eq!(cfg.health_check_interval, Duration::from_secs(3));
        assert_eq!(cfg.backend_request_timeout, Duration::from_millis(750));
        assert_eq!(cfg.ewma_alpha, 0.3);
        let weights: Vec<u32> = cfg.backends.iter().map(|b| b.weight).collect();
        assert_eq!(weights, vec![5, 1]);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let file = write_config("[server]\nbind_addr = 12345");
        let result = RawConfig::load(file.path().to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn unknown_algorithm_falls_back_to_round_robin() {
        let file = write_config(
            r#"
            [balancer]
            backends = ["http://10.0.0.1:8081"]
            algorithm = "fastest-first"
            "#,
        );
        let cfg = RawConfig::load(file.path().to_str().unwrap()).unwrap().finalize().unwrap();
        assert_eq!(cfg.algorithm, Algorithm::RoundRobin);
    }

    #[test]
    fn invalid_alpha_falls_back_to_default() {
        for bad in ["-0.2", "0.0", "1.7"] {
            let file = write_config(&format!(
                "[balancer]\nbackends = [\"http://10.0.0.1:8081\"]\newma_alpha = {bad}\n"
            ));
            let cfg = RawConfig::load(file.path().to_str().unwrap()).unwrap().finalize().unwrap();
            assert_eq!(cfg.ewma_alpha, DEFAULT_EWMA_ALPHA);
        }
    }

    #[test]
    fn weight_count_mismatch_defaults_all_weights_to_one() {
        let file = write_config(
            r#"
            [balancer]
            backends = ["http://10.0.0.1:8081", "http://10.0.0.2:8082"]
            weights = [5]
            algorithm = "weighted-round-robin"
            "#,
        );
        let cfg = RawConfig::load(file.path().to_str().unwrap()).unwrap().finalize().unwrap();
        assert!(cfg.backends.iter().all(|b| b.weight == 1));
    }

    #[test]
    fn weights_are_ignored_for_non_weighted_algorithms() {
        let file = write_config(
            r#"
            [balancer]
            backends = ["http://10.0.0.1:8081", "http://10.0.0.2:8082"]
            weights = [5, 7]
            algorithm = "least-connections"
            "#,
        );
        let cfg = RawConfig::load(file.path().to_str().unwrap()).unwrap().finalize().unwrap();
        assert!(cfg.backends.iter().all(|b| b.weight == 1));
    }

    #[test]
    fn invalid_backend_urls_are_skipped() {
        let file = write_config(
            r#"
            [balancer]
            backends = ["not a url", "ftp://10.0.0.9:21", "http://10.0.0.1:8081", "  "]
            "#,
        );
        let cfg = RawConfig::load(file.path().to_str().unwrap()).unwrap().finalize().unwrap();
        assert_eq!(cfg.backends.len(), 1);
        assert_eq!(cfg.backends[0].url.as_str(), "http://10.0.0.1:8081/");
    }

    #[test]
    fn no_valid_backends_is_fatal() {
        let file = write_config("[balancer]\nbackends = []\n");
        let result = RawConfig::load(file.path().to_str().unwrap()).unwrap().finalize();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn overrides_take_precedence_over_file_values() {
        let file = write_config(
            r#"
            [server]
            bind_addr = "127.0.0.1:9000"

            [balancer]
            backends = ["http://10.0.0.1:8081"]
            algorithm = "least-connections"
            "#,
        );
        let mut raw = RawConfig::load(file.path().to_str().unwrap()).unwrap();
        raw.apply_overrides(Overrides {
            bind_addr: Some("127.0.0.1:9100".to_string()),
            backends: Some(vec!["http://10.9.9.9:8081".to_string()]),
            algorithm: Some("least-response-time".to_string()),
            ewma_alpha: Some(0.5),
            ..Overrides::default()
        });
        let cfg = raw.finalize().unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9100");
        assert_eq!(cfg.algorithm, Algorithm::LeastResponseTime);
        assert_eq!(cfg.ewma_alpha, 0.5);
        assert_eq!(cfg.backends[0].url.as_str(), "http://10.9.9.9:8081/");
    }

    #[test]
    fn overrides_on_top_of_defaults_need_no_file_sections() {
        let mut raw = RawConfig::default();
        raw.apply_overrides(Overrides {
            backends: Some(vec!["http://10.0.0.1:8081".to_string()]),
            access_log: Some(true),
            ..Overrides::default()
        });
        let cfg = raw.finalize().unwrap();
        assert!(cfg.access_log);
        assert_eq!(cfg.backends.len(), 1);
    }

    #[test]
    fn algorithm_names_parse_case_insensitively() {
        assert_eq!(Algorithm::from_name("Round-Robin"), Some(Algorithm::RoundRobin));
        assert_eq!(
            Algorithm::from_name(" weighted-round-robin "),
            Some(Algorithm::WeightedRoundRobin)
        );
        assert_eq!(Algorithm::from_name("bogus"), None);
    }
}
