//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix for structured configuration
pub const ENV_PREFIX: &str = "CERT_PROXY_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Upstream certificate API
    pub upstream: UpstreamConfig,
    /// Certificate cache
    pub cache: CacheConfig,
    /// Fetch coordinator limits
    pub coordinator: CoordinatorConfig,
    /// Static frontend
    pub frontend: FrontendConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Serve HTTPS when set
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            shutdown_timeout: Duration::from_secs(30),
            tls: None,
        }
    }
}

/// PEM certificate and key for HTTPS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate chain (PEM)
    pub cert_path: PathBuf,
    /// Private key (PEM)
    pub key_path: PathBuf,
}

/// Upstream certificate API
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Endpoint queried with `controlNumber` and `secret`
    pub url: String,
    /// Shared secret sent with every request.
    /// Supports `${VAR}` and `${VAR:-default}` expansion.
    pub secret: String,
    /// Total budget for one upstream call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret: String::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

// Keeps the secret out of `{:?}` output and therefore out of logs.
impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("url", &self.url)
            .field("secret", &if self.secret.is_empty() { "" } else { "***" })
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Certificate cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time after which an entry is treated as absent
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10 * 60),
            max_entries: 1000,
        }
    }
}

/// Fetch coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum number of outstanding upstream calls
    pub concurrency: usize,
    /// Maximum number of fetches waiting for a free slot
    pub queue_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 15,
            queue_limit: 1024,
        }
    }
}

/// Static frontend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Serve the frontend and static assets
    pub enabled: bool,
    /// Directory holding `index.html`, error pages and assets
    pub static_dir: PathBuf,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            static_dir: PathBuf::from("public"),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or the resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
        }

        // A `.env` in the working directory is honoured like any listed env file
        if dotenvy::dotenv().is_ok() {
            tracing::debug!("Loaded .env from working directory");
        }

        let mut figment = Self::figment(path);
        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Listed env files may carry `CERT_PROXY_*` keys, so read the
        // environment layer again once they are loaded
        if config.load_env_files() > 0 {
            figment = Self::figment(path);
            config = figment
                .extract()
                .map_err(|e| Error::Config(e.to_string()))?;
        }

        let port_configured = figment.find_value("server.port").is_ok();
        config.apply_legacy_env(|name| env::var(name).ok(), port_configured);
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// YAML file (when given) overlaid with `CERT_PROXY_*` environment variables
    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new();
        if let Some(p) = path {
            figment = figment.merge(Yaml::file(p));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    /// Returns how many files were loaded.
    fn load_env_files(&self) -> usize {
        let mut loaded = 0;
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                        loaded += 1;
                    }
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
        loaded
    }

    /// Fill unset values from the variable names used by older deployments
    /// (`GAS_API_URL`, `GAS_SECRET_KEY`, `PORT`).
    ///
    /// `port_configured` is whether `server.port` was set explicitly, in
    /// which case `PORT` is ignored even if the value equals the default.
    fn apply_legacy_env<F>(&mut self, lookup: F, port_configured: bool)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.upstream.url.is_empty() {
            if let Some(url) = lookup("GAS_API_URL") {
                self.upstream.url = url;
            }
        }
        if self.upstream.secret.is_empty() {
            if let Some(secret) = lookup("GAS_SECRET_KEY") {
                self.upstream.secret = secret;
            }
        }
        if !port_configured {
            if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
                self.server.port = port;
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in upstream settings
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var pattern is valid");

        self.upstream.url = Self::expand_string(&re, &self.upstream.url);
        self.upstream.secret = Self::expand_string(&re, &self.upstream.secret);
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Check that the configuration can run a proxy
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.url.is_empty() {
            return Err(Error::Config(
                "upstream.url is required (or set GAS_API_URL)".to_string(),
            ));
        }
        let url = url::Url::parse(&self.upstream.url)
            .map_err(|e| Error::Config(format!("Invalid upstream.url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Unsupported upstream.url scheme: {}",
                url.scheme()
            )));
        }
        if self.upstream.timeout.is_zero() {
            return Err(Error::Config("upstream.timeout must be positive".to_string()));
        }
        if self.coordinator.concurrency == 0 {
            return Err(Error::Config(
                "coordinator.concurrency must be at least 1".to_string(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(Error::Config(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "100ms", "1h" or a bare number of seconds
    pub(crate) fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        let (amount, secs_per_unit) = if let Some(ms) = s.strip_suffix("ms") {
            let ms = ms
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration {s:?}: {e}"))?;
            return Ok(Duration::from_millis(ms));
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };

        let amount = amount
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration {s:?}: {e}"))?;
        amount
            .checked_mul(secs_per_unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {s:?} is too large"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.upstream.url = "https://script.example.com/exec".to_string();
        config.upstream.secret = "s3cret".to_string();
        config
    }

    #[test]
    fn test_defaults_match_service_constants() {
        let config = Config::default();
        assert_eq!(config.cache.ttl, Duration::from_secs(600));
        assert_eq!(config.cache.max_entries, 1000);
        assert_eq!(config.coordinator.concurrency, 15);
        assert_eq!(config.upstream.timeout, Duration::from_secs(5));
        assert_eq!(config.server.port, 3000);
        assert!(config.server.tls.is_none());
    }

    #[test]
    fn test_yaml_with_durations() {
        let yaml = r#"
server:
  port: 8443
  tls:
    cert_path: cert/cert.pem
    key_path: cert/key.pem
upstream:
  url: "https://script.example.com/exec"
  timeout: "250ms"
cache:
  ttl: "2m"
  max_entries: 50
coordinator:
  concurrency: 4
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(
            config.server.tls.as_ref().unwrap().cert_path,
            PathBuf::from("cert/cert.pem")
        );
        assert_eq!(config.upstream.timeout, Duration::from_millis(250));
        assert_eq!(config.cache.ttl, Duration::from_secs(120));
        assert_eq!(config.cache.max_entries, 50);
        assert_eq!(config.coordinator.concurrency, 4);
        // Unset sections keep their defaults
        assert_eq!(config.coordinator.queue_limit, 1024);
        assert!(config.frontend.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "upstream:\n  url: \"http://127.0.0.1:9/exec\"\n  secret: abc").unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.upstream.url, "http://127.0.0.1:9/exec");
        assert_eq!(config.upstream.secret, "abc");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/proxy.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("not found")));
    }

    #[test]
    fn test_legacy_env_fills_unset_values() {
        let vars: HashMap<&str, &str> = [
            ("GAS_API_URL", "https://legacy.example.com/exec"),
            ("GAS_SECRET_KEY", "legacy-secret"),
            ("PORT", "4000"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_legacy_env(|name| vars.get(name).map(ToString::to_string), false);

        assert_eq!(config.upstream.url, "https://legacy.example.com/exec");
        assert_eq!(config.upstream.secret, "legacy-secret");
        assert_eq!(config.server.port, 4000);
    }

    #[test]
    fn test_legacy_env_does_not_override_explicit_values() {
        let mut config = valid_config();
        config.server.port = 9000;
        config.apply_legacy_env(|_| Some("https://legacy.example.com".to_string()), true);

        assert_eq!(config.upstream.url, "https://script.example.com/exec");
        assert_eq!(config.upstream.secret, "s3cret");
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_explicit_default_port_beats_legacy_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.yaml");
        std::fs::write(&path, "server:\n  port: 3000\n").unwrap();

        let port_configured = Config::figment(Some(&path))
            .find_value("server.port")
            .is_ok();
        assert!(port_configured);

        let mut config = Config::default();
        config.apply_legacy_env(|_| Some("4000".to_string()), port_configured);
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_env_file_feeds_prefixed_environment() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("proxy.env");
        std::fs::write(
            &env_path,
            "CERT_PROXY_UPSTREAM__URL=http://127.0.0.1:9/exec\n",
        )
        .unwrap();
        let path = dir.path().join("proxy.yaml");
        std::fs::write(
            &path,
            format!(
                "env_files:\n  - \"{}\"\nupstream:\n  secret: abc\n",
                env_path.display()
            ),
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.upstream.url, "http://127.0.0.1:9/exec");
        assert_eq!(config.upstream.secret, "abc");
    }

    #[test]
    fn test_expand_string_uses_default() {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        let expanded = Config::expand_string(&re, "${CERT_PROXY_TEST_UNSET_VAR:-fallback}");
        assert_eq!(expanded, "fallback");
    }

    #[test]
    fn test_validate() {
        assert!(valid_config().validate().is_ok());

        let mut config = valid_config();
        config.upstream.url = String::new();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.upstream.url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.coordinator.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.cache.max_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = valid_config();
        let printed = format!("{:?}", config.upstream);
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(humantime_serde::parse("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(humantime_serde::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(humantime_serde::parse("7").unwrap(), Duration::from_secs(7));
        assert!(humantime_serde::parse("soon").is_err());
        assert!(humantime_serde::parse("99999999999999999h").is_err());
        assert!(humantime_serde::parse("999999999999999999m").is_err());
        assert!(humantime_serde::parse("18446744073709551615s").is_ok());
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }
}
