use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Media engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Number of media workers (0 = one per CPU core)
    pub num_workers: usize,
    /// IP advertised in ICE candidates
    pub announced_ip: String,
    /// First UDP port advertised in ICE candidates; each transport gets the
    /// next port in sequence
    pub rtc_port_min: u16,
    /// Last UDP port advertised in ICE candidates
    pub rtc_port_max: u16,
    /// Transports with no activity for this long are reaped
    pub transport_idle_timeout_secs: u64,
    /// How often each worker sweeps its transports for idleness
    pub sweep_interval_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            announced_ip: "127.0.0.1".to_string(),
            rtc_port_min: 40000,
            rtc_port_max: 49999,
            transport_idle_timeout_secs: 60,
            sweep_interval_secs: 15,
        }
    }
}

/// Access-token validation configuration
///
/// Tokens are minted by the application layer with the same shared secret;
/// this service only validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_secret: String,
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: String::new(),
            token_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (SHOPSTREAM_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("SHOPSTREAM")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Fail-fast misconfiguration check, run once at startup.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.auth.token_secret.is_empty() {
            errors.push("auth.token_secret must be set".to_string());
        }
        if self.media.rtc_port_min >= self.media.rtc_port_max {
            errors.push(format!(
                "media.rtc_port_min ({}) must be below media.rtc_port_max ({})",
                self.media.rtc_port_min, self.media.rtc_port_max
            ));
        }
        if self.media.transport_idle_timeout_secs == 0 {
            errors.push("media.transport_idle_timeout_secs must be non-zero".to_string());
        }
        if self.media.sweep_interval_secs == 0 {
            errors.push("media.sweep_interval_secs must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Effective worker count (0 resolves to the number of CPU cores)
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.media.num_workers > 0 {
            self.media.num_workers
        } else {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http_address(), "0.0.0.0:8080");
        assert_eq!(config.media.transport_idle_timeout_secs, 60);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_validate_rejects_missing_secret() {
        let config = Config::default();
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("token_secret")));
    }

    #[test]
    fn test_validate_rejects_inverted_port_range() {
        let mut config = Config::default();
        config.auth.token_secret = "secret".to_string();
        config.media.rtc_port_min = 50000;
        config.media.rtc_port_max = 40000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("create temp config");
        writeln!(
            file,
            "[server]\nhttp_port = 9090\n\n[media]\nnum_workers = 2\n"
        )
        .expect("write temp config");

        let config = Config::load(file.path().to_str()).expect("load config");
        assert_eq!(config.server.http_port, 9090);
        assert_eq!(config.worker_count(), 2);
    }
}
