use crate::error::{Result, SpyglassError};
use std::env;
use std::path::PathBuf;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Logging configuration
    pub log: LogConfig,
}

/// Mode applied to every CONNECT tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Opaque byte-level passthrough
    Normal,
    /// Terminate client TLS with a forged certificate and inspect the inner traffic
    Mitm,
}

impl ProxyMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "normal" => Some(ProxyMode::Normal),
            "mitm" => Some(ProxyMode::Mitm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Normal => "normal",
            ProxyMode::Mitm => "mitm",
        }
    }
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy server (default: 8000)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Tunnel mode applied to every CONNECT (default: normal)
    pub mode: ProxyMode,
    /// Upstream dial timeout in seconds
    pub connect_timeout: u64,
    /// Timeout in seconds waiting for upstream response headers
    pub request_timeout: u64,
    /// Client-facing TLS handshake timeout in seconds (MITM only)
    pub handshake_timeout: u64,
    /// Directory holding (or receiving) the root CA certificate and key (MITM only)
    pub ca_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mode_raw = get_env_or("PROXY_MODE", "normal");
        let mode = ProxyMode::parse(&mode_raw).ok_or_else(|| {
            SpyglassError::InvalidConfig(format!(
                "PROXY_MODE must be 'normal' or 'mitm', got '{}'",
                mode_raw
            ))
        })?;

        Ok(Config {
            proxy: ProxyServerConfig {
                port: get_env_or("PROXY_PORT", "8000").parse().map_err(|_| {
                    SpyglassError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
                mode,
                connect_timeout: get_env_or("PROXY_CONNECT_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                request_timeout: get_env_or("PROXY_REQUEST_TIMEOUT", "30")
                    .parse()
                    .unwrap_or(30),
                handshake_timeout: get_env_or("PROXY_HANDSHAKE_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                ca_dir: PathBuf::from(get_env_or("SPYGLASS_CA_DIR", ".spyglass")),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the proxy server bind address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "PROXY_PORT",
        "PROXY_HOST",
        "PROXY_MODE",
        "PROXY_CONNECT_TIMEOUT",
        "PROXY_REQUEST_TIMEOUT",
        "PROXY_HANDSHAKE_TIMEOUT",
        "SPYGLASS_CA_DIR",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.proxy.port, 8000);
        assert_eq!(config.proxy.host, "0.0.0.0");
        assert_eq!(config.proxy.mode, ProxyMode::Normal);
        assert_eq!(config.proxy.connect_timeout, 10);
        assert_eq!(config.proxy.request_timeout, 30);
        assert_eq!(config.proxy.ca_dir, PathBuf::from(".spyglass"));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_PORT", "9000");
        env::set_var("PROXY_HOST", "127.0.0.1");
        env::set_var("PROXY_MODE", "mitm");
        env::set_var("PROXY_CONNECT_TIMEOUT", "5");
        env::set_var("SPYGLASS_CA_DIR", "/var/lib/spyglass");
        env::set_var("LOG_FORMAT", "json");

        let config = Config::from_env().unwrap();

        assert_eq!(config.proxy.port, 9000);
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(config.proxy.mode, ProxyMode::Mitm);
        assert_eq!(config.proxy.connect_timeout, 5);
        assert_eq!(config.proxy.ca_dir, PathBuf::from("/var/lib/spyglass"));
        assert_eq!(config.log.format, "json");
        assert_eq!(config.proxy_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_config_from_env_invalid_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, SpyglassError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_invalid_mode() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_MODE", "transparent");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, SpyglassError::InvalidConfig(_)));
    }

    #[test]
    fn test_proxy_mode_parse_roundtrip() {
        assert_eq!(ProxyMode::parse("normal"), Some(ProxyMode::Normal));
        assert_eq!(ProxyMode::parse("MITM"), Some(ProxyMode::Mitm));
        assert_eq!(ProxyMode::parse("socks"), None);
        assert_eq!(ProxyMode::Mitm.to_string(), "mitm");
    }
}
