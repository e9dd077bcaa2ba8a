use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process configuration, read once from `RESERVD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Shared registration password for accounts that have not set their own.
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    /// Bootstrap account that is always elevated.
    pub root_user: String,
    /// Sets the bootstrap account's password. Required until one is stored.
    pub root_password: Option<String>,
    /// Register unknown usernames as ordinary accounts on first connection.
    pub auto_register: bool,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "reservd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            root_user: "root".into(),
            root_password: None,
            auto_register: true,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            bind: get("RESERVD_BIND").unwrap_or(defaults.bind),
            port: parse_var(&get, "RESERVD_PORT").unwrap_or(defaults.port),
            data_dir: get("RESERVD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: get("RESERVD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&get, "RESERVD_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&get, "RESERVD_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            sweep_interval: parse_var(&get, "RESERVD_SWEEP_INTERVAL_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            root_user: get("RESERVD_ROOT_USER")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.root_user),
            root_password: get("RESERVD_ROOT_PASSWORD").filter(|s| !s.is_empty()),
            auto_register: parse_var(&get, "RESERVD_AUTO_REGISTER")
                .unwrap_or(defaults.auto_register),
            tls_cert: get("RESERVD_TLS_CERT"),
            tls_key: get("RESERVD_TLS_KEY"),
            metrics_port: parse_var(&get, "RESERVD_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservd.wal")
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}
