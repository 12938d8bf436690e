use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub const SERVER_NAME: &str = env!("CARGO_PKG_NAME");
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub port: u16,
    pub address: String,
    pub id: Option<String>,
    /// Default virtual-host label; required.
    pub default: String,
    /// Global document root; vhost roots are resolved under it.
    pub root: PathBuf,
    pub vhosts: HashMap<String, String>,
    /// Side-file directory; falls back to the OS temp dir.
    pub tmp: Option<PathBuf>,
    pub index: Vec<String>,
    /// Default response headers; keys are lowercased at load.
    pub headers: HashMap<String, String>,
    pub compress: bool,
    /// Default JSON indentation when the client does not ask for one.
    pub json: usize,
    /// Maximum request body size in bytes; 0 disables the limit.
    pub max_bytes: u64,
    pub ssl: SslConfig,
    pub proxy: ProxySettings,
    pub logs: LogsConfig,
    /// Seed for the validator hash.
    pub seed: u32,
    /// Drop privileges to this uid after binding (unix only).
    pub uid: Option<u32>,
    /// Emit a terminal error page for uncaught route failures.
    pub catch_all: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SslConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl SslConfig {
    pub fn enabled(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    /// Content-type regex sources joined with `|` into the rewrite test.
    pub rewrite: Vec<String>,
    /// Keep-alive pool size for the upstream HTTP(S) client.
    pub max_connections: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            rewrite: vec!["application/json".to_string(), "text/".to_string()],
            max_connections: 125,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogsConfig {
    pub level: String,
    pub stdout: bool,
    /// Recognized for compatibility; probe emission is not wired in.
    pub dtrace: bool,
    pub format: String,
    pub time: String,
    pub file: Option<PathBuf>,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stdout: true,
            dtrace: false,
            format: "%v %h %l %u %t \"%r\" %>s %b \"%{Referer}i\" \"%{User-agent}i\""
                .to_string(),
            time: "%d/%b/%Y:%H:%M:%S %z".to_string(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            address: "0.0.0.0".to_string(),
            id: None,
            default: String::new(),
            root: PathBuf::from("."),
            vhosts: HashMap::new(),
            tmp: None,
            index: vec!["index.htm".to_string(), "index.html".to_string()],
            headers: HashMap::new(),
            compress: true,
            json: 0,
            max_bytes: 1_048_576,
            ssl: SslConfig::default(),
            proxy: ProxySettings::default(),
            logs: LogsConfig::default(),
            seed: 625,
            uid: None,
            catch_all: true,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Lowercase header keys and fill in the stock response headers.
    pub fn normalize(&mut self) {
        let mut headers: HashMap<String, String> = self
            .headers
            .drain()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();

        headers
            .entry("accept-ranges".to_string())
            .or_insert_with(|| "bytes".to_string());
        headers
            .entry("content-type".to_string())
            .or_insert_with(|| "text/html; charset=utf-8".to_string());
        headers.entry("server".to_string()).or_insert_with(|| {
            format!("{}/{}", SERVER_NAME, SERVER_VERSION)
        });
        headers
            .entry("x-powered-by".to_string())
            .or_insert_with(|| format!("{}/{}", SERVER_NAME, SERVER_VERSION));

        self.headers = headers;

        if self.tmp.is_none() {
            self.tmp = Some(std::env::temp_dir());
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.default.is_empty() {
            anyhow::bail!("A default virtual host label is required");
        }

        if self.default != "all" && !self.vhosts.contains_key(&self.default) {
            anyhow::bail!(
                "Default virtual host '{}' has no entry in vhosts",
                self.default
            );
        }

        if self.ssl.cert.is_some() != self.ssl.key.is_some() {
            anyhow::bail!("ssl.cert and ssl.key must be configured together");
        }

        for (label, root) in &self.vhosts {
            if label.is_empty() {
                anyhow::bail!("Virtual host labels cannot be empty");
            }
            if PathBuf::from(root).is_absolute() {
                anyhow::bail!(
                    "Virtual host '{}' root must be relative to the global root",
                    label
                );
            }
        }

        Ok(())
    }

    /// Side-file directory, post-normalization.
    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Server banner used for `Server` / `Via` headers.
    pub fn banner(&self) -> String {
        self.headers
            .get("server")
            .cloned()
            .unwrap_or_else(|| format!("{}/{}", SERVER_NAME, SERVER_VERSION))
    }

    /// Document root for a vhost label.
    pub fn vhost_root(&self, label: &str) -> PathBuf {
        match self.vhosts.get(label) {
            Some(rel) => self.root.join(rel),
            None => self.root.clone(),
        }
    }
}
