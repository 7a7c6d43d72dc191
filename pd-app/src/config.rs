//! pdfdesk configuration loader.
//!
//! Every section is optional; a missing file yields the defaults. Environment
//! variables override file values.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PdfdeskConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Public base URL. When set, updates arrive by webhook instead of polling.
    #[serde(default)]
    pub webhook_base: Option<String>,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_webhook_path() -> String {
    "/tg/webhook".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            webhook_base: None,
            webhook_path: default_webhook_path(),
            webhook_secret: None,
        }
    }
}

impl TelegramConfig {
    pub fn webhook_url(&self) -> Option<String> {
        self.webhook_base.as_ref().map(|base| {
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                self.webhook_path.trim_start_matches('/')
            )
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_job_timeout_seconds")]
    pub job_timeout_seconds: u64,
    #[serde(default = "default_max_file_mb")]
    pub max_file_mb: u64,
    #[serde(default = "default_session_timeout_seconds")]
    pub session_timeout_seconds: u64,
    /// How often the inactivity reaper runs.
    #[serde(default = "default_expiry_interval_seconds")]
    pub expiry_interval_seconds: u64,
}

fn default_max_concurrent_jobs() -> usize {
    6
}

fn default_job_timeout_seconds() -> u64 {
    300
}

fn default_max_file_mb() -> u64 {
    50
}

fn default_session_timeout_seconds() -> u64 {
    900
}

fn default_expiry_interval_seconds() -> u64 {
    60
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_timeout_seconds: default_job_timeout_seconds(),
            max_file_mb: default_max_file_mb(),
            session_timeout_seconds: default_session_timeout_seconds(),
            expiry_interval_seconds: default_expiry_interval_seconds(),
        }
    }
}

impl LimitsConfig {
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Working directory for transient artifacts. Default: `<tmp>/pdfdesk`.
    #[serde(default)]
    pub temp_dir: Option<String>,
}

impl StorageConfig {
    pub fn work_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.temp_dir {
            Some(dir) => expand_home(dir),
            None => Ok(std::env::temp_dir().join("pdfdesk")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationsConfig {
    #[serde(default)]
    pub disabled: Vec<String>,
    #[serde(default)]
    pub enable_passthrough: bool,
    #[serde(default = "default_merge_max_inputs")]
    pub merge_max_inputs: usize,
    /// Per-operation timeout overrides in seconds.
    #[serde(default)]
    pub timeouts: HashMap<String, u64>,
}

fn default_merge_max_inputs() -> usize {
    pd_ops::catalog::DEFAULT_MERGE_MAX_INPUTS
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            disabled: Vec::new(),
            enable_passthrough: false,
            merge_max_inputs: default_merge_max_inputs(),
            timeouts: HashMap::new(),
        }
    }
}

impl PdfdeskConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    /// Reads the file if it exists, then applies the environment.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                PdfdeskConfig::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_overrides(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok((cfg, path))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("BOT_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Some(v) = var("WEBHOOK_BASE") {
            self.telegram.webhook_base = Some(v);
        }
        if let Some(v) = var("WEBHOOK_PATH") {
            self.telegram.webhook_path = v;
        }
        if let Some(v) = var("WEBHOOK_SECRET") {
            self.telegram.webhook_secret = Some(v);
        }
        if let Some(v) = var("BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = var("TEMP_DIR") {
            self.storage.temp_dir = Some(v);
        }
        if let Some(v) = var("MAX_CONCURRENT_JOBS") {
            self.limits.max_concurrent_jobs = parse_number("MAX_CONCURRENT_JOBS", &v)?;
        }
        if let Some(v) = var("JOB_TIMEOUT_S") {
            self.limits.job_timeout_seconds = parse_number("JOB_TIMEOUT_S", &v)?;
        }
        if let Some(v) = var("MAX_FILE_MB") {
            self.limits.max_file_mb = parse_number("MAX_FILE_MB", &v)?;
        }
        if let Some(v) = var("SESSION_TIMEOUT_S") {
            self.limits.session_timeout_seconds = parse_number("SESSION_TIMEOUT_S", &v)?;
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.limits.max_concurrent_jobs == 0 {
            return Err(anyhow::anyhow!("limits.max_concurrent_jobs must be >= 1"));
        }
        if self.limits.job_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("limits.job_timeout_seconds must be > 0"));
        }
        if self.limits.max_file_mb == 0 {
            return Err(anyhow::anyhow!("limits.max_file_mb must be > 0"));
        }
        if self.limits.session_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("limits.session_timeout_seconds must be > 0"));
        }
        if self.limits.expiry_interval_seconds == 0 {
            return Err(anyhow::anyhow!("limits.expiry_interval_seconds must be > 0"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        self.bind_addr()?;
        if self.operations.merge_max_inputs < 2 {
            return Err(anyhow::anyhow!("operations.merge_max_inputs must be >= 2"));
        }
        if let Some((name, _)) = self.operations.timeouts.iter().find(|(_, secs)| **secs == 0) {
            return Err(anyhow::anyhow!("operations.timeouts.{name} must be > 0"));
        }
        let longest_job = self
            .operations
            .timeouts
            .values()
            .copied()
            .fold(self.limits.job_timeout_seconds, u64::max);
        if self.limits.session_timeout_seconds <= longest_job {
            return Err(anyhow::anyhow!(
                "limits.session_timeout_seconds ({}) must exceed the longest job timeout ({longest_job})",
                self.limits.session_timeout_seconds
            ));
        }
        if let Some(base) = &self.telegram.webhook_base {
            if !base.starts_with("https://") && !base.starts_with("http://") {
                return Err(anyhow::anyhow!(
                    "telegram.webhook_base must be an http(s) URL, got {base:?}"
                ));
            }
            if !self.telegram.webhook_path.starts_with('/') {
                return Err(anyhow::anyhow!("telegram.webhook_path must start with '/'"));
            }
        } else if self.telegram.webhook_secret.is_some() {
            return Err(anyhow::anyhow!(
                "telegram.webhook_secret is set but telegram.webhook_base is not"
            ));
        }
        Ok(())
    }

    /// The bot token is only needed to serve.
    pub fn require_bot_token(&self) -> anyhow::Result<&str> {
        let token = self.telegram.bot_token.trim();
        if token.is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token is required (or set BOT_TOKEN)"
            ));
        }
        Ok(token)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .map_err(|e| {
                anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", self.server.bind_addr)
            })
    }

    pub fn catalog(&self) -> pd_ops::CatalogConfig {
        pd_ops::CatalogConfig {
            default_timeout: Duration::from_secs(self.limits.job_timeout_seconds),
            timeouts: self
                .operations
                .timeouts
                .iter()
                .map(|(id, secs)| (id.clone(), Duration::from_secs(*secs)))
                .collect(),
            disabled: self.operations.disabled.iter().cloned().collect(),
            enable_passthrough: self.operations.enable_passthrough,
            merge_max_inputs: self.operations.merge_max_inputs,
        }
    }
}

fn parse_number<T>(name: &str, raw: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}"))
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".pdfdesk").join("config.toml")
}

fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env(cfg: &mut PdfdeskConfig, vars: &[(&str, &str)]) -> anyhow::Result<()> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        cfg.apply_overrides(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_file_yields_valid_defaults() {
        let cfg: PdfdeskConfig = toml::from_str("").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.limits.max_concurrent_jobs, 6);
        assert_eq!(cfg.limits.max_file_bytes(), 50 * 1024 * 1024);
        assert_eq!(cfg.telegram.webhook_path, "/tg/webhook");
        assert_eq!(cfg.catalog().default_timeout, Duration::from_secs(300));
        assert!(cfg.require_bot_token().is_err());
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut cfg: PdfdeskConfig = toml::from_str(
            r#"
            [telegram]
            bot_token = "from-file"

            [limits]
            max_concurrent_jobs = 2
            "#,
        )
        .unwrap();
        with_env(
            &mut cfg,
            &[
                ("BOT_TOKEN", "from-env"),
                ("MAX_CONCURRENT_JOBS", "9"),
                ("MAX_FILE_MB", " 20 "),
                ("WEBHOOK_BASE", "https://bot.example.com/"),
                ("SESSION_TIMEOUT_S", ""),
            ],
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.require_bot_token().unwrap(), "from-env");
        assert_eq!(cfg.limits.max_concurrent_jobs, 9);
        assert_eq!(cfg.limits.max_file_mb, 20);
        assert_eq!(cfg.limits.session_timeout_seconds, 900);
        assert_eq!(
            cfg.telegram.webhook_url().as_deref(),
            Some("https://bot.example.com/tg/webhook")
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = PdfdeskConfig::default();
        assert!(with_env(&mut cfg, &[("JOB_TIMEOUT_S", "soon")]).is_err());

        let mut cfg = PdfdeskConfig::default();
        with_env(&mut cfg, &[("MAX_CONCURRENT_JOBS", "0")]).unwrap();
        assert!(cfg.validate().is_err());

        let mut cfg = PdfdeskConfig::default();
        cfg.telegram.webhook_secret = Some("s3cret".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = PdfdeskConfig::default();
        cfg.operations.timeouts.insert("ocr".to_string(), 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn session_timeout_must_outlast_every_job() {
        let mut cfg = PdfdeskConfig::default();
        with_env(&mut cfg, &[("JOB_TIMEOUT_S", "900")]).unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("session_timeout_seconds"), "{err}");

        let mut cfg = PdfdeskConfig::default();
        cfg.operations.timeouts.insert("ocr".to_string(), 1200);
        assert!(cfg.validate().is_err());

        let mut cfg = PdfdeskConfig::default();
        cfg.operations.timeouts.insert("ocr".to_string(), 600);
        cfg.validate().unwrap();
    }

    #[test]
    fn catalog_config_carries_operation_settings() {
        let cfg: PdfdeskConfig = toml::from_str(
            r#"
            [operations]
            disabled = ["ocr"]
            enable_passthrough = true
            timeouts = { compress = 60 }
            "#,
        )
        .unwrap();
        let catalog = cfg.catalog();
        assert!(catalog.disabled.contains("ocr"));
        assert!(catalog.enable_passthrough);
        assert_eq!(catalog.timeouts["compress"], Duration::from_secs(60));
    }

    #[tokio::test]
    async fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(PdfdeskConfig::load(Some(missing)).await.is_err());
    }
}
