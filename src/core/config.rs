//! # Configuration Module
//!
//! Gateway configuration and hot reloading.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde, chosen by file extension
//! - `GATEWAY_*` environment variable overrides
//! - Validation collecting every problem into one error
//! - Hot reloading through a `notify` watcher; subscribers get the new
//!   configuration only once it validated

use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use crate::core::definition::{ApiDefinition, FlowDefinition};
use crate::core::error::{GatewayError, GatewayResult};
use crate::routing::matcher::normalize;

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Flows applied to every API
    #[serde(default)]
    pub platform: PlatformConfig,

    #[serde(default)]
    pub apis: Vec<ApiDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Whole-request timeout, unless an API overrides it
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Largest body the gateway buffers, in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            request_timeout: default_request_timeout(),
            max_body_size: default_max_body_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// How long a stopping node waits for in-flight requests
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Expose a Prometheus scrape endpoint
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub flows: Vec<FlowDefinition>,
}

fn default_bind_address() -> String {
    "0.0.0.0:8082".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

const LOG_FORMATS: &[&str] = &["text", "json"];

impl GatewayConfig {
    /// Load configuration, picking the parser from the file extension
    pub async fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            Self::load_from_json(path).await
        } else {
            Self::load_from_file(path).await
        }
    }

    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_json::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Variables follow the pattern `GATEWAY_<SECTION>_<FIELD>`, for example
    /// `GATEWAY_SERVER_REQUEST_TIMEOUT=10s`.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(addr) = env::var("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Ok(timeout) = env::var("GATEWAY_SERVER_REQUEST_TIMEOUT") {
            self.server.request_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_SERVER_REQUEST_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(size) = env::var("GATEWAY_SERVER_MAX_BODY_SIZE") {
            self.server.max_body_size = size.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_SERVER_MAX_BODY_SIZE: {}", e))
            })?;
        }

        if let Ok(timeout) = env::var("GATEWAY_NODE_DRAIN_TIMEOUT") {
            self.node.drain_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_NODE_DRAIN_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = format;
        }

        if let Ok(enabled) = env::var("GATEWAY_METRICS_ENABLED") {
            self.observability.metrics.enabled = enabled.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_METRICS_ENABLED: {}", e))
            })?;
        }

        if let Ok(address) = env::var("GATEWAY_METRICS_ADDRESS") {
            self.observability.metrics.address = address;
        }

        Ok(())
    }

    /// Validate the whole configuration, reporting every problem at once
    ///
    /// API definitions are only checked for clashes here; an API that is
    /// invalid on its own is rejected at deployment without failing the rest.
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "server.bind_address '{}' is not a valid socket address",
                self.server.bind_address
            ));
        }
        if self.server.request_timeout.is_zero() {
            errors.push("server.request_timeout must be greater than 0".to_string());
        }
        if self.server.max_body_size == 0 {
            errors.push("server.max_body_size must be greater than 0".to_string());
        }

        let logging = &self.observability.logging;
        if !LOG_FORMATS.contains(&logging.format.as_str()) {
            errors.push(format!(
                "observability.logging.format must be one of {:?}, got '{}'",
                LOG_FORMATS, logging.format
            ));
        }
        let metrics = &self.observability.metrics;
        if metrics.enabled && metrics.address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "observability.metrics.address '{}' is not a valid socket address",
                metrics.address
            ));
        }

        let mut ids = HashSet::new();
        let mut context_paths = HashSet::new();
        for api in &self.apis {
            if !ids.insert(api.id.as_str()) {
                errors.push(format!("duplicate api id '{}'", api.id));
            }
            if !context_paths.insert(normalize(&api.context_path)) {
                errors.push(format!(
                    "api '{}' reuses context path '{}'",
                    api.id, api.context_path
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub file_path: PathBuf,
    pub config: GatewayConfig,
    pub timestamp: std::time::Instant,
}

/// Configuration manager with hot reloading
///
/// A reload that fails to parse or validate is logged and dropped; the current
/// configuration stays in place.
pub struct ConfigManager {
    current_config: Arc<RwLock<GatewayConfig>>,
    config_path: PathBuf,
    _watcher: Option<notify::RecommendedWatcher>,
    change_sender: broadcast::Sender<ConfigChangeEvent>,
}

impl ConfigManager {
    /// Load the initial configuration without watching the file
    pub async fn new<P: AsRef<Path>>(config_path: P) -> GatewayResult<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = GatewayConfig::load(&config_path).await?;
        let (change_sender, _) = broadcast::channel(16);

        Ok(Self {
            current_config: Arc::new(RwLock::new(config)),
            config_path,
            _watcher: None,
            change_sender,
        })
    }

    /// Load the initial configuration and start watching the file
    pub async fn watched<P: AsRef<Path>>(config_path: P) -> GatewayResult<Self> {
        let mut manager = Self::new(config_path).await?;
        manager.setup_file_watcher()?;
        Ok(manager)
    }

    pub async fn get_config(&self) -> GatewayConfig {
        self.current_config.read().await.clone()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Receive every configuration that replaced the current one
    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_sender.subscribe()
    }

    /// Reload the file now
    pub async fn reload_config(&self) -> GatewayResult<()> {
        tracing::info!("Manually reloading configuration from {:?}", self.config_path);
        reload(&self.config_path, &self.current_config, &self.change_sender).await
    }

    fn setup_file_watcher(&mut self) -> GatewayResult<()> {
        let config_path = self.config_path.clone();
        let current_config = Arc::clone(&self.current_config);
        let change_sender = self.change_sender.clone();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| GatewayError::config(format!("Failed to create file watcher: {}", e)))?;

        // editors often replace the file, so watch its directory
        if let Some(parent_dir) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            watcher
                .watch(parent_dir, RecursiveMode::NonRecursive)
                .map_err(|e| GatewayError::config(format!("Failed to watch config directory: {}", e)))?;
        } else {
            watcher
                .watch(Path::new("."), RecursiveMode::NonRecursive)
                .map_err(|e| GatewayError::config(format!("Failed to watch config directory: {}", e)))?;
        }
        self._watcher = Some(watcher);

        let config_file_name = config_path
            .file_name()
            .ok_or_else(|| GatewayError::config("Invalid config file path"))?
            .to_owned();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let is_config_file_event = event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == Some(&config_file_name));
                if !is_config_file_event {
                    continue;
                }

                if let EventKind::Modify(_) | EventKind::Create(_) = event.kind {
                    tracing::info!("Configuration file changed, reloading...");
                    // let the writer finish
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if let Err(e) = reload(&config_path, &current_config, &change_sender).await {
                        tracing::error!("Failed to reload configuration: {}", e);
                    }
                }
            }
        });

        tracing::info!("File watcher set up for configuration hot reloading");
        Ok(())
    }
}

async fn reload(
    path: &Path,
    current: &RwLock<GatewayConfig>,
    sender: &broadcast::Sender<ConfigChangeEvent>,
) -> GatewayResult<()> {
    let new_config = GatewayConfig::load(path).await?;

    {
        let mut config = current.write().await;
        if *config == new_config {
            tracing::debug!("Configuration unchanged, skipping reload");
            return Ok(());
        }
        *config = new_config.clone();
    }

    let change_event = ConfigChangeEvent {
        file_path: path.to_path_buf(),
        config: new_config,
        timestamp: std::time::Instant::now(),
    };
    // no subscribers is fine
    let _ = sender.send(change_event);

    tracing::info!("Configuration reloaded successfully");
    Ok(())
}
