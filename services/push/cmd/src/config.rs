//! Configuration handling for the push client.
//!
//! Reads the `services.push` section of the shared YAML config file and
//! applies `PUSH_*` environment overrides on top.

use anyhow::Result;
use push_session::{DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT, KEEP_ALIVE_SECS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Push client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Broker host
    pub broker_host: String,
    /// Broker port
    pub broker_port: u16,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Base URL of the HTTP API used for registration confirmation
    pub api_base: String,
    /// Name of the session to run
    pub session_name: String,
    /// Directory holding session files and lock files
    pub state_dir: String,
    /// Keep-alive negotiated with the broker (seconds)
    pub keep_alive_secs: u16,
    /// How long a resumed connection runs before handing back (seconds)
    pub wait_time_secs: u64,
    /// Package name sent when registering
    pub package_name: String,
    /// Application id sent when registering
    pub app_id: String,
    /// User agent for the broker and the HTTP API
    pub user_agent: String,
    /// Whether the host supports notification reply actions
    pub reply_actions: bool,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Extra CA bundle (PEM) trusted besides the web PKI roots
    pub ca_file: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_file: String::new(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            tls: TlsConfig::default(),
            api_base: "https://i.instagram.com".to_string(),
            session_name: "default".to_string(),
            state_dir: "./pushdata".to_string(),
            keep_alive_secs: KEEP_ALIVE_SECS,
            wait_time_secs: 5,
            package_name: "com.instagram.android".to_string(),
            app_id: "567067343352427".to_string(),
            user_agent: format!("push-client/{}", env!("CARGO_PKG_VERSION")),
            reply_actions: false,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    push: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

impl PushConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            if let Ok(root_config) = serde_yaml::from_str::<RootConfig>(&content) {
                config.apply_root_config(root_config);
                info!("Loaded configuration from {:?}", config_path.as_ref());
            } else {
                warn!(
                    "Failed to parse config file {:?}, using defaults",
                    config_path.as_ref()
                );
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();

        info!(
            "Final push configuration: broker={}:{}, tls={}, session={}, state_dir={}",
            config.broker_host,
            config.broker_port,
            config.tls.enabled,
            config.session_name,
            config.state_dir
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        let Some(config_map) = root_config
            .services
            .and_then(|s| s.push)
            .and_then(|p| p.config)
        else {
            return;
        };

        for (key, value) in config_map {
            match key.as_str() {
                "services.push.broker_host" => self.broker_host = value,
                "services.push.broker_port" => {
                    if let Ok(port) = value.parse::<u16>() {
                        self.broker_port = port;
                    }
                }
                "services.push.tls.enabled" => {
                    self.tls.enabled = value.to_lowercase() == "true";
                }
                "services.push.tls.ca_file" => self.tls.ca_file = value,
                "services.push.api_base" => self.api_base = value,
                "services.push.session_name" => self.session_name = value,
                "services.push.state_dir" => self.state_dir = value,
                "services.push.keep_alive_secs" => {
                    if let Ok(secs) = value.parse::<u16>() {
                        self.keep_alive_secs = secs;
                    }
                }
                "services.push.wait_time_secs" => {
                    if let Ok(secs) = value.parse::<u64>() {
                        self.wait_time_secs = secs;
                    }
                }
                "services.push.package_name" => self.package_name = value,
                "services.push.app_id" => self.app_id = value,
                "services.push.user_agent" => self.user_agent = value,
                "services.push.reply_actions" => {
                    self.reply_actions = value.to_lowercase() == "true";
                }
                _ => {
                    // Ignore unknown configuration keys
                }
            }
        }
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(host) = std::env::var("PUSH_BROKER_HOST") {
            self.broker_host = host;
            info!("Broker host overridden by environment: {}", self.broker_host);
        }

        if let Ok(port) = std::env::var("PUSH_BROKER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.broker_port = port;
                info!("Broker port overridden by environment: {}", port);
            }
        }

        if let Ok(api_base) = std::env::var("PUSH_API_BASE") {
            self.api_base = api_base;
            info!("API base overridden by environment: {}", self.api_base);
        }

        if let Ok(session) = std::env::var("PUSH_SESSION") {
            self.session_name = session;
            info!("Session overridden by environment: {}", self.session_name);
        }

        if let Ok(state_dir) = std::env::var("PUSH_STATE_DIR") {
            self.state_dir = state_dir;
            info!("State directory overridden by environment: {}", self.state_dir);
        }
    }
}
