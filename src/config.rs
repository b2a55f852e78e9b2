//! Layered configuration for `wmctl`.
//!
//! Sources, lowest precedence first: built-in defaults, the TOML file,
//! `WINMOUNT_*` environment variables, then command-line flags.

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Port the daemon listens on unless configured otherwise.
pub const DEFAULT_DAEMON_PORT: u16 = 19423;

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "wmctl.toml";

pub const ENV_PREFIX: &str = "WINMOUNT_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub daemon_host: String,
    pub daemon_port: u16,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            daemon_host: "127.0.0.1".to_string(),
            daemon_port: DEFAULT_DAEMON_PORT,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Loads the configuration. `overrides` is any serializable set of
    /// command-line values; fields it leaves out keep the lower layers.
    pub fn new<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }
        figment.extract()
    }

    /// WebSocket endpoint of the daemon.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.daemon_host, self.daemon_port)
    }

    /// HTTP endpoint that asks the daemon to exit.
    pub fn shutdown_url(&self) -> String {
        format!("http://{}:{}/api/shutdown", self.daemon_host, self.daemon_port)
    }
}
