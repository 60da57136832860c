//! User configuration, merged from `~/.config/tether/config.toml` and
//! command-line overrides.

use crate::muted_error;
use log::error;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// "host:port" of the debug agent.
    pub addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Keep the initial thread paused after its modules load.
    pub pause_on_launch: bool,
    /// Send the agent a quit request when the client exits.
    pub quit_agent_on_exit: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            pause_on_launch: false,
            quit_agent_on_exit: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SymbolConfig {
    /// Directories served as symbol stores (`<build_id>.debug` layout).
    pub servers: Vec<PathBuf>,
    /// Sidecar symbol tables: build id -> json table path.
    pub tables: Vec<(String, PathBuf)>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub behavior: BehaviorConfig,
    pub symbols: SymbolConfig,
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/tether/config.toml";

    /// Load from an explicit path or the default location. Falls back to
    /// defaults when the file is absent or unreadable.
    pub fn load(path: Option<&Path>) -> Config {
        let data = match path {
            None => {
                let Some(home) = home::home_dir() else {
                    return Config::default();
                };
                match muted_error!(read_to_string(home.join(Self::DEFAULT_PATH))) {
                    Some(data) => data,
                    None => return Config::default(),
                }
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    error!("error while loading config file: {err}");
                    return Config::default();
                }
            },
        };

        match toml::de::from_str(&data) {
            Ok(config) => config,
            Err(err) => {
                error!("config parse error: {err}");
                Config::default()
            }
        }
    }
}
