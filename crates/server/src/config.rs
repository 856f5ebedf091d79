//! Server process configuration from environment variables

use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path of the YAML configuration file.
    pub config_path: String,
    /// Path of the SQLite state database.
    pub state_path: String,
    /// Bind address of the admin API.
    pub bind_addr: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        ServerConfig {
            config_path: env::var("AVOCADO_CONFIG_PATH")
                .unwrap_or_else(|_| "config.yaml".to_string()),
            state_path: env::var("AVOCADO_STATE_PATH")
                .unwrap_or_else(|_| "data/state.db".to_string()),
            bind_addr: env::var("AVOCADO_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        }
    }
}
