use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::Result;

/// runtime configuration assembled from the environment once at startup
/// and handed to every component at construction
#[derive(Debug, Clone)]
pub struct Settings {
    pub portainer_url: String,
    pub portainer_api_key: Option<String>,
    pub portainer_username: Option<String>,
    pub portainer_password: Option<String>,
    /// pinned engine environment; discovered from the engine when unset
    pub portainer_env_id: Option<i64>,

    pub webdav_url: String,
    pub webdav_username: String,
    pub webdav_password: String,
    pub webdav_base_path: String,

    /// shared-FS base for per-server data directories
    pub minecraft_path: String,
    /// shared-FS base for proxy config directories
    pub velocity_config_path: String,
    pub velocity_network_name: String,

    pub root_domain: String,
    pub porkbun_api_key: String,
    pub porkbun_secret_key: String,

    pub mongodb_uri: String,

    /// destroy server data directories on delete instead of archive-renaming
    pub delete_server_folders: bool,

    pub proxy_definitions_path: PathBuf,
    pub bind_addr: String,
    pub io_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Settings {
            portainer_url: env::var("PORTAINER_URL")?,
            portainer_api_key: env::var("PORTAINER_API_KEY").ok(),
            portainer_username: env::var("PORTAINER_USERNAME").ok(),
            portainer_password: env::var("PORTAINER_PASSWORD").ok(),
            portainer_env_id: env::var("PORTAINER_ENV_ID")
                .ok()
                .and_then(|v| v.parse().ok()),
            webdav_url: env::var("WEBDAV_URL")?,
            webdav_username: env::var("WEBDAV_USERNAME")?,
            webdav_password: env::var("WEBDAV_PASSWORD")?,
            webdav_base_path: env::var("WEBDAV_SERVER_BASE_PATH").unwrap_or_default(),
            minecraft_path: env::var("MINECRAFT_PATH")?,
            velocity_config_path: env::var("VELOCITY_CONFIG_PATH")?,
            velocity_network_name: env::var("VELOCITY_NETWORK_NAME")
                .unwrap_or_else(|_| String::from("mc-overlay")),
            root_domain: env::var("ROOT_DOMAIN")?,
            porkbun_api_key: env::var("PORKBUN_API_KEY")?,
            porkbun_secret_key: env::var("PORKBUN_SECRET_KEY")?,
            mongodb_uri: env::var("MONGODB_URI")?,
            delete_server_folders: env::var("DELETE_SERVER_FOLDERS")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            proxy_definitions_path: env::var("PROXY_DEFINITIONS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("proxies.yaml")),
            bind_addr: env::var("HOPPER_BIND").unwrap_or_else(|_| String::from("0.0.0.0:8080")),
            io_timeout: Duration::from_secs(10),
        })
    }
}
