use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// longest accepted server name; the name doubles as the proxy-side identifier
pub const MAX_SERVER_NAME_LEN: usize = 50;

/// the fixed in-container game port every back-end listens on
pub const GAME_PORT: u16 = 25565;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    #[serde(rename = "PAPER")]
    Paper,
    #[serde(rename = "PURPUR")]
    Purpur,
    #[serde(rename = "NEOFORGE")]
    NeoForge,
    #[serde(rename = "FORGE")]
    Forge,
    #[serde(rename = "FABRIC")]
    Fabric,
}

impl ServerKind {
    /// value for the container image's TYPE variable
    pub fn as_env(&self) -> &'static str {
        match self {
            ServerKind::Paper => "PAPER",
            ServerKind::Purpur => "PURPUR",
            ServerKind::NeoForge => "NEOFORGE",
            ServerKind::Forge => "FORGE",
            ServerKind::Fabric => "FABRIC",
        }
    }

    /// platforms that speak Velocity modern forwarding natively
    pub fn supports_modern_forwarding(&self) -> bool {
        matches!(self, ServerKind::Paper | ServerKind::Purpur)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingMode {
    #[default]
    None,
    Legacy,
    Modern,
}

/// fields shared by every server type
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GameSettings {
    pub version: String,
    pub port: u16,
    #[serde(default)]
    pub rcon_port: Option<u16>,
    pub memory_mb: u32,
    pub motd: String,
    #[serde(default)]
    pub forwarding_mode: ForwardingMode,
    #[serde(default)]
    pub forwarding_secret: Option<String>,
}

/// per-type configuration; tagged on `server_type`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "server_type")]
pub enum ServerConfig {
    #[serde(rename = "PAPER")]
    Paper {
        #[serde(flatten)]
        base: GameSettings,
    },
    #[serde(rename = "PURPUR")]
    Purpur {
        #[serde(flatten)]
        base: GameSettings,
    },
    #[serde(rename = "NEOFORGE")]
    NeoForge {
        #[serde(flatten)]
        base: GameSettings,
        #[serde(default)]
        neoforge_version: Option<String>,
    },
    #[serde(rename = "FORGE")]
    Forge {
        #[serde(flatten)]
        base: GameSettings,
        #[serde(default)]
        forge_version: Option<String>,
    },
    #[serde(rename = "FABRIC")]
    Fabric {
        #[serde(flatten)]
        base: GameSettings,
        #[serde(default)]
        loader_version: Option<String>,
    },
}

impl ServerConfig {
    pub fn new(kind: ServerKind, base: GameSettings) -> Self {
        match kind {
            ServerKind::Paper => ServerConfig::Paper { base },
            ServerKind::Purpur => ServerConfig::Purpur { base },
            ServerKind::NeoForge => ServerConfig::NeoForge {
                base,
                neoforge_version: None,
            },
            ServerKind::Forge => ServerConfig::Forge {
                base,
                forge_version: None,
            },
            ServerKind::Fabric => ServerConfig::Fabric {
                base,
                loader_version: None,
            },
        }
    }

    pub fn kind(&self) -> ServerKind {
        match self {
            ServerConfig::Paper { .. } => ServerKind::Paper,
            ServerConfig::Purpur { .. } => ServerKind::Purpur,
            ServerConfig::NeoForge { .. } => ServerKind::NeoForge,
            ServerConfig::Forge { .. } => ServerKind::Forge,
            ServerConfig::Fabric { .. } => ServerKind::Fabric,
        }
    }

    pub fn base(&self) -> &GameSettings {
        match self {
            ServerConfig::Paper { base }
            | ServerConfig::Purpur { base }
            | ServerConfig::NeoForge { base, .. }
            | ServerConfig::Forge { base, .. }
            | ServerConfig::Fabric { base, .. } => base,
        }
    }

    pub fn base_mut(&mut self) -> &mut GameSettings {
        match self {
            ServerConfig::Paper { base }
            | ServerConfig::Purpur { base }
            | ServerConfig::NeoForge { base, .. }
            | ServerConfig::Forge { base, .. }
            | ServerConfig::Fabric { base, .. } => base,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let base = self.base();
        if base.version.is_empty() {
            return Err(Error::Validation("server version must not be empty".into()));
        }
        if base.memory_mb < 512 {
            return Err(Error::Validation(format!(
                "memory_mb {} below the 512 MB floor",
                base.memory_mb
            )));
        }
        if base.forwarding_mode == ForwardingMode::Modern
            && !self.kind().supports_modern_forwarding()
        {
            return Err(Error::Validation(format!(
                "{} does not support modern player-info forwarding",
                self.kind().as_env()
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Creating,
    Ready,
    Starting,
    Online,
    Stopping,
    Deleting,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Creating => "creating",
            ServerStatus::Ready => "ready",
            ServerStatus::Starting => "starting",
            ServerStatus::Online => "online",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Deleting => "deleting",
        }
    }

    /// transient states are resumed after a restart
    pub fn is_transient(&self) -> bool {
        !matches!(self, ServerStatus::Ready | ServerStatus::Online)
    }
}

/// one game server as persisted in the `servers` collection; the row is the
/// source of truth, container stack and proxy entries are derived state
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerRecord {
    pub unique_id: String,
    pub owner_email: String,
    pub server_name: String,
    #[serde(default)]
    pub subdomain_name: Option<String>,
    pub folder_path: String,
    pub is_online: bool,
    pub created_at: DateTime<Utc>,
    pub status: ServerStatus,
    /// SRV publication failed at create time; the reconciler retries it
    #[serde(default)]
    pub dns_pending: bool,
    pub config: ServerConfig,
}

impl ServerRecord {
    /// canonical container (and stack) name derived from the unique id
    pub fn container_name(&self) -> String {
        format!("mc-{}", self.unique_id)
    }

    /// address proxies dial on the overlay network
    pub fn backend_address(&self) -> String {
        format!("mc-{}:{}", self.unique_id, GAME_PORT)
    }
}

/// suffixes that collide with per-server override keys in proxy configs
const FORBIDDEN_NAME_SUFFIXES: &[&str] = &[
    "-restricted",
    "-player-info-forwarding-mode",
    "-forwarding-secret",
];

pub fn validate_server_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_SERVER_NAME_LEN {
        return Err(Error::Validation(format!(
            "server name must be 1..={MAX_SERVER_NAME_LEN} characters"
        )));
    }
    // "try" is the fallback-list key inside a velocity [servers] table
    if name == "try" {
        return Err(Error::Validation("server name 'try' is reserved".into()));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
    {
        return Err(Error::Validation(
            "server name may only contain lowercase letters, digits, '-' and '_'".into(),
        ));
    }
    for suffix in FORBIDDEN_NAME_SUFFIXES {
        if name.ends_with(suffix) {
            return Err(Error::Validation(format!(
                "server name may not end with '{suffix}'"
            )));
        }
    }
    Ok(())
}
