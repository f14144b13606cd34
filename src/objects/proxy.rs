use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// stack-name prefix identifying proxies managed by this control plane
pub const MANAGED_PREFIX: &str = "mcproxy-";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Velocity,
    Bungeecord,
    Waterfall,
}

impl ProxyKind {
    pub fn config_file(&self) -> &'static str {
        match self {
            ProxyKind::Velocity => "velocity.toml",
            ProxyKind::Bungeecord | ProxyKind::Waterfall => "config.yml",
        }
    }

    /// value for the proxy image's TYPE variable
    pub fn as_env(&self) -> &'static str {
        match self {
            ProxyKind::Velocity => "VELOCITY",
            ProxyKind::Bungeecord => "BUNGEECORD",
            ProxyKind::Waterfall => "WATERFALL",
        }
    }

    pub fn default_image(&self) -> &'static str {
        "itzg/bungeecord:latest"
    }

    /// in-container listen port
    pub fn listen_port(&self) -> u16 {
        25577
    }
}

fn default_enabled() -> bool {
    true
}

/// one declared front proxy, loaded from the definitions file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProxyDefinition {
    /// stable identifier, also keys the per-proxy config lock
    pub id: String,
    /// stack/container name; must carry the managed prefix
    pub name: String,
    /// container hostname on the overlay network
    pub host: String,
    pub external_port: u16,
    /// config directory, relative to the shared proxy base
    pub config_path: String,
    pub network_name: String,
    /// container memory limit, e.g. "1g"
    pub memory: String,
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ProxyDefinition {
    pub fn image(&self) -> &str {
        self.image
            .as_deref()
            .unwrap_or_else(|| self.kind.default_image())
    }
}

/// lazily refreshed snapshot of the definitions file, invalidated by mtime
pub struct ProxyDefinitions {
    path: PathBuf,
    cached: Option<(SystemTime, Arc<Vec<ProxyDefinition>>)>,
}

impl ProxyDefinitions {
    pub fn new(path: PathBuf) -> Self {
        ProxyDefinitions { path, cached: None }
    }

    /// current definitions, re-read only when the file changed on disk.
    /// a missing file is an empty fleet, not an error.
    pub fn load(&mut self) -> Result<Arc<Vec<ProxyDefinition>>> {
        let mtime = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return Ok(Arc::new(Vec::new())),
        };
        if let Some((cached_mtime, defs)) = &self.cached {
            if *cached_mtime == mtime {
                return Ok(defs.clone());
            }
        }
        let text = fs::read_to_string(&self.path).map_err(|e| {
            Error::Validation(format!("proxy definitions {}: {e}", self.path.display()))
        })?;
        let defs: Vec<ProxyDefinition> = serde_yaml::from_str(&text)
            .map_err(|e| Error::Validation(format!("proxy definitions: {e}")))?;
        for def in &defs {
            if !def.name.starts_with(MANAGED_PREFIX) {
                return Err(Error::Validation(format!(
                    "proxy '{}' must be named with the '{MANAGED_PREFIX}' prefix",
                    def.id
                )));
            }
        }
        let defs = Arc::new(defs);
        self.cached = Some((mtime, defs.clone()));
        Ok(defs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("hopper-test-{name}-{}", uuid::Uuid::new_v4()));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    const DEFS: &str = r#"
- id: main
  name: mcproxy-main
  host: mcproxy-main
  external_port: 25565
  config_path: main
  network_name: mc-overlay
  memory: 1g
  type: velocity
"#;

    #[test]
    fn parses_definitions() {
        let path = scratch_file("defs", DEFS);
        let mut cache = ProxyDefinitions::new(path.clone());
        let defs = cache.load().unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].kind, ProxyKind::Velocity);
        assert!(defs[0].enabled);
        assert_eq!(defs[0].image(), "itzg/bungeecord:latest");
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file_is_empty_fleet() {
        let mut cache = ProxyDefinitions::new(PathBuf::from("/nonexistent/proxies.yaml"));
        assert!(cache.load().unwrap().is_empty());
    }

    #[test]
    fn cache_hits_until_mtime_changes() {
        let path = scratch_file("cache", DEFS);
        let mut cache = ProxyDefinitions::new(path.clone());
        let first = cache.load().unwrap();
        let second = cache.load().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_unprefixed_names() {
        let path = scratch_file("prefix", &DEFS.replace("mcproxy-main", "edge"));
        let mut cache = ProxyDefinitions::new(path.clone());
        assert!(cache.load().is_err());
        fs::remove_file(path).unwrap();
    }
}
