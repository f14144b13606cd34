use linked_hash_map::LinkedHashMap;
use yaml_rust::{yaml::Hash, Yaml, YamlEmitter, YamlLoader};

use crate::{Error, Result};

const DEFAULT_TEMPLATE: &str = include_str!("../../defaults/config.yml");

fn key(s: &str) -> Yaml {
    Yaml::String(s.to_string())
}

fn string(s: &str) -> Yaml {
    Yaml::String(s.to_string())
}

/// a BungeeCord/Waterfall config.yml, mutated in place so unknown keys
/// survive every rewrite
#[derive(Debug, Clone, PartialEq)]
pub struct BungeeConfig {
    doc: Hash,
}

impl BungeeConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let mut loaded = YamlLoader::load_from_str(text)
            .map_err(|e| Error::Validation(format!("config.yml: {e}")))?;
        if loaded.is_empty() {
            return Ok(BungeeConfig { doc: Hash::new() });
        }
        let doc = loaded
            .remove(0)
            .into_hash()
            .ok_or_else(|| Error::Validation("config.yml: top level is not a mapping".into()))?;
        Ok(BungeeConfig { doc })
    }

    /// the embedded default with the listener bound to the given port.
    /// `waterfall` additionally switches on modern forwarding with a secret
    /// file reference.
    pub fn template(external_port: u16, motd: &str, waterfall: bool) -> Self {
        let mut cfg = Self::parse(DEFAULT_TEMPLATE).expect("embedded bungee template parses");
        cfg.with_listener(|l| {
            l.insert(key("host"), string(&format!("0.0.0.0:{external_port}")));
            l.insert(key("motd"), string(motd));
        });
        if waterfall {
            cfg.doc.insert(key("modern_forwarding"), Yaml::Boolean(true));
            cfg.doc
                .insert(key("forwarding_secret_file"), string("forwarding.secret"));
        }
        cfg
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let mut emitter = YamlEmitter::new(&mut out);
        emitter
            .dump(&Yaml::Hash(self.doc.clone()))
            .expect("yaml emit");
        out.push('\n');
        out
    }

    fn with_listener<F: FnOnce(&mut Hash)>(&mut self, f: F) {
        let mut listeners = self
            .doc
            .get(&key("listeners"))
            .and_then(|y| y.as_vec())
            .cloned()
            .unwrap_or_default();
        let mut first = listeners
            .first()
            .and_then(|y| y.as_hash())
            .cloned()
            .unwrap_or_default();
        f(&mut first);
        if listeners.is_empty() {
            listeners.push(Yaml::Hash(first));
        } else {
            listeners[0] = Yaml::Hash(first);
        }
        self.doc.insert(key("listeners"), Yaml::Array(listeners));
    }

    fn listener(&self) -> Option<&Hash> {
        self.doc
            .get(&key("listeners"))
            .and_then(|y| y.as_vec())
            .and_then(|v| v.first())
            .and_then(|y| y.as_hash())
    }

    /// register or re-point a back-end under top-level `servers`
    pub fn upsert_server(&mut self, name: &str, address: &str, motd: &str) {
        let mut servers = self
            .doc
            .get(&key("servers"))
            .and_then(|y| y.as_hash())
            .cloned()
            .unwrap_or_default();
        let mut entry = LinkedHashMap::new();
        entry.insert(key("motd"), string(motd));
        entry.insert(key("address"), string(address));
        entry.insert(key("restricted"), Yaml::Boolean(false));
        servers.insert(key(name), Yaml::Hash(entry));
        self.doc.insert(key("servers"), Yaml::Hash(servers));
    }

    pub fn ensure_priority(&mut self, name: &str) {
        self.with_listener(|l| {
            let mut priorities = l
                .get(&key("priorities"))
                .and_then(|y| y.as_vec())
                .cloned()
                .unwrap_or_default();
            if !priorities.iter().any(|y| y.as_str() == Some(name)) {
                priorities.push(string(name));
            }
            l.insert(key("priorities"), Yaml::Array(priorities));
        });
    }

    pub fn set_forced_host(&mut self, host: &str, name: &str) {
        self.with_listener(|l| {
            let mut hosts = l
                .get(&key("forced_hosts"))
                .and_then(|y| y.as_hash())
                .cloned()
                .unwrap_or_default();
            let mut names = hosts
                .get(&key(host))
                .and_then(|y| y.as_vec())
                .cloned()
                .unwrap_or_default();
            if !names.iter().any(|y| y.as_str() == Some(name)) {
                names.push(string(name));
            }
            hosts.insert(key(host), Yaml::Array(names));
            l.insert(key("forced_hosts"), Yaml::Hash(hosts));
        });
    }

    /// drop the back-end from `servers`, `priorities` and every forced-host
    /// list, pruning emptied hosts. returns true when anything changed.
    pub fn remove_server(&mut self, name: &str) -> bool {
        let mut changed = false;
        let mut servers = self
            .doc
            .get(&key("servers"))
            .and_then(|y| y.as_hash())
            .cloned()
            .unwrap_or_default();
        if servers.remove(&key(name)).is_some() {
            changed = true;
        }
        self.doc.insert(key("servers"), Yaml::Hash(servers));

        self.with_listener(|l| {
            let mut priorities = l
                .get(&key("priorities"))
                .and_then(|y| y.as_vec())
                .cloned()
                .unwrap_or_default();
            let before = priorities.len();
            priorities.retain(|y| y.as_str() != Some(name));
            if priorities.len() != before {
                changed = true;
            }
            l.insert(key("priorities"), Yaml::Array(priorities));

            let hosts = l
                .get(&key("forced_hosts"))
                .and_then(|y| y.as_hash())
                .cloned()
                .unwrap_or_default();
            let mut kept = Hash::new();
            for (host, names) in hosts {
                let mut names = names.as_vec().cloned().unwrap_or_default();
                let before = names.len();
                names.retain(|y| y.as_str() != Some(name));
                if names.len() != before {
                    changed = true;
                }
                if !names.is_empty() {
                    kept.insert(host, Yaml::Array(names));
                }
            }
            l.insert(key("forced_hosts"), Yaml::Hash(kept));
        });
        changed
    }

    pub fn servers(&self) -> Vec<String> {
        self.doc
            .get(&key("servers"))
            .and_then(|y| y.as_hash())
            .map(|h| {
                h.keys()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn priorities(&self) -> Vec<String> {
        self.listener()
            .and_then(|l| l.get(&key("priorities")))
            .and_then(|y| y.as_vec())
            .map(|v| {
                v.iter()
                    .filter_map(|y| y.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn forced_hosts(&self) -> Vec<(String, Vec<String>)> {
        self.listener()
            .and_then(|l| l.get(&key("forced_hosts")))
            .and_then(|y| y.as_hash())
            .map(|h| {
                h.iter()
                    .filter_map(|(host, names)| {
                        let host = host.as_str()?.to_string();
                        let names = names
                            .as_vec()
                            .map(|v| {
                                v.iter()
                                    .filter_map(|y| y.as_str().map(str::to_string))
                                    .collect()
                            })
                            .unwrap_or_default();
                        Some((host, names))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn mentions(&self, name: &str) -> bool {
        self.servers().iter().any(|n| n == name)
            || self.priorities().iter().any(|n| n == name)
            || self
                .forced_hosts()
                .iter()
                .any(|(_, ns)| ns.iter().any(|n| n == name))
    }
}
