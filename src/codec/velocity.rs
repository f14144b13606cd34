use std::collections::BTreeMap;

use toml_edit::{value, Array, DocumentMut, Item, Table};

use crate::{Error, Result};

const DEFAULT_TEMPLATE: &str = include_str!("../../defaults/velocity.toml");

/// per-server override properties keyed `<name>-<property>` inside `[servers]`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerOverride {
    pub restricted: Option<bool>,
    pub forwarding_mode: Option<String>,
    pub forwarding_secret: Option<String>,
}

impl ServerOverride {
    fn is_empty(&self) -> bool {
        self.restricted.is_none()
            && self.forwarding_mode.is_none()
            && self.forwarding_secret.is_none()
    }
}

/// parsed form of a velocity.toml at the level of fields this system writes.
/// unknown keys are carried in catch-all lists and re-emitted verbatim.
#[derive(Debug, Clone, Default)]
pub struct VelocityConfig {
    pub config_version: String,
    pub bind: String,
    pub motd: String,
    pub show_max_players: i64,
    pub online_mode: bool,
    pub forwarding_mode: String,
    pub forwarding_secret: String,
    /// `name = "host:port"` entries of `[servers]`
    pub servers: BTreeMap<String, String>,
    pub overrides: BTreeMap<String, ServerOverride>,
    pub try_order: Vec<String>,
    /// quoted domain -> back-end names
    pub forced_hosts: BTreeMap<String, Vec<String>>,
    extra_root: Vec<(String, Item)>,
    extra_servers: Vec<(String, Item)>,
}

impl PartialEq for VelocityConfig {
    fn eq(&self, other: &Self) -> bool {
        let known = self.config_version == other.config_version
            && self.bind == other.bind
            && self.motd == other.motd
            && self.show_max_players == other.show_max_players
            && self.online_mode == other.online_mode
            && self.forwarding_mode == other.forwarding_mode
            && self.forwarding_secret == other.forwarding_secret
            && self.servers == other.servers
            && self.overrides == other.overrides
            && self.try_order == other.try_order
            && self.forced_hosts == other.forced_hosts;
        let extras = |a: &[(String, Item)], b: &[(String, Item)]| {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && va.to_string() == vb.to_string())
        };
        known
            && extras(&self.extra_root, &other.extra_root)
            && extras(&self.extra_servers, &other.extra_servers)
    }
}

const OVERRIDE_RESTRICTED: &str = "-restricted";
const OVERRIDE_FORWARDING_MODE: &str = "-player-info-forwarding-mode";
const OVERRIDE_FORWARDING_SECRET: &str = "-forwarding-secret";

impl VelocityConfig {
    /// the embedded default config with the given bind port and secret
    pub fn template(external_port: u16, forwarding_secret: &str) -> Self {
        let mut cfg = Self::parse(DEFAULT_TEMPLATE).expect("embedded velocity template parses");
        cfg.bind = format!("0.0.0.0:{external_port}");
        cfg.forwarding_secret = forwarding_secret.to_string();
        cfg
    }

    pub fn parse(text: &str) -> Result<Self> {
        let doc: DocumentMut = text
            .parse()
            .map_err(|e: toml_edit::TomlError| Error::Validation(format!("velocity.toml: {e}")))?;
        let mut cfg = VelocityConfig::default();
        for (key, item) in doc.iter() {
            match key {
                "config-version" => cfg.config_version = str_of(item),
                "bind" => cfg.bind = str_of(item),
                "motd" => cfg.motd = str_of(item),
                "show-max-players" => cfg.show_max_players = item.as_integer().unwrap_or(0),
                "online-mode" => cfg.online_mode = item.as_bool().unwrap_or(true),
                "player-info-forwarding-mode" => cfg.forwarding_mode = str_of(item),
                "forwarding-secret" => cfg.forwarding_secret = str_of(item),
                "servers" => {
                    let Some(table) = item.as_table() else {
                        cfg.extra_root.push((key.to_string(), item.clone()));
                        continue;
                    };
                    for (k, v) in table.iter() {
                        cfg.read_server_entry(k, v);
                    }
                }
                "forced-hosts" => {
                    let Some(table) = item.as_table() else {
                        cfg.extra_root.push((key.to_string(), item.clone()));
                        continue;
                    };
                    for (host, v) in table.iter() {
                        let names = v
                            .as_array()
                            .map(|a| {
                                a.iter()
                                    .filter_map(|e| e.as_str().map(str::to_string))
                                    .collect()
                            })
                            .unwrap_or_default();
                        cfg.forced_hosts.insert(host.to_string(), names);
                    }
                }
                _ => cfg.extra_root.push((key.to_string(), item.clone())),
            }
        }
        Ok(cfg)
    }

    fn read_server_entry(&mut self, key: &str, item: &Item) {
        if key == "try" {
            self.try_order = item
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|e| e.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
        } else if let Some(name) = key.strip_suffix(OVERRIDE_RESTRICTED) {
            self.overrides.entry(name.to_string()).or_default().restricted = item.as_bool();
        } else if let Some(name) = key.strip_suffix(OVERRIDE_FORWARDING_MODE) {
            self.overrides
                .entry(name.to_string())
                .or_default()
                .forwarding_mode = item.as_str().map(str::to_string);
        } else if let Some(name) = key.strip_suffix(OVERRIDE_FORWARDING_SECRET) {
            self.overrides
                .entry(name.to_string())
                .or_default()
                .forwarding_secret = item.as_str().map(str::to_string);
        } else if let Some(address) = item.as_str() {
            self.servers.insert(key.to_string(), address.to_string());
        } else {
            self.extra_servers.push((key.to_string(), item.clone()));
        }
    }

    /// canonical emission: scalars, preserved unknowns, then `[servers]`
    /// (addresses in lexicographic order, overrides, `try`), then
    /// `[forced-hosts]`
    pub fn serialize(&self) -> String {
        let mut doc = DocumentMut::new();
        doc["config-version"] = value(self.config_version.as_str());
        doc["bind"] = value(self.bind.as_str());
        doc["motd"] = value(self.motd.as_str());
        doc["show-max-players"] = value(self.show_max_players);
        doc["online-mode"] = value(self.online_mode);
        doc["player-info-forwarding-mode"] = value(self.forwarding_mode.as_str());
        doc["forwarding-secret"] = value(self.forwarding_secret.as_str());
        for (key, item) in &self.extra_root {
            doc[key.as_str()] = item.clone();
        }

        let mut servers = Table::new();
        for (name, address) in &self.servers {
            servers[name.as_str()] = value(address.as_str());
        }
        for (name, ov) in &self.overrides {
            if let Some(restricted) = ov.restricted {
                servers[format!("{name}{OVERRIDE_RESTRICTED}").as_str()] = value(restricted);
            }
            if let Some(mode) = &ov.forwarding_mode {
                servers[format!("{name}{OVERRIDE_FORWARDING_MODE}").as_str()] =
                    value(mode.as_str());
            }
            if let Some(secret) = &ov.forwarding_secret {
                servers[format!("{name}{OVERRIDE_FORWARDING_SECRET}").as_str()] =
                    value(secret.as_str());
            }
        }
        for (key, item) in &self.extra_servers {
            servers[key.as_str()] = item.clone();
        }
        let mut try_arr = Array::new();
        for name in &self.try_order {
            try_arr.push(name.as_str());
        }
        servers["try"] = value(try_arr);
        doc["servers"] = Item::Table(servers);

        let mut forced = Table::new();
        for (host, names) in &self.forced_hosts {
            let mut arr = Array::new();
            for name in names {
                arr.push(name.as_str());
            }
            forced[host.as_str()] = value(arr);
        }
        doc["forced-hosts"] = Item::Table(forced);

        doc.to_string()
    }

    /// register or re-point a back-end; idempotent
    pub fn upsert_server(&mut self, name: &str, address: &str) {
        self.servers.insert(name.to_string(), address.to_string());
    }

    pub fn ensure_try(&mut self, name: &str) {
        if !self.try_order.iter().any(|n| n == name) {
            self.try_order.push(name.to_string());
        }
    }

    pub fn set_forced_host(&mut self, host: &str, name: &str) {
        let names = self.forced_hosts.entry(host.to_string()).or_default();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }

    /// drop every trace of a back-end: address, overrides, `try`, forced
    /// hosts (pruning emptied host entries). returns true when anything
    /// changed.
    pub fn remove_server(&mut self, name: &str) -> bool {
        let mut changed = self.servers.remove(name).is_some();
        changed |= self.overrides.remove(name).is_some();
        let before = self.try_order.len();
        self.try_order.retain(|n| n != name);
        changed |= self.try_order.len() != before;
        let mut emptied = Vec::new();
        for (host, names) in self.forced_hosts.iter_mut() {
            let before = names.len();
            names.retain(|n| n != name);
            changed |= names.len() != before;
            if names.is_empty() {
                emptied.push(host.clone());
            }
        }
        for host in emptied {
            self.forced_hosts.remove(&host);
        }
        changed
    }

    /// true when the back-end name appears anywhere in the config
    pub fn mentions(&self, name: &str) -> bool {
        self.servers.contains_key(name)
            || self.overrides.contains_key(name)
            || self.try_order.iter().any(|n| n == name)
            || self.forced_hosts.values().any(|ns| ns.iter().any(|n| n == name))
    }
}

fn str_of(item: &Item) -> String {
    item.as_str().unwrap_or_default().to_string()
}
