//! in-memory fakes for the gateway and store traits, shared by the unit
//! tests across modules

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::gateways::porkbun::{qualify_target, srv_name, DnsProvider, DnsRecord};
use crate::gateways::portainer::{
    Container, ContainerEngine, Environment, ExecResult, PortBinding, Stack,
};
use crate::gateways::webdav::SharedFs;
use crate::helpers::metrics::Metrics;
use crate::objects::proxy::{ProxyDefinition, ProxyKind};
use crate::objects::server::{
    ForwardingMode, GameSettings, ServerConfig, ServerRecord, ServerStatus,
};
use crate::objects::user::User;
use crate::settings::Settings;
use crate::store::{ServerStore, UserStore};
use crate::{Error, Result};

/// the prometheus default registry rejects duplicate registration, so every
/// test shares one Metrics value
pub fn metrics() -> Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::new).clone()
}

pub fn user(email: &str) -> User {
    User {
        email: email.to_string(),
        password_hash: "argon2id$test".into(),
        is_admin: false,
        max_servers: 3,
        reserved_ports: BTreeSet::new(),
        reserved_port_ranges: Vec::new(),
        deleted: false,
    }
}

pub fn server(name: &str, owner: &str, port: u16) -> ServerRecord {
    let unique_id = uuid::Uuid::new_v4().to_string();
    ServerRecord {
        folder_path: format!("/mc/{}/{unique_id}", owner.split('@').next().unwrap_or("u")),
        unique_id,
        owner_email: owner.to_string(),
        server_name: name.to_string(),
        subdomain_name: Some(name.to_string()),
        is_online: false,
        created_at: Utc::now(),
        status: ServerStatus::Ready,
        dns_pending: false,
        config: ServerConfig::Paper {
            base: GameSettings {
                version: "1.21.8".into(),
                port,
                rcon_port: None,
                memory_mb: 2048,
                motd: "a test server".into(),
                forwarding_mode: ForwardingMode::Modern,
                forwarding_secret: None,
            },
        },
    }
}

pub fn settings() -> Arc<Settings> {
    Arc::new(Settings {
        portainer_url: "http://portainer.test".into(),
        portainer_api_key: Some("test-key".into()),
        portainer_username: None,
        portainer_password: None,
        portainer_env_id: Some(1),
        webdav_url: "http://dav.test".into(),
        webdav_username: "dav".into(),
        webdav_password: "dav".into(),
        webdav_base_path: "/".into(),
        minecraft_path: "/mc".into(),
        velocity_config_path: "/proxies".into(),
        velocity_network_name: "mc-overlay".into(),
        root_domain: "example.dev".into(),
        porkbun_api_key: "pk".into(),
        porkbun_secret_key: "sk".into(),
        mongodb_uri: "mongodb://unused".into(),
        delete_server_folders: false,
        proxy_definitions_path: PathBuf::from("/nonexistent/proxies.yaml"),
        bind_addr: "127.0.0.1:0".into(),
        io_timeout: Duration::from_secs(10),
    })
}

pub fn proxy_def(id: &str) -> ProxyDefinition {
    ProxyDefinition {
        id: id.to_string(),
        name: format!("mcproxy-{id}"),
        host: format!("mcproxy-{id}"),
        external_port: 25565,
        config_path: id.to_string(),
        network_name: "mc-overlay".into(),
        memory: "1g".into(),
        kind: ProxyKind::Velocity,
        image: None,
        enabled: true,
    }
}

/// write a definitions file into the OS temp dir; callers remove it
pub fn write_defs_file(defs: &[ProxyDefinition]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("hopper-defs-{}.yaml", uuid::Uuid::new_v4()));
    std::fs::write(&path, serde_yaml::to_string(defs).unwrap()).unwrap();
    path
}

#[derive(Default)]
pub struct FakeEngine {
    pub stacks: Mutex<Vec<Stack>>,
    pub containers: Mutex<Vec<Container>>,
    pub networks: Mutex<BTreeSet<String>>,
    pub execs: Mutex<Vec<Vec<String>>>,
    pub stopped_stacks: Mutex<Vec<String>>,
    pub fail_create_stack: AtomicBool,
    next_id: AtomicI64,
}

impl FakeEngine {
    pub fn new() -> Self {
        FakeEngine::default()
    }

    pub fn seed_running_container(&self, name: &str, public_ports: &[u16]) {
        self.containers.lock().unwrap().push(Container {
            id: format!("cid-{name}"),
            names: vec![format!("/{name}")],
            image: "itzg/minecraft-server:latest".into(),
            state: "running".into(),
            ports: public_ports
                .iter()
                .map(|p| PortBinding {
                    private_port: 25565,
                    public_port: Some(*p),
                    proto: "tcp".into(),
                })
                .collect(),
        });
    }

    pub fn stack_names(&self) -> Vec<String> {
        self.stacks.lock().unwrap().iter().map(|s| s.name.clone()).collect()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        self.execs.lock().unwrap().clone()
    }

    /// read service container names and published host ports out of the
    /// compose text, the way the engine would materialize them
    fn materialize(&self, compose_text: &str) {
        let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(compose_text) else {
            return;
        };
        let Some(services) = value.get("services").and_then(|s| s.as_mapping()) else {
            return;
        };
        for (key, service) in services {
            let name = service
                .get("container_name")
                .and_then(|v| v.as_str())
                .or_else(|| key.as_str())
                .unwrap_or_default()
                .to_string();
            let ports = service
                .get("ports")
                .and_then(|p| p.as_sequence())
                .map(|seq| {
                    seq.iter()
                        .filter_map(|v| v.as_str())
                        .filter_map(|s| s.split(':').next())
                        .filter_map(|h| h.parse::<u16>().ok())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            self.seed_running_container(&name, &ports);
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_environments(&self) -> Result<Vec<Environment>> {
        Ok(vec![Environment {
            id: 1,
            name: "primary".into(),
        }])
    }

    async fn first_environment_id(&self) -> Result<i64> {
        Ok(1)
    }

    async fn list_stacks(&self) -> Result<Vec<Stack>> {
        Ok(self.stacks.lock().unwrap().clone())
    }

    async fn get_stack_by_name(&self, name: &str) -> Result<Option<Stack>> {
        Ok(self
            .stacks
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn create_stack(&self, name: &str, compose_text: &str, env_id: i64) -> Result<Stack> {
        if self.fail_create_stack.load(Ordering::SeqCst) {
            return Err(Error::Engine {
                status: 500,
                message: "injected stack failure".into(),
            });
        }
        let stack = Stack {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            name: name.to_string(),
            endpoint_id: env_id,
        };
        self.stacks.lock().unwrap().push(stack.clone());
        self.materialize(compose_text);
        Ok(stack)
    }

    async fn delete_stack(&self, id: i64, _env_id: i64) -> Result<()> {
        let name = {
            let mut stacks = self.stacks.lock().unwrap();
            let Some(pos) = stacks.iter().position(|s| s.id == id) else {
                return Err(Error::Engine {
                    status: 404,
                    message: "stack not found".into(),
                });
            };
            stacks.remove(pos).name
        };
        self.containers
            .lock()
            .unwrap()
            .retain(|c| c.name() != name);
        Ok(())
    }

    async fn stop_stack(&self, id: i64, _env_id: i64) -> Result<()> {
        let stacks = self.stacks.lock().unwrap();
        let Some(stack) = stacks.iter().find(|s| s.id == id) else {
            return Err(Error::Engine {
                status: 404,
                message: "stack not found".into(),
            });
        };
        self.stopped_stacks.lock().unwrap().push(stack.name.clone());
        for container in self.containers.lock().unwrap().iter_mut() {
            if container.name() == stack.name {
                container.state = "exited".into();
            }
        }
        Ok(())
    }

    async fn list_containers(&self, _env_id: i64) -> Result<Vec<Container>> {
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn find_containers(
        &self,
        env_id: i64,
        image: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<Container>> {
        Ok(self
            .list_containers(env_id)
            .await?
            .into_iter()
            .filter(|c| image.is_none_or(|i| c.image.starts_with(i)))
            .filter(|c| name.is_none_or(|n| c.name().contains(n)))
            .collect())
    }

    async fn get_container(&self, identifier: &str, _env_id: i64) -> Result<Option<Container>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name() == identifier || c.id.starts_with(identifier))
            .cloned())
    }

    async fn start_container(&self, id: &str, _env_id: i64) -> Result<()> {
        for container in self.containers.lock().unwrap().iter_mut() {
            if container.id == id || container.name() == id {
                container.state = "running".into();
                return Ok(());
            }
        }
        Err(Error::Engine {
            status: 404,
            message: "container not found".into(),
        })
    }

    async fn stop_container(&self, id: &str, _env_id: i64) -> Result<()> {
        for container in self.containers.lock().unwrap().iter_mut() {
            if container.id == id || container.name() == id {
                container.state = "exited".into();
                return Ok(());
            }
        }
        Err(Error::Engine {
            status: 404,
            message: "container not found".into(),
        })
    }

    async fn delete_container(&self, id: &str, _env_id: i64) -> Result<()> {
        self.containers
            .lock()
            .unwrap()
            .retain(|c| c.id != id && c.name() != id);
        Ok(())
    }

    async fn ensure_network(&self, name: &str, _env_id: i64) -> Result<()> {
        self.networks.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn exec(
        &self,
        _container_id: &str,
        command: &[&str],
        _env_id: i64,
    ) -> Result<ExecResult> {
        self.execs
            .lock()
            .unwrap()
            .push(command.iter().map(|s| s.to_string()).collect());
        Ok(ExecResult::default())
    }
}

#[derive(Default)]
pub struct FakeFs {
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub dirs: Mutex<BTreeSet<String>>,
}

impl FakeFs {
    pub fn new() -> Self {
        FakeFs::default()
    }

    pub fn read_string(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl SharedFs for FakeFs {
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(path)
            || self.dirs.lock().unwrap().contains(path))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let moved: Vec<(String, Vec<u8>)> = files
            .iter()
            .filter(|(k, _)| k.as_str() == from || k.starts_with(&format!("{from}/")))
            .map(|(k, v)| (k.replacen(from, to, 1), v.clone()))
            .collect();
        if moved.is_empty() && !self.dirs.lock().unwrap().contains(from) {
            return Err(Error::NotFound(from.to_string()));
        }
        files.retain(|k, _| k.as_str() != from && !k.starts_with(&format!("{from}/")));
        files.extend(moved);
        let mut dirs = self.dirs.lock().unwrap();
        if dirs.remove(from) {
            dirs.insert(to.to_string());
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        files.retain(|k, _| k.as_str() != path && !k.starts_with(&format!("{path}/")));
        self.dirs.lock().unwrap().remove(path);
        Ok(())
    }

    async fn mkdir_p(&self, path: &str) -> Result<()> {
        self.dirs.lock().unwrap().insert(path.to_string());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{path}/");
        Ok(self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeDns {
    pub records: Mutex<Vec<DnsRecord>>,
    pub fail_create: AtomicBool,
    next_id: AtomicI64,
}

impl FakeDns {
    pub fn new() -> Self {
        FakeDns::default()
    }

    pub fn record_names(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }
}

#[async_trait]
impl DnsProvider for FakeDns {
    async fn create_srv(
        &self,
        domain: &str,
        subdomain: &str,
        port: u16,
        target: &str,
        ttl: u32,
    ) -> Result<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("registrar returned 503".into()));
        }
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        self.records.lock().unwrap().push(DnsRecord {
            id: id.clone(),
            name: format!("{}.{domain}", srv_name(domain, subdomain)),
            record_type: "SRV".into(),
            content: format!("0 5 {port} {}", qualify_target(target)),
            ttl: Some(ttl.to_string()),
            prio: Some("0".into()),
        });
        Ok(id)
    }

    async fn delete_srv(&self, domain: &str, subdomain: &str) -> Result<bool> {
        let fqdn = format!("{}.{domain}", srv_name(domain, subdomain));
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| !(r.record_type == "SRV" && r.name == fqdn));
        Ok(records.len() != before)
    }

    async fn list_records(&self, _domain: &str) -> Result<Vec<DnsRecord>> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn get_record(&self, _domain: &str, id: &str) -> Result<Option<DnsRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }
}

pub struct MemUserStore {
    users: Mutex<BTreeMap<String, User>>,
}

impl MemUserStore {
    pub fn new() -> Self {
        MemUserStore {
            users: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_user(user: User) -> Self {
        let store = Self::new();
        store.seed(user);
        store
    }

    pub fn seed(&self, user: User) {
        self.users.lock().unwrap().insert(user.email.clone(), user);
    }
}

impl Default for MemUserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStore for MemUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .get(&email.to_ascii_lowercase())
            .filter(|u| !u.deleted)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<User>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .values()
            .filter(|u| !u.deleted)
            .cloned()
            .collect())
    }

    async fn upsert(&self, user: &User) -> Result<()> {
        user.validate_reservations()?;
        self.seed(user.clone());
        Ok(())
    }
}

pub struct MemServerStore {
    servers: Mutex<BTreeMap<String, ServerRecord>>,
}

impl MemServerStore {
    pub fn new() -> Self {
        MemServerStore {
            servers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn seed(&self, server: ServerRecord) {
        self.servers
            .lock()
            .unwrap()
            .insert(server.unique_id.clone(), server);
    }

    pub fn names(&self) -> Vec<String> {
        self.servers
            .lock()
            .unwrap()
            .values()
            .map(|s| s.server_name.clone())
            .collect()
    }
}

impl Default for MemServerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerStore for MemServerStore {
    async fn list(&self) -> Result<Vec<ServerRecord>> {
        Ok(self.servers.lock().unwrap().values().cloned().collect())
    }

    async fn list_by_owner(&self, email: &str) -> Result<Vec<ServerRecord>> {
        Ok(self
            .servers
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.owner_email == email)
            .cloned()
            .collect())
    }

    async fn find_by_unique_id(&self, unique_id: &str) -> Result<Option<ServerRecord>> {
        Ok(self.servers.lock().unwrap().get(unique_id).cloned())
    }

    async fn find_by_name(&self, server_name: &str) -> Result<Option<ServerRecord>> {
        Ok(self
            .servers
            .lock()
            .unwrap()
            .values()
            .find(|s| s.server_name == server_name)
            .cloned())
    }

    async fn insert(&self, server: &ServerRecord) -> Result<()> {
        let mut servers = self.servers.lock().unwrap();
        if servers.contains_key(&server.unique_id)
            || servers.values().any(|s| {
                s.server_name == server.server_name || s.folder_path == server.folder_path
            })
        {
            return Err(Error::Conflict("server already exists".into()));
        }
        servers.insert(server.unique_id.clone(), server.clone());
        Ok(())
    }

    async fn update(&self, server: &ServerRecord) -> Result<()> {
        let mut servers = self.servers.lock().unwrap();
        if !servers.contains_key(&server.unique_id) {
            return Err(Error::NotFound(server.unique_id.clone()));
        }
        servers.insert(server.unique_id.clone(), server.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        unique_id: &str,
        status: ServerStatus,
        is_online: bool,
    ) -> Result<()> {
        if let Some(server) = self.servers.lock().unwrap().get_mut(unique_id) {
            server.status = status;
            server.is_online = is_online;
        }
        Ok(())
    }

    async fn set_dns_pending(&self, unique_id: &str, pending: bool) -> Result<()> {
        if let Some(server) = self.servers.lock().unwrap().get_mut(unique_id) {
            server.dns_pending = pending;
        }
        Ok(())
    }

    async fn delete(&self, unique_id: &str) -> Result<()> {
        self.servers.lock().unwrap().remove(unique_id);
        Ok(())
    }
}
