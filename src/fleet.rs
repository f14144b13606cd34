use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, field, info, instrument, warn, Span};

use crate::codec::bungee::BungeeConfig;
use crate::codec::velocity::VelocityConfig;
use crate::compose;
use crate::gateways::porkbun::{DnsProvider, DEFAULT_TTL};
use crate::gateways::portainer::ContainerEngine;
use crate::gateways::webdav::SharedFs;
use crate::helpers::metrics::Metrics;
use crate::helpers::state::State;
use crate::helpers::telemetry;
use crate::lifecycle;
use crate::objects::proxy::{ProxyDefinition, ProxyDefinitions, ProxyKind, MANAGED_PREFIX};
use crate::objects::server::{ServerRecord, GAME_PORT};
use crate::settings::Settings;
use crate::store::ServerStore;
use crate::{Error, Result};

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(600);
const RECONCILE_JITTER_SECS: u64 = 30;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    /// the engine reports a running container for the definition
    Healthy,
    /// no running container and the last provision attempt failed
    Missing,
}

/// liveness snapshot of one declared proxy
#[derive(Serialize, Debug, Clone)]
pub struct ProxyHealth {
    pub id: String,
    pub name: String,
    pub kind: ProxyKind,
    pub status: ProxyStatus,
    pub container_id: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct FleetReport {
    pub created: Vec<String>,
    pub failed: Vec<String>,
    pub stopped_orphans: Vec<String>,
    pub registrations: usize,
    pub dns_retried: usize,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct SyncReport {
    pub recreated: Vec<String>,
    pub failed: Vec<String>,
    /// containers matching the server naming convention without a DB row;
    /// reported, never destroyed
    pub orphans: Vec<String>,
}

/// keeps the declared proxy fleet matched with running containers and every
/// proxy config matched with the database of servers
pub struct ProxyFleet {
    engine: Arc<dyn ContainerEngine>,
    fs: Arc<dyn SharedFs>,
    dns: Arc<dyn DnsProvider>,
    servers: Arc<dyn ServerStore>,
    settings: Arc<Settings>,
    defs: Mutex<ProxyDefinitions>,
    registry: StdRwLock<HashMap<String, ProxyHealth>>,
    config_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// serializes the timer against admin-triggered passes
    reconcile_lock: Mutex<()>,
    state: Arc<StdRwLock<State>>,
    metrics: Metrics,
}

impl ProxyFleet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        fs: Arc<dyn SharedFs>,
        dns: Arc<dyn DnsProvider>,
        servers: Arc<dyn ServerStore>,
        settings: Arc<Settings>,
        state: Arc<StdRwLock<State>>,
        metrics: Metrics,
    ) -> Self {
        let defs = Mutex::new(ProxyDefinitions::new(settings.proxy_definitions_path.clone()));
        ProxyFleet {
            engine,
            fs,
            dns,
            servers,
            settings,
            defs,
            registry: StdRwLock::new(HashMap::new()),
            config_locks: std::sync::Mutex::new(HashMap::new()),
            reconcile_lock: Mutex::new(()),
            state,
            metrics,
        }
    }

    pub async fn definitions(&self) -> Result<Arc<Vec<ProxyDefinition>>> {
        self.defs.lock().await.load()
    }

    fn config_lock(&self, proxy_id: &str) -> Arc<Mutex<()>> {
        self.config_locks
            .lock()
            .expect("config lock table")
            .entry(proxy_id.to_string())
            .or_default()
            .clone()
    }

    fn config_dir(&self, def: &ProxyDefinition) -> String {
        format!(
            "{}/{}",
            self.settings.velocity_config_path.trim_end_matches('/'),
            def.config_path
        )
    }

    fn config_file(&self, def: &ProxyDefinition) -> String {
        format!("{}/{}", self.config_dir(def), def.kind.config_file())
    }

    fn forced_host(&self, server: &ServerRecord) -> Option<String> {
        server
            .subdomain_name
            .as_ref()
            .map(|sub| format!("{sub}.{}", self.settings.root_domain))
    }

    fn mark(&self, def: &ProxyDefinition, status: ProxyStatus, container_id: Option<String>) {
        self.registry.write().expect("proxy registry").insert(
            def.id.clone(),
            ProxyHealth {
                id: def.id.clone(),
                name: def.name.clone(),
                kind: def.kind,
                status,
                container_id,
                last_seen: Utc::now(),
            },
        );
    }

    /// liveness snapshot per declared proxy
    pub fn health(&self) -> Vec<ProxyHealth> {
        let mut all: Vec<ProxyHealth> = self
            .registry
            .read()
            .expect("proxy registry")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// one full reconcile pass: create missing proxies, stop orphan stacks,
    /// re-register every server into every proxy, retry pending DNS
    #[instrument(skip(self), fields(trace_id))]
    pub async fn ensure_fleet(&self, env_id: i64) -> Result<FleetReport> {
        let _pass = self.reconcile_lock.lock().await;
        Span::current().record("trace_id", field::display(telemetry::get_trace_id()));
        let start = Instant::now();

        let defs = self.definitions().await?;
        let db_servers = self.servers.list().await?;
        let containers = self.engine.list_containers(env_id).await?;
        let mut report = FleetReport::default();

        for def in defs.iter().filter(|d| d.enabled) {
            let running = containers
                .iter()
                .find(|c| c.name() == def.name && c.is_running());
            if let Some(container) = running {
                self.mark(def, ProxyStatus::Healthy, Some(container.id.clone()));
                continue;
            }
            match self.provision(def, &defs, &db_servers, env_id).await {
                Ok(()) => {
                    self.mark(def, ProxyStatus::Healthy, None);
                    report.created.push(def.name.clone());
                }
                Err(e) => {
                    warn!(proxy = %def.id, error = %e, "failed to provision proxy");
                    self.mark(def, ProxyStatus::Missing, None);
                    report.failed.push(def.name.clone());
                }
            }
        }

        // stacks that look managed but are no longer declared get stopped,
        // never deleted
        for stack in self.engine.list_stacks().await? {
            if stack.name.starts_with(MANAGED_PREFIX)
                && !defs.iter().any(|d| d.name == stack.name)
            {
                match self.engine.stop_stack(stack.id, env_id).await {
                    Ok(()) => {
                        info!(stack = %stack.name, "stopped orphan proxy stack");
                        report.stopped_orphans.push(stack.name);
                    }
                    Err(e) => warn!(stack = %stack.name, error = %e, "failed to stop orphan"),
                }
            }
        }

        // re-registering everything every pass also migrates existing
        // servers onto newly defined proxies
        for server in &db_servers {
            for def in defs.iter().filter(|d| d.enabled) {
                match self.register_on(def, server, env_id).await {
                    Ok(true) => report.registrations += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(proxy = %def.id, server = %server.server_name, error = %e,
                              "registration failed");
                    }
                }
            }
        }

        report.dns_retried = self.retry_pending_dns(&db_servers).await;

        self.state.write().expect("state").mark_reconcile();
        self.metrics
            .fleet_reconcile_duration
            .with_label_values::<&str>(&[])
            .observe(start.elapsed().as_millis() as f64 / 1000.0);
        self.metrics.fleet_handled_events.inc();
        info!(
            created = report.created.len(),
            orphans = report.stopped_orphans.len(),
            registrations = report.registrations,
            "fleet reconciled"
        );
        Ok(report)
    }

    /// bring back-end game containers in line with the DB: recreate missing
    /// stacks, report (but never destroy) unknown mc- containers
    #[instrument(skip(self))]
    pub async fn sync_servers(&self, env_id: i64) -> Result<SyncReport> {
        let db_servers = self.servers.list().await?;
        let containers = self.engine.list_containers(env_id).await?;
        let defs = self.definitions().await?;
        let networks: Vec<String> = defs.iter().map(|d| d.network_name.clone()).collect();
        let mut report = SyncReport::default();

        for server in &db_servers {
            let name = server.container_name();
            if containers.iter().any(|c| c.name() == name) {
                continue;
            }
            // a stale stack without its container blocks recreation
            if let Some(stack) = self.engine.get_stack_by_name(&name).await? {
                if let Err(e) = self.engine.delete_stack(stack.id, env_id).await {
                    warn!(server = %name, error = %e, "could not remove stale stack");
                }
            }
            match lifecycle::deploy_server_stack(
                self.engine.as_ref(),
                server,
                &networks,
                env_id,
            )
            .await
            {
                Ok(_) => {
                    info!(server = %name, "recreated missing server stack");
                    report.recreated.push(name);
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "failed to recreate server stack");
                    report.failed.push(name);
                }
            }
        }

        let known: Vec<String> = db_servers.iter().map(|s| s.container_name()).collect();
        for container in &containers {
            let name = container.name();
            if name.starts_with("mc-") && !known.iter().any(|k| k == name) {
                warn!(container = name, "orphan game container (no DB row); leaving untouched");
                report.orphans.push(name.to_string());
            }
        }
        Ok(report)
    }

    /// register a new back-end on every enabled proxy of the preferred kind
    pub async fn add_server_to_all_proxies(
        &self,
        server: &ServerRecord,
        env_id: i64,
    ) -> Result<()> {
        let defs = self.definitions().await?;
        for def in defs
            .iter()
            .filter(|d| d.enabled && d.kind == ProxyKind::Velocity)
        {
            self.register_on(def, server, env_id).await?;
        }
        Ok(())
    }

    /// remove every trace of a back-end from every declared proxy config
    pub async fn remove_server_from_all_proxies(
        &self,
        server_name: &str,
        _unique_id: Option<&str>,
        env_id: i64,
    ) -> Result<()> {
        let defs = self.definitions().await?;
        for def in defs.iter() {
            self.deregister_on(def, server_name, env_id).await?;
        }
        Ok(())
    }

    /// read-modify-write one proxy config under its lock; returns true when
    /// the file changed on disk
    async fn register_on(
        &self,
        def: &ProxyDefinition,
        server: &ServerRecord,
        env_id: i64,
    ) -> Result<bool> {
        let lock = self.config_lock(&def.id);
        let _guard = lock.lock().await;

        let path = self.config_file(def);
        let existing = match self.fs.read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let address = server.backend_address();
        let forced_host = self.forced_host(server);

        let rendered = match def.kind {
            ProxyKind::Velocity => {
                let mut cfg = match &existing {
                    Some(bytes) => VelocityConfig::parse(&String::from_utf8_lossy(bytes))?,
                    None => {
                        let secret = generate_secret();
                        self.fs
                            .write(
                                &format!("{}/forwarding.secret", self.config_dir(def)),
                                secret.as_bytes(),
                            )
                            .await?;
                        VelocityConfig::template(def.kind.listen_port(), &secret)
                    }
                };
                cfg.upsert_server(&server.server_name, &address);
                cfg.ensure_try(&server.server_name);
                if let Some(host) = &forced_host {
                    cfg.set_forced_host(host, &server.server_name);
                }
                cfg.serialize()
            }
            ProxyKind::Bungeecord | ProxyKind::Waterfall => {
                let mut cfg = match &existing {
                    Some(bytes) => BungeeConfig::parse(&String::from_utf8_lossy(bytes))?,
                    None => BungeeConfig::template(
                        def.kind.listen_port(),
                        "&1A Hopper Proxy",
                        def.kind == ProxyKind::Waterfall,
                    ),
                };
                cfg.upsert_server(
                    &server.server_name,
                    &address,
                    &server.config.base().motd,
                );
                cfg.ensure_priority(&server.server_name);
                if let Some(host) = &forced_host {
                    cfg.set_forced_host(host, &server.server_name);
                }
                cfg.serialize()
            }
        };

        let changed = existing.as_deref() != Some(rendered.as_bytes());
        if changed {
            self.fs.write(&path, rendered.as_bytes()).await?;
            debug!(proxy = %def.id, server = %server.server_name, "registered back-end");
            self.reload_proxy(def, env_id).await;
        }
        Ok(changed)
    }

    async fn deregister_on(
        &self,
        def: &ProxyDefinition,
        server_name: &str,
        env_id: i64,
    ) -> Result<bool> {
        let lock = self.config_lock(&def.id);
        let _guard = lock.lock().await;

        let path = self.config_file(def);
        let existing = match self.fs.read(&path).await {
            Ok(bytes) => bytes,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let (changed, rendered) = match def.kind {
            ProxyKind::Velocity => {
                let mut cfg = VelocityConfig::parse(&String::from_utf8_lossy(&existing))?;
                (cfg.remove_server(server_name), cfg.serialize())
            }
            ProxyKind::Bungeecord | ProxyKind::Waterfall => {
                let mut cfg = BungeeConfig::parse(&String::from_utf8_lossy(&existing))?;
                (cfg.remove_server(server_name), cfg.serialize())
            }
        };

        if changed {
            self.fs.write(&path, rendered.as_bytes()).await?;
            debug!(proxy = %def.id, server = server_name, "deregistered back-end");
            self.reload_proxy(def, env_id).await;
        }
        Ok(changed)
    }

    /// best-effort nudge after a config write; velocity picks the file up on
    /// `velocity reload`, bungee-family proxies reload on their own
    async fn reload_proxy(&self, def: &ProxyDefinition, env_id: i64) {
        if def.kind != ProxyKind::Velocity {
            return;
        }
        let container = match self.engine.get_container(&def.name, env_id).await {
            Ok(Some(c)) if c.is_running() => c,
            _ => return,
        };
        if let Err(e) = self
            .engine
            .exec(&container.id, &["velocity", "reload"], env_id)
            .await
        {
            debug!(proxy = %def.id, error = %e, "velocity reload failed (non-fatal)");
        }
    }

    /// materialize one declared proxy: config dir, synthesized config with a
    /// fresh forwarding secret, overlay network, stack
    async fn provision(
        &self,
        def: &ProxyDefinition,
        all_defs: &[ProxyDefinition],
        db_servers: &[ServerRecord],
        env_id: i64,
    ) -> Result<()> {
        let dir = self.config_dir(def);
        self.fs.mkdir_p(&dir).await?;

        let path = self.config_file(def);
        if !self.fs.exists(&path).await? {
            let secret = generate_secret();
            let text = self.synthesize_config(def, all_defs, db_servers, &secret).await?;
            self.fs.write(&path, text.as_bytes()).await?;
            self.fs
                .write(&format!("{dir}/forwarding.secret"), secret.as_bytes())
                .await?;
            info!(proxy = %def.id, "synthesized proxy config");
        }

        self.engine.ensure_network(&def.network_name, env_id).await?;
        let stack = compose::for_proxy(def, &self.settings);
        self.engine.create_stack(&def.name, &stack, env_id).await?;
        info!(proxy = %def.id, stack = %def.name, "deployed proxy stack");
        Ok(())
    }

    /// build a config for a proxy that has none: mirror a sibling of the
    /// same kind when one has data, otherwise seed from the database
    async fn synthesize_config(
        &self,
        def: &ProxyDefinition,
        all_defs: &[ProxyDefinition],
        db_servers: &[ServerRecord],
        secret: &str,
    ) -> Result<String> {
        match def.kind {
            ProxyKind::Velocity => {
                let mut cfg = VelocityConfig::template(def.kind.listen_port(), secret);
                if let Some(sibling) = self.mirror_velocity_sibling(def, all_defs).await {
                    cfg.servers = sibling.servers;
                    cfg.try_order = sibling.try_order;
                    cfg.forced_hosts = sibling.forced_hosts;
                } else {
                    for server in db_servers {
                        cfg.upsert_server(&server.server_name, &server.backend_address());
                        cfg.ensure_try(&server.server_name);
                        if let Some(host) = self.forced_host(server) {
                            cfg.set_forced_host(&host, &server.server_name);
                        }
                    }
                }
                Ok(cfg.serialize())
            }
            ProxyKind::Bungeecord | ProxyKind::Waterfall => {
                let mut cfg = BungeeConfig::template(
                    def.kind.listen_port(),
                    "&1A Hopper Proxy",
                    def.kind == ProxyKind::Waterfall,
                );
                for server in db_servers {
                    cfg.upsert_server(
                        &server.server_name,
                        &server.backend_address(),
                        &server.config.base().motd,
                    );
                    cfg.ensure_priority(&server.server_name);
                    if let Some(host) = self.forced_host(server) {
                        cfg.set_forced_host(&host, &server.server_name);
                    }
                }
                Ok(cfg.serialize())
            }
        }
    }

    async fn mirror_velocity_sibling(
        &self,
        def: &ProxyDefinition,
        all_defs: &[ProxyDefinition],
    ) -> Option<VelocityConfig> {
        for sibling in all_defs
            .iter()
            .filter(|d| d.id != def.id && d.kind == ProxyKind::Velocity)
        {
            let path = self.config_file(sibling);
            let Ok(bytes) = self.fs.read(&path).await else {
                continue;
            };
            let Ok(cfg) = VelocityConfig::parse(&String::from_utf8_lossy(&bytes)) else {
                warn!(proxy = %sibling.id, "sibling config unreadable, skipping mirror");
                continue;
            };
            if !cfg.servers.is_empty() {
                debug!(from = %sibling.id, to = %def.id, "mirroring sibling proxy config");
                return Some(cfg);
            }
        }
        None
    }

    /// re-attempt SRV publication for servers created while the registrar
    /// was down
    async fn retry_pending_dns(&self, db_servers: &[ServerRecord]) -> usize {
        let mut repaired = 0;
        for server in db_servers.iter().filter(|s| s.dns_pending) {
            let Some(sub) = &server.subdomain_name else {
                continue;
            };
            let target = format!("{sub}.{}", self.settings.root_domain);
            match self
                .dns
                .create_srv(&self.settings.root_domain, sub, GAME_PORT, &target, DEFAULT_TTL)
                .await
            {
                Ok(_) => {
                    if let Err(e) = self.servers.set_dns_pending(&server.unique_id, false).await {
                        warn!(server = %server.server_name, error = %e, "could not clear dns flag");
                        continue;
                    }
                    info!(server = %server.server_name, "published deferred SRV record");
                    repaired += 1;
                }
                Err(e) => {
                    warn!(server = %server.server_name, error = %e, "deferred SRV retry failed");
                }
            }
        }
        repaired
    }

    /// periodic reconciliation: immediately on startup, then every 10
    /// minutes with bounded jitter; missed ticks are skipped, not queued
    pub async fn run(self: Arc<Self>, env_id: i64) {
        let mut ticker = interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let jitter = rand::thread_rng().gen_range(0..=RECONCILE_JITTER_SECS);
            tokio::time::sleep(Duration::from_secs(jitter)).await;
            if let Err(e) = self.ensure_fleet(env_id).await {
                warn!(error = %e, "fleet reconcile pass failed");
            }
            if let Err(e) = self.sync_servers(env_id).await {
                warn!(error = %e, "server sync pass failed");
            }
        }
    }
}

/// random token for velocity modern forwarding
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, FakeDns, FakeEngine, FakeFs, MemServerStore};

    const ENV: i64 = 1;

    struct Harness {
        fleet: Arc<ProxyFleet>,
        engine: Arc<FakeEngine>,
        fs: Arc<FakeFs>,
        dns: Arc<FakeDns>,
        servers: Arc<MemServerStore>,
        defs_path: std::path::PathBuf,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.defs_path);
        }
    }

    fn harness(defs: &[ProxyDefinition]) -> Harness {
        let engine = Arc::new(FakeEngine::new());
        let fs = Arc::new(FakeFs::new());
        let dns = Arc::new(FakeDns::new());
        let servers = Arc::new(MemServerStore::new());
        let defs_path = testutil::write_defs_file(defs);
        let mut settings = (*testutil::settings()).clone();
        settings.proxy_definitions_path = defs_path.clone();
        let fleet = Arc::new(ProxyFleet::new(
            engine.clone(),
            fs.clone(),
            dns.clone(),
            servers.clone(),
            Arc::new(settings),
            Arc::new(StdRwLock::new(State::new())),
            testutil::metrics(),
        ));
        Harness {
            fleet,
            engine,
            fs,
            dns,
            servers,
            defs_path,
        }
    }

    fn velocity_config(h: &Harness, id: &str) -> VelocityConfig {
        let text = h
            .fs
            .read_string(&format!("/proxies/{id}/velocity.toml"))
            .expect("config written");
        VelocityConfig::parse(&text).unwrap()
    }

    #[tokio::test]
    async fn ensure_fleet_provisions_missing_proxies() {
        let h = harness(&[testutil::proxy_def("main")]);
        h.servers.seed(testutil::server("alpha", "u@x.dev", 25566));

        let report = h.fleet.ensure_fleet(ENV).await.unwrap();
        assert_eq!(report.created, vec!["mcproxy-main"]);
        assert_eq!(h.engine.stack_names(), vec!["mcproxy-main"]);
        assert!(h.engine.networks.lock().unwrap().contains("mc-overlay"));

        // config seeded from the database, scenario style
        let cfg = velocity_config(&h, "main");
        let alpha = h.servers.list().await.unwrap().remove(0);
        assert_eq!(
            cfg.servers.get("alpha"),
            Some(&format!("mc-{}:25565", alpha.unique_id))
        );
        assert!(cfg.try_order.contains(&"alpha".to_string()));
        assert_eq!(cfg.forced_hosts["alpha.example.dev"], vec!["alpha"]);
        // fresh forwarding secret next to the config
        assert!(h.fs.read_string("/proxies/main/forwarding.secret").is_some());

        let health = h.fleet.health();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].status, ProxyStatus::Healthy);
    }

    #[tokio::test]
    async fn ensure_fleet_repairs_missing_config() {
        // proxy container exists but its config file is gone; a second
        // replica definition must come up with the DB contents anyway
        let h = harness(&[testutil::proxy_def("main")]);
        h.servers.seed(testutil::server("alpha", "u@x.dev", 25566));
        h.fleet.ensure_fleet(ENV).await.unwrap();
        // wipe the config and reconcile again: registration rewrites it
        h.fs.delete("/proxies/main/velocity.toml").await.unwrap();
        h.fleet.ensure_fleet(ENV).await.unwrap();
        let cfg = velocity_config(&h, "main");
        assert!(cfg.servers.contains_key("alpha"));
        assert!(cfg.try_order.contains(&"alpha".to_string()));
    }

    #[tokio::test]
    async fn new_replica_mirrors_sibling_config() {
        let h = harness(&[testutil::proxy_def("main")]);
        h.servers.seed(testutil::server("alpha", "u@x.dev", 25566));
        h.fleet.ensure_fleet(ENV).await.unwrap();

        // second replica appears in the definitions
        let defs = vec![testutil::proxy_def("main"), testutil::proxy_def("edge")];
        std::fs::write(&h.defs_path, serde_yaml::to_string(&defs).unwrap()).unwrap();

        h.fleet.ensure_fleet(ENV).await.unwrap();
        let edge = velocity_config(&h, "edge");
        assert!(edge.servers.contains_key("alpha"));
        assert!(edge.try_order.contains(&"alpha".to_string()));
    }

    #[tokio::test]
    async fn orphan_managed_stacks_are_stopped_not_deleted() {
        let h = harness(&[testutil::proxy_def("main")]);
        h.engine
            .create_stack("mcproxy-stale", "services: {}", ENV)
            .await
            .unwrap();
        let report = h.fleet.ensure_fleet(ENV).await.unwrap();
        assert_eq!(report.stopped_orphans, vec!["mcproxy-stale"]);
        // stopped, still present
        assert!(h.engine.stack_names().contains(&"mcproxy-stale".to_string()));
        assert_eq!(
            h.engine.stopped_stacks.lock().unwrap().clone(),
            vec!["mcproxy-stale"]
        );
    }

    #[tokio::test]
    async fn registration_is_idempotent_bytes() {
        let h = harness(&[testutil::proxy_def("main")]);
        let server = testutil::server("survival", "u@x.dev", 25566);
        h.fleet.ensure_fleet(ENV).await.unwrap();

        h.fleet.add_server_to_all_proxies(&server, ENV).await.unwrap();
        let once = h.fs.read_string("/proxies/main/velocity.toml").unwrap();
        for _ in 0..3 {
            h.fleet.add_server_to_all_proxies(&server, ENV).await.unwrap();
        }
        let many = h.fs.read_string("/proxies/main/velocity.toml").unwrap();
        assert_eq!(once, many);
    }

    #[tokio::test]
    async fn deregistration_leaves_no_ghosts() {
        let h = harness(&[testutil::proxy_def("main")]);
        let server = testutil::server("survival", "u@x.dev", 25566);
        h.fleet.ensure_fleet(ENV).await.unwrap();
        h.fleet.add_server_to_all_proxies(&server, ENV).await.unwrap();

        h.fleet
            .remove_server_from_all_proxies("survival", Some(&server.unique_id), ENV)
            .await
            .unwrap();
        let text = h.fs.read_string("/proxies/main/velocity.toml").unwrap();
        assert!(!text.contains("survival"));
    }

    #[tokio::test]
    async fn velocity_reload_is_nudged_after_writes() {
        let h = harness(&[testutil::proxy_def("main")]);
        h.fleet.ensure_fleet(ENV).await.unwrap();
        let server = testutil::server("survival", "u@x.dev", 25566);
        h.fleet.add_server_to_all_proxies(&server, ENV).await.unwrap();
        assert!(h
            .engine
            .exec_commands()
            .contains(&vec!["velocity".to_string(), "reload".to_string()]));
    }

    #[tokio::test]
    async fn sync_recreates_missing_server_containers() {
        let h = harness(&[testutil::proxy_def("main")]);
        let server = testutil::server("alpha", "u@x.dev", 25566);
        let container = server.container_name();
        h.servers.seed(server);

        let report = h.fleet.sync_servers(ENV).await.unwrap();
        assert_eq!(report.recreated, vec![container.clone()]);
        assert!(h.engine.container_names().contains(&container));
    }

    #[tokio::test]
    async fn sync_reports_orphan_containers_without_destroying() {
        let h = harness(&[testutil::proxy_def("main")]);
        h.engine.seed_running_container("mc-unknown", &[25900]);
        let report = h.fleet.sync_servers(ENV).await.unwrap();
        assert_eq!(report.orphans, vec!["mc-unknown"]);
        assert!(h.engine.container_names().contains(&"mc-unknown".to_string()));
    }

    #[tokio::test]
    async fn pending_dns_is_retried() {
        let h = harness(&[testutil::proxy_def("main")]);
        let mut server = testutil::server("alpha", "u@x.dev", 25566);
        server.dns_pending = true;
        h.servers.seed(server);

        let report = h.fleet.ensure_fleet(ENV).await.unwrap();
        assert_eq!(report.dns_retried, 1);
        assert_eq!(
            h.dns.record_names(),
            vec!["_minecraft._tcp.alpha.example.dev"]
        );
        assert!(!h.servers.list().await.unwrap()[0].dns_pending);
    }

    #[tokio::test]
    async fn convergence_from_divergent_state() {
        // defined proxy without container, db server without registration,
        // orphan managed stack: one pass converges all three
        let h = harness(&[testutil::proxy_def("main")]);
        h.servers.seed(testutil::server("alpha", "u@x.dev", 25566));
        h.servers.seed(testutil::server("beta", "u@x.dev", 25567));
        h.engine
            .create_stack("mcproxy-old", "services: {}", ENV)
            .await
            .unwrap();

        h.fleet.ensure_fleet(ENV).await.unwrap();

        let cfg = velocity_config(&h, "main");
        let mut names: Vec<&String> = cfg.servers.keys().collect();
        names.sort();
        assert_eq!(names, ["alpha", "beta"]);
        assert!(h.engine.container_names().contains(&"mcproxy-main".to_string()));
        assert_eq!(
            h.engine.stopped_stacks.lock().unwrap().clone(),
            vec!["mcproxy-old"]
        );
    }
}
