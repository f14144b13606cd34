use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::compose;
use crate::fleet::ProxyFleet;
use crate::gateways::porkbun::{DnsProvider, DEFAULT_TTL};
use crate::gateways::portainer::{ContainerEngine, Stack};
use crate::gateways::webdav::SharedFs;
use crate::helpers::metrics::Metrics;
use crate::helpers::retry::with_backoff;
use crate::objects::proxy::ProxyKind;
use crate::objects::server::{
    validate_server_name, ForwardingMode, GameSettings, ServerConfig, ServerKind, ServerRecord,
    ServerStatus, GAME_PORT,
};
use crate::objects::user::User;
use crate::objects::{email_local_part, is_reserved_subdomain, is_valid_dns_label};
use crate::ports::arbiter::{EnvLocks, PortArbiter};
use crate::settings::Settings;
use crate::store::{ServerStore, UserStore};
use crate::{Error, Result};

fn default_memory() -> u32 {
    2048
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewServerConfig {
    pub server_type: ServerKind,
    pub version: String,
    #[serde(default = "default_memory")]
    pub memory_mb: u32,
    #[serde(default)]
    pub motd: Option<String>,
    #[serde(default)]
    pub forwarding_mode: Option<ForwardingMode>,
    #[serde(default)]
    pub rcon_enabled: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CreateServerRequest {
    pub server_name: String,
    pub subdomain: String,
    #[serde(rename = "server_config")]
    pub config: NewServerConfig,
}

#[derive(Serialize, Debug, Clone)]
pub struct StepOutcome {
    pub step: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StepOutcome {
    fn ok(step: &'static str) -> Self {
        StepOutcome {
            step,
            success: true,
            detail: None,
        }
    }

    fn failed(step: &'static str, error: &Error) -> Self {
        StepOutcome {
            step,
            success: false,
            detail: Some(error.to_string()),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct CreatedServer {
    pub unique_id: String,
    pub server_name: String,
    pub port: u16,
    pub success: bool,
    pub details: Vec<StepOutcome>,
}

#[derive(Serialize, Debug, Clone)]
pub struct DeleteReport {
    pub success: bool,
    pub details: Vec<StepOutcome>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SubdomainCheck {
    pub is_valid: bool,
    pub is_reserved: bool,
    pub can_use: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct Availability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rcon_port: Option<u16>,
    pub is_reserved: bool,
    pub reserved_ports: Vec<u16>,
}

/// ensure the overlay networks exist, then materialize the server's stack
pub async fn deploy_server_stack(
    engine: &dyn ContainerEngine,
    server: &ServerRecord,
    networks: &[String],
    env_id: i64,
) -> Result<Stack> {
    for network in networks {
        engine.ensure_network(network, env_id).await?;
    }
    let compose_text = compose::for_server(server, networks);
    engine
        .create_stack(&server.container_name(), &compose_text, env_id)
        .await
}

/// end-to-end server lifecycle: create, start, stop, delete, and crash
/// recovery. effect order on create is port -> data dir -> stack -> proxies
/// -> DNS; deletion reverses it and tolerates partial failure.
pub struct ServerLifecycle {
    engine: Arc<dyn ContainerEngine>,
    fs: Arc<dyn SharedFs>,
    dns: Arc<dyn DnsProvider>,
    users: Arc<dyn UserStore>,
    servers: Arc<dyn ServerStore>,
    arbiter: Arc<PortArbiter>,
    fleet: Arc<ProxyFleet>,
    settings: Arc<Settings>,
    locks: Arc<EnvLocks>,
    metrics: Metrics,
}

impl ServerLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        fs: Arc<dyn SharedFs>,
        dns: Arc<dyn DnsProvider>,
        users: Arc<dyn UserStore>,
        servers: Arc<dyn ServerStore>,
        arbiter: Arc<PortArbiter>,
        fleet: Arc<ProxyFleet>,
        settings: Arc<Settings>,
        locks: Arc<EnvLocks>,
        metrics: Metrics,
    ) -> Self {
        ServerLifecycle {
            engine,
            fs,
            dns,
            users,
            servers,
            arbiter,
            fleet,
            settings,
            locks,
            metrics,
        }
    }

    #[instrument(skip(self, caller, req), fields(server = %req.server_name))]
    pub async fn create(
        &self,
        caller: &User,
        req: CreateServerRequest,
        env_id: i64,
    ) -> Result<CreatedServer> {
        let start = Instant::now();
        validate_server_name(&req.server_name)?;
        let subdomain = req.subdomain.trim().to_ascii_lowercase();
        if !is_valid_dns_label(&subdomain) {
            return Err(Error::Validation(format!(
                "'{subdomain}' is not a valid subdomain"
            )));
        }
        if is_reserved_subdomain(&subdomain) && !caller.is_admin {
            return Err(Error::Authorization(format!(
                "subdomain '{subdomain}' is reserved"
            )));
        }
        if self.servers.find_by_name(&req.server_name).await?.is_some() {
            return Err(Error::Conflict(format!(
                "server name '{}' is taken",
                req.server_name
            )));
        }
        let owned = self.servers.list_by_owner(&caller.email).await?;
        if !caller.is_admin && owned.len() as u32 >= caller.max_servers {
            return Err(Error::Authorization(format!(
                "server quota of {} reached",
                caller.max_servers
            )));
        }

        // the environment lock spans port arbitration through draft-row
        // persistence; nothing else may allocate meanwhile
        let lock = self.locks.for_env(env_id);
        let guard = lock.lock().await;
        let alloc = self
            .arbiter
            .allocate_locked(&caller.email, req.config.rcon_enabled, env_id)
            .await?;

        let unique_id = Uuid::new_v4().to_string();
        let folder_path = format!(
            "{}/{}/{unique_id}",
            self.settings.minecraft_path.trim_end_matches('/'),
            email_local_part(&caller.email)?
        );
        let forwarding_mode = req.config.forwarding_mode.unwrap_or_else(|| {
            if req.config.server_type.supports_modern_forwarding() {
                ForwardingMode::Modern
            } else {
                ForwardingMode::Legacy
            }
        });
        let forwarding_secret = if forwarding_mode == ForwardingMode::Modern {
            self.proxy_forwarding_secret().await
        } else {
            None
        };
        let config = ServerConfig::new(
            req.config.server_type,
            GameSettings {
                version: req.config.version.clone(),
                port: alloc.port,
                rcon_port: alloc.rcon_port,
                memory_mb: req.config.memory_mb,
                motd: req
                    .config
                    .motd
                    .clone()
                    .unwrap_or_else(|| format!("{} on hopper", req.server_name)),
                forwarding_mode,
                forwarding_secret,
            },
        );
        config.validate()?;
        let mut record = ServerRecord {
            unique_id: unique_id.clone(),
            owner_email: caller.email.clone(),
            server_name: req.server_name.clone(),
            subdomain_name: Some(subdomain.clone()),
            folder_path: folder_path.clone(),
            is_online: false,
            created_at: Utc::now(),
            status: ServerStatus::Creating,
            dns_pending: false,
            config,
        };

        let mut details = Vec::new();

        // draft row claims the port and every uniqueness constraint
        self.servers.insert(&record).await?;
        details.push(StepOutcome::ok("persist-draft"));

        if let Err(e) = with_backoff("mkdir data dir", || self.fs.mkdir_p(&folder_path)).await {
            let _ = self.servers.delete(&unique_id).await;
            return Err(e);
        }
        details.push(StepOutcome::ok("data-directory"));

        let defs = self.fleet.definitions().await?;
        let mut networks: Vec<String> = defs.iter().map(|d| d.network_name.clone()).collect();
        networks.sort();
        networks.dedup();
        if networks.is_empty() {
            networks.push(self.settings.velocity_network_name.clone());
        }
        if let Err(e) =
            deploy_server_stack(self.engine.as_ref(), &record, &networks, env_id).await
        {
            // reverse-order rollback: stack remnants, then the draft row
            // (which releases the port)
            if let Ok(Some(stack)) = self.engine.get_stack_by_name(&record.container_name()).await
            {
                let _ = self.engine.delete_stack(stack.id, env_id).await;
            }
            let _ = self.servers.delete(&unique_id).await;
            return Err(e);
        }
        details.push(StepOutcome::ok("deploy-stack"));

        record.status = ServerStatus::Ready;
        self.servers.update(&record).await?;
        details.push(StepOutcome::ok("persist"));
        drop(guard);

        match self.fleet.add_server_to_all_proxies(&record, env_id).await {
            Ok(()) => details.push(StepOutcome::ok("register-proxies")),
            Err(e) => {
                warn!(server = %record.server_name, error = %e, "proxy registration failed");
                details.push(StepOutcome::failed("register-proxies", &e));
            }
        }

        let target = format!("{subdomain}.{}", self.settings.root_domain);
        let dns_result = with_backoff("create srv record", || {
            self.dns.create_srv(
                &self.settings.root_domain,
                &subdomain,
                GAME_PORT,
                &target,
                DEFAULT_TTL,
            )
        })
        .await;
        match dns_result {
            Ok(_) => details.push(StepOutcome::ok("publish-dns")),
            Err(e) => {
                // strict: the record is not assumed to exist. the server is
                // kept and the reconciler retries publication.
                warn!(server = %record.server_name, error = %e, "SRV publication failed");
                self.servers.set_dns_pending(&unique_id, true).await?;
                details.push(StepOutcome::failed("publish-dns", &e));
            }
        }

        self.metrics.lifecycle_handled_events.inc();
        self.metrics.port_allocations.inc();
        self.metrics
            .lifecycle_duration
            .with_label_values(&["create"])
            .observe(start.elapsed().as_millis() as f64 / 1000.0);
        let success = details.iter().all(|d| d.success);
        info!(server = %record.server_name, unique_id = %unique_id, port = alloc.port, success,
              "server created");
        Ok(CreatedServer {
            unique_id,
            server_name: record.server_name,
            port: alloc.port,
            success,
            details,
        })
    }

    #[instrument(skip(self, caller))]
    pub async fn delete(
        &self,
        caller: &User,
        unique_id: &str,
        env_id: i64,
    ) -> Result<DeleteReport> {
        let server = self
            .servers
            .find_by_unique_id(unique_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("server {unique_id}")))?;
        if !caller.is_admin && server.owner_email != caller.email {
            return Err(Error::Authorization(
                "only the owner or an admin may delete a server".into(),
            ));
        }
        self.servers
            .set_status(unique_id, ServerStatus::Deleting, false)
            .await?;
        let report = self.delete_steps(&server, env_id).await;
        self.metrics.lifecycle_handled_events.inc();
        Ok(report)
    }

    /// every step runs regardless of earlier failures; the report carries
    /// each outcome and the aggregate is their conjunction
    async fn delete_steps(&self, server: &ServerRecord, env_id: i64) -> DeleteReport {
        let start = Instant::now();
        let mut details = Vec::new();
        let name = server.container_name();

        let outcome = match self.engine.get_stack_by_name(&name).await {
            Ok(Some(stack)) => match self.engine.delete_stack(stack.id, env_id).await {
                Ok(()) | Err(Error::Engine { status: 404, .. }) => {
                    StepOutcome::ok("remove-stack")
                }
                Err(e) => StepOutcome::failed("remove-stack", &e),
            },
            // no stack: tolerate, but sweep a bare container if one exists
            Ok(None) => match self.engine.get_container(&name, env_id).await {
                Ok(Some(container)) => {
                    let _ = self.engine.stop_container(&container.id, env_id).await;
                    match self.engine.delete_container(&container.id, env_id).await {
                        Ok(()) => StepOutcome::ok("remove-stack"),
                        Err(e) => StepOutcome::failed("remove-stack", &e),
                    }
                }
                Ok(None) => StepOutcome::ok("remove-stack"),
                Err(e) => StepOutcome::failed("remove-stack", &e),
            },
            Err(e) => StepOutcome::failed("remove-stack", &e),
        };
        details.push(outcome);

        let outcome = match self
            .fleet
            .remove_server_from_all_proxies(&server.server_name, Some(&server.unique_id), env_id)
            .await
        {
            Ok(()) => StepOutcome::ok("deregister-proxies"),
            Err(e) => StepOutcome::failed("deregister-proxies", &e),
        };
        details.push(outcome);

        let outcome = match &server.subdomain_name {
            Some(subdomain) => match self
                .dns
                .delete_srv(&self.settings.root_domain, subdomain)
                .await
            {
                // false means nothing to remove, which is fine
                Ok(_) => StepOutcome::ok("remove-dns"),
                Err(e) => StepOutcome::failed("remove-dns", &e),
            },
            None => StepOutcome::ok("remove-dns"),
        };
        details.push(outcome);

        let outcome = if self.settings.delete_server_folders {
            match self.fs.delete(&server.folder_path).await {
                Ok(()) => StepOutcome::ok("remove-data"),
                Err(e) => StepOutcome::failed("remove-data", &e),
            }
        } else {
            let archived = format!(
                "{}-deleted-{}",
                server.folder_path,
                Utc::now().format("%Y-%m-%d_%H-%M-%S")
            );
            match self.fs.move_path(&server.folder_path, &archived).await {
                Ok(()) | Err(Error::NotFound(_)) => StepOutcome::ok("remove-data"),
                Err(e) => StepOutcome::failed("remove-data", &e),
            }
        };
        details.push(outcome);

        let outcome = match self.servers.delete(&server.unique_id).await {
            Ok(()) => StepOutcome::ok("remove-row"),
            Err(e) => StepOutcome::failed("remove-row", &e),
        };
        details.push(outcome);

        self.metrics
            .lifecycle_duration
            .with_label_values(&["delete"])
            .observe(start.elapsed().as_millis() as f64 / 1000.0);
        let success = details.iter().all(|d| d.success);
        info!(server = %server.server_name, success, "server deleted");
        DeleteReport { success, details }
    }

    pub async fn start(&self, caller: &User, unique_id: &str, env_id: i64) -> Result<()> {
        let server = self.authorized(caller, unique_id).await?;
        self.servers
            .set_status(unique_id, ServerStatus::Starting, false)
            .await?;
        let name = server.container_name();
        let container = self
            .engine
            .get_container(&name, env_id)
            .await?
            .ok_or_else(|| {
                Error::Inconsistent(format!("no container for server {unique_id}; sync pending"))
            })?;
        self.engine.start_container(&container.id, env_id).await?;
        self.servers
            .set_status(unique_id, ServerStatus::Online, true)
            .await?;
        self.metrics.lifecycle_handled_events.inc();
        Ok(())
    }

    pub async fn stop(&self, caller: &User, unique_id: &str, env_id: i64) -> Result<()> {
        let server = self.authorized(caller, unique_id).await?;
        self.servers
            .set_status(unique_id, ServerStatus::Stopping, false)
            .await?;
        let name = server.container_name();
        if let Some(container) = self.engine.get_container(&name, env_id).await? {
            self.engine.stop_container(&container.id, env_id).await?;
        }
        self.servers
            .set_status(unique_id, ServerStatus::Ready, false)
            .await?;
        self.metrics.lifecycle_handled_events.inc();
        Ok(())
    }

    /// resume servers stranded in a transient status by a crash: retry the
    /// intrinsic step of that status
    pub async fn resume(&self, env_id: i64) -> Result<()> {
        for server in self.servers.list().await? {
            if !server.status.is_transient() {
                continue;
            }
            info!(server = %server.server_name, status = server.status.as_str(),
                  "resuming interrupted lifecycle step");
            match server.status {
                ServerStatus::Creating => {
                    // the draft never reached Ready; roll its remnants back
                    if let Ok(Some(stack)) = self
                        .engine
                        .get_stack_by_name(&server.container_name())
                        .await
                    {
                        let _ = self.engine.delete_stack(stack.id, env_id).await;
                    }
                    let _ = self.fs.delete(&server.folder_path).await;
                    let _ = self.servers.delete(&server.unique_id).await;
                }
                ServerStatus::Starting => {
                    if let Ok(Some(container)) = self
                        .engine
                        .get_container(&server.container_name(), env_id)
                        .await
                    {
                        match self.engine.start_container(&container.id, env_id).await {
                            Ok(()) => {
                                self.servers
                                    .set_status(&server.unique_id, ServerStatus::Online, true)
                                    .await?
                            }
                            Err(_) => {
                                self.servers
                                    .set_status(&server.unique_id, ServerStatus::Ready, false)
                                    .await?
                            }
                        }
                    } else {
                        self.servers
                            .set_status(&server.unique_id, ServerStatus::Ready, false)
                            .await?;
                    }
                }
                ServerStatus::Stopping => {
                    if let Ok(Some(container)) = self
                        .engine
                        .get_container(&server.container_name(), env_id)
                        .await
                    {
                        let _ = self.engine.stop_container(&container.id, env_id).await;
                    }
                    self.servers
                        .set_status(&server.unique_id, ServerStatus::Ready, false)
                        .await?;
                }
                ServerStatus::Deleting => {
                    let report = self.delete_steps(&server, env_id).await;
                    if !report.success {
                        warn!(server = %server.server_name, "resumed deletion left failures");
                    }
                }
                ServerStatus::Ready | ServerStatus::Online => {}
            }
        }
        Ok(())
    }

    pub async fn check_subdomain(
        &self,
        caller: &User,
        subdomain: &str,
    ) -> Result<SubdomainCheck> {
        let sub = subdomain.trim().to_ascii_lowercase();
        let is_valid = is_valid_dns_label(&sub);
        let is_reserved = is_reserved_subdomain(&sub);
        let taken = is_valid
            && self
                .servers
                .list()
                .await?
                .iter()
                .any(|s| s.subdomain_name.as_deref() == Some(sub.as_str()));
        Ok(SubdomainCheck {
            is_valid,
            is_reserved,
            can_use: is_valid && !taken && (!is_reserved || caller.is_admin),
        })
    }

    pub async fn check_availability(
        &self,
        caller: &User,
        needs_rcon: bool,
        env_id: i64,
    ) -> Result<Availability> {
        let reserved_ports: Vec<u16> = caller.reserved_ports.iter().copied().collect();
        match self.arbiter.allocate(&caller.email, needs_rcon, env_id).await {
            Ok(alloc) => Ok(Availability {
                available: true,
                port: Some(alloc.port),
                rcon_port: alloc.rcon_port,
                is_reserved: alloc.reserved,
                reserved_ports,
            }),
            Err(Error::Conflict(_)) => Ok(Availability {
                available: false,
                port: None,
                rcon_port: None,
                is_reserved: false,
                reserved_ports,
            }),
            Err(e) => Err(e),
        }
    }

    async fn authorized(&self, caller: &User, unique_id: &str) -> Result<ServerRecord> {
        let server = self
            .servers
            .find_by_unique_id(unique_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("server {unique_id}")))?;
        if !caller.is_admin && server.owner_email != caller.email {
            return Err(Error::Authorization("not the server owner".into()));
        }
        Ok(server)
    }

    /// the shared secret modern-forwarding back-ends must present, read from
    /// the first velocity proxy that has one
    async fn proxy_forwarding_secret(&self) -> Option<String> {
        let defs = self.fleet.definitions().await.ok()?;
        for def in defs
            .iter()
            .filter(|d| d.enabled && d.kind == ProxyKind::Velocity)
        {
            let path = format!(
                "{}/{}/forwarding.secret",
                self.settings.velocity_config_path.trim_end_matches('/'),
                def.config_path
            );
            if let Ok(bytes) = self.fs.read(&path).await {
                let secret = String::from_utf8_lossy(&bytes).trim().to_string();
                if !secret.is_empty() {
                    return Some(secret);
                }
            }
        }
        None
    }
}
