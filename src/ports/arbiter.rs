use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::gateways::portainer::ContainerEngine;
use crate::objects::user::User;
use crate::ports::{self, PortRange};
use crate::store::{ServerStore, UserStore};
use crate::{Error, Result};

/// one exclusive lock per engine environment; held across candidate
/// evaluation and draft-row persistence so two requests can never pick the
/// same port
pub struct EnvLocks {
    locks: std::sync::Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl EnvLocks {
    pub fn new() -> Self {
        EnvLocks {
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn for_env(&self, env_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .expect("env lock table")
            .entry(env_id)
            .or_default()
            .clone()
    }
}

impl Default for EnvLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// outcome of one arbitration; never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllocation {
    pub port: u16,
    pub rcon_port: Option<u16>,
    /// the port came from the caller's own reservations
    pub reserved: bool,
}

pub struct PortArbiter {
    engine: Arc<dyn ContainerEngine>,
    users: Arc<dyn UserStore>,
    servers: Arc<dyn ServerStore>,
    locks: Arc<EnvLocks>,
}

impl PortArbiter {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        users: Arc<dyn UserStore>,
        servers: Arc<dyn ServerStore>,
        locks: Arc<EnvLocks>,
    ) -> Self {
        PortArbiter {
            engine,
            users,
            servers,
            locks,
        }
    }

    /// arbitration under the environment lock; for callers that do not
    /// persist anything (availability probes)
    pub async fn allocate(
        &self,
        user_email: &str,
        needs_rcon: bool,
        env_id: i64,
    ) -> Result<PortAllocation> {
        let lock = self.locks.for_env(env_id);
        let _guard = lock.lock().await;
        self.allocate_locked(user_email, needs_rcon, env_id).await
    }

    /// arbitration for callers already holding the environment lock; the
    /// guard must stay held until the chosen port is persisted
    pub async fn allocate_locked(
        &self,
        user_email: &str,
        needs_rcon: bool,
        env_id: i64,
    ) -> Result<PortAllocation> {
        let user = self
            .users
            .find_by_email(user_email)
            .await?
            .ok_or_else(|| Error::Authorization(format!("unknown user {user_email}")))?;
        let occupied = self.occupancy(&user, env_id).await?;

        fn pick<I: Iterator<Item = u16>>(mut candidates: I, taken: &BTreeSet<u16>) -> Option<u16> {
            candidates.find(|p| !taken.contains(p) && ports::is_legal(*p))
        }

        let from_reservations = user
            .reserved_ports
            .iter()
            .copied()
            .chain(user.reserved_port_ranges.iter().flat_map(|r| r.iter()));
        let (port, reserved) = match pick(from_reservations, &occupied) {
            Some(p) => (p, true),
            None => match pick(PortRange::MinecraftServers.iter(), &occupied) {
                Some(p) => (p, false),
                None => return Err(Error::Conflict("no-port-available".into())),
            },
        };

        let rcon_port = if needs_rcon {
            let rcon = PortRange::MinecraftRcon.iter().filter(|p| *p != port);
            match pick(rcon, &occupied) {
                Some(p) => Some(p),
                None => return Err(Error::Conflict("no-rcon-port-available".into())),
            }
        } else {
            None
        };

        debug!(user = user_email, port, ?rcon_port, reserved, "allocated ports");
        Ok(PortAllocation {
            port,
            rcon_port,
            reserved,
        })
    }

    /// the live occupancy set: system reserved ports, ports bound by running
    /// containers, ports on any server document, and every other user's
    /// reserved ranges
    async fn occupancy(&self, user: &User, env_id: i64) -> Result<BTreeSet<u16>> {
        let mut taken: BTreeSet<u16> = ports::RESERVED_PORTS.iter().copied().collect();

        for container in self.engine.list_containers(env_id).await? {
            if container.is_running() {
                taken.extend(container.public_ports());
            }
        }

        for server in self.servers.list().await? {
            let base = server.config.base();
            taken.insert(base.port);
            if let Some(rcon) = base.rcon_port {
                taken.insert(rcon);
            }
        }

        for other in self.users.list().await? {
            if other.email == user.email {
                continue;
            }
            for range in &other.reserved_port_ranges {
                taken.extend(range.iter());
            }
        }

        Ok(taken)
    }

    /// whether a user may add a port to their reservations. admins may
    /// reserve any legal port; everyone else stays inside the public space
    /// and off other users' ranges.
    pub async fn authorize_reservation(&self, user: &User, port: u16) -> Result<()> {
        if !ports::is_legal(port) {
            return Err(Error::Validation(format!("port {port} is not reservable")));
        }
        if user.is_admin {
            return Ok(());
        }
        if !ports::in_public_space(port) {
            return Err(Error::Authorization(format!(
                "port {port} is outside the public range"
            )));
        }
        for other in self.users.list().await? {
            if other.email != user.email && other.owns_port(port) {
                return Err(Error::Conflict(format!(
                    "port {port} overlaps another user's reservation"
                )));
            }
        }
        Ok(())
    }
}
