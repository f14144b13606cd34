use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use prometheus::proto::MetricFamily;
use prometheus::default_registry;
use tracing::warn;

use crate::fleet::ProxyFleet;
use crate::gateways::porkbun::Porkbun;
use crate::gateways::portainer::{ContainerEngine, Portainer};
use crate::gateways::webdav::{SharedFs, WebdavFs};
use crate::helpers::metrics::Metrics;
use crate::helpers::state::State;
use crate::lifecycle::ServerLifecycle;
use crate::objects::user::User;
use crate::ports::arbiter::{EnvLocks, PortArbiter};
use crate::settings::Settings;
use crate::store::{mongo, ServerStore, UserStore};
use crate::{Error, Result};

/// owns the wired component graph and the reconciler's drainer future
#[derive(Clone)]
pub struct Manager {
    state: Arc<RwLock<State>>,
    metrics: Metrics,
    pub settings: Arc<Settings>,
    pub users: Arc<dyn UserStore>,
    pub servers: Arc<dyn ServerStore>,
    pub fleet: Arc<ProxyFleet>,
    pub lifecycle: Arc<ServerLifecycle>,
    env_id: i64,
}

impl Manager {
    /// build every component from the environment, resume interrupted
    /// lifecycle steps, and return (a `Manager`, a future to be awaited);
    /// `fn main()` awaits the future and exits when it returns
    pub async fn new() -> Result<(Self, BoxFuture<'static, ()>)> {
        let settings = Arc::new(Settings::from_env()?);
        let metrics = Metrics::new();
        let state = Arc::new(RwLock::new(State::new()));

        let engine: Arc<dyn ContainerEngine> = Arc::new(Portainer::new(&settings)?);
        let fs: Arc<dyn SharedFs> = Arc::new(WebdavFs::new(&settings)?);
        let dns = Arc::new(Porkbun::new(&settings)?);
        let (users, servers) = mongo::connect(&settings.mongodb_uri).await?;
        let users: Arc<dyn UserStore> = Arc::new(users);
        let servers: Arc<dyn ServerStore> = Arc::new(servers);

        let env_id = match settings.portainer_env_id {
            Some(id) => id,
            None => engine.first_environment_id().await?,
        };

        let locks = Arc::new(EnvLocks::new());
        let arbiter = Arc::new(PortArbiter::new(
            engine.clone(),
            users.clone(),
            servers.clone(),
            locks.clone(),
        ));
        let fleet = Arc::new(ProxyFleet::new(
            engine.clone(),
            fs.clone(),
            dns.clone(),
            servers.clone(),
            settings.clone(),
            state.clone(),
            metrics.clone(),
        ));
        let lifecycle = Arc::new(ServerLifecycle::new(
            engine,
            fs,
            dns,
            users.clone(),
            servers.clone(),
            arbiter,
            fleet.clone(),
            settings.clone(),
            locks,
            metrics.clone(),
        ));

        if let Err(e) = lifecycle.resume(env_id).await {
            warn!(error = %e, "resume of interrupted lifecycle steps failed");
        }

        let drainer = fleet.clone().run(env_id).boxed();
        Ok((
            Manager {
                state,
                metrics,
                settings,
                users,
                servers,
                fleet,
                lifecycle,
                env_id,
            },
            drainer,
        ))
    }

    /// metrics getter
    pub fn metrics(&self) -> Vec<MetricFamily> {
        default_registry().gather()
    }

    /// state getter
    pub fn state(&self) -> State {
        self.state.read().expect("state getter").clone()
    }

    pub fn env_id(&self) -> i64 {
        self.env_id
    }

    /// resolve the pre-validated caller identity injected by the outer web
    /// layer
    pub async fn caller(&self, header: Option<&str>) -> Result<User> {
        let email = header
            .ok_or_else(|| Error::Authorization("missing x-hopper-user header".into()))?;
        self.users
            .find_by_email(email)
            .await?
            .ok_or_else(|| Error::Authorization(format!("unknown user {email}")))
    }
}
