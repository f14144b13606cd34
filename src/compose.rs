use std::collections::BTreeMap;

use maplit::btreemap;
use serde::Serialize;

use crate::objects::proxy::ProxyDefinition;
use crate::objects::server::{ForwardingMode, ServerRecord, GAME_PORT};
use crate::settings::Settings;

/// Compose v3-style stack specification, rendered to YAML text for the
/// engine's stack API
#[derive(Serialize)]
struct ComposeFile {
    version: &'static str,
    services: BTreeMap<String, ComposeService>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    networks: BTreeMap<String, ComposeNetwork>,
}

#[derive(Serialize)]
struct ComposeService {
    image: String,
    container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    restart: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    networks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mem_limit: Option<String>,
}

#[derive(Serialize)]
struct ComposeNetwork {
    external: bool,
}

fn render(file: &ComposeFile) -> String {
    serde_yaml::to_string(file).expect("compose file serializes")
}

/// stack for one game server: a single itzg/minecraft-server service bound
/// to the allocated host port and attached to every proxy overlay network
pub fn for_server(server: &ServerRecord, networks: &[String]) -> String {
    let base = server.config.base();
    let name = server.container_name();

    // the proxy owns authentication; back-ends stay off online mode
    let mut environment = btreemap! {
        "EULA".to_string() => "TRUE".to_string(),
        "TYPE".to_string() => server.config.kind().as_env().to_string(),
        "VERSION".to_string() => base.version.clone(),
        "MEMORY".to_string() => format!("{}M", base.memory_mb),
        "MOTD".to_string() => base.motd.clone(),
        "ONLINE_MODE".to_string() => "FALSE".to_string(),
    };
    match base.forwarding_mode {
        ForwardingMode::Modern => {
            if let Some(secret) = &base.forwarding_secret {
                environment.insert("VELOCITY_SECRET".into(), secret.clone());
            }
        }
        ForwardingMode::Legacy => {
            environment.insert("BUNGEECORD".into(), "TRUE".into());
        }
        ForwardingMode::None => {}
    }

    let mut ports = vec![format!("{}:{GAME_PORT}", base.port)];
    if let Some(rcon) = base.rcon_port {
        environment.insert("ENABLE_RCON".into(), "true".into());
        environment.insert("RCON_PORT".into(), "25575".into());
        ports.push(format!("{rcon}:25575"));
    }

    let file = ComposeFile {
        version: "3",
        services: BTreeMap::from([(
            name.clone(),
            ComposeService {
                image: "itzg/minecraft-server:latest".into(),
                container_name: name,
                hostname: None,
                restart: "unless-stopped",
                environment,
                ports,
                volumes: vec![format!("{}:/data", server.folder_path)],
                networks: networks.to_vec(),
                mem_limit: None,
            },
        )]),
        networks: networks
            .iter()
            .map(|n| (n.clone(), ComposeNetwork { external: true }))
            .collect(),
    };
    render(&file)
}

/// stack for one front proxy: the definition's image with its config
/// directory bind-mounted and the external port published
pub fn for_proxy(def: &ProxyDefinition, settings: &Settings) -> String {
    let environment = btreemap! {
        "TYPE".to_string() => def.kind.as_env().to_string(),
    };

    let config_dir = format!(
        "{}/{}",
        settings.velocity_config_path.trim_end_matches('/'),
        def.config_path
    );

    let file = ComposeFile {
        version: "3",
        services: BTreeMap::from([(
            def.name.clone(),
            ComposeService {
                image: def.image().to_string(),
                container_name: def.name.clone(),
                hostname: Some(def.host.clone()),
                restart: "unless-stopped",
                environment,
                ports: vec![format!("{}:{}", def.external_port, def.kind.listen_port())],
                volumes: vec![format!("{config_dir}:/config")],
                networks: vec![def.network_name.clone()],
                mem_limit: Some(def.memory.clone()),
            },
        )]),
        networks: BTreeMap::from([(def.network_name.clone(), ComposeNetwork { external: true })]),
    };
    render(&file)
}
