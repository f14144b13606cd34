use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use crate::settings::Settings;
use crate::{Error, Result};

#[derive(Deserialize, Debug, Clone)]
pub struct Environment {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Stack {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "EndpointId", default)]
    pub endpoint_id: i64,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct PortBinding {
    #[serde(rename = "PrivatePort", default)]
    pub private_port: u16,
    #[serde(rename = "PublicPort", default)]
    pub public_port: Option<u16>,
    #[serde(rename = "Type", default)]
    pub proto: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Container {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Ports", default)]
    pub ports: Vec<PortBinding>,
}

impl Container {
    /// primary name without the engine's leading slash
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or("")
    }

    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }

    /// host-side published TCP ports
    pub fn public_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().filter_map(|p| p.public_port)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// narrow capability interface over the container engine's management API
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list_environments(&self) -> Result<Vec<Environment>>;
    async fn first_environment_id(&self) -> Result<i64>;

    async fn list_stacks(&self) -> Result<Vec<Stack>>;
    async fn get_stack_by_name(&self, name: &str) -> Result<Option<Stack>>;
    async fn create_stack(&self, name: &str, compose_text: &str, env_id: i64) -> Result<Stack>;
    async fn delete_stack(&self, id: i64, env_id: i64) -> Result<()>;
    async fn stop_stack(&self, id: i64, env_id: i64) -> Result<()>;

    async fn list_containers(&self, env_id: i64) -> Result<Vec<Container>>;
    async fn find_containers(
        &self,
        env_id: i64,
        image: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<Container>>;
    async fn get_container(&self, identifier: &str, env_id: i64) -> Result<Option<Container>>;
    async fn start_container(&self, id: &str, env_id: i64) -> Result<()>;
    async fn stop_container(&self, id: &str, env_id: i64) -> Result<()>;
    async fn delete_container(&self, id: &str, env_id: i64) -> Result<()>;

    /// create the bridge network when absent
    async fn ensure_network(&self, name: &str, env_id: i64) -> Result<()>;

    async fn exec(&self, container_id: &str, command: &[&str], env_id: i64)
        -> Result<ExecResult>;
}

enum Auth {
    ApiKey(String),
    Password {
        username: String,
        password: String,
        jwt: RwLock<Option<String>>,
    },
}

/// Portainer-backed implementation
pub struct Portainer {
    base_url: String,
    client: reqwest::Client,
    auth: Auth,
}

impl Portainer {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.io_timeout)
            .build()?;
        let auth = match (&settings.portainer_api_key, &settings.portainer_username) {
            (Some(key), _) => Auth::ApiKey(key.clone()),
            (None, Some(username)) => Auth::Password {
                username: username.clone(),
                password: settings.portainer_password.clone().unwrap_or_default(),
                jwt: RwLock::new(None),
            },
            (None, None) => {
                return Err(Error::Validation(
                    "PORTAINER_API_KEY or PORTAINER_USERNAME/PORTAINER_PASSWORD required".into(),
                ))
            }
        };
        Ok(Portainer {
            base_url: settings.portainer_url.trim_end_matches('/').to_string(),
            client,
            auth,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn jwt(&self) -> Result<String> {
        let (username, password, cache) = match &self.auth {
            Auth::Password {
                username,
                password,
                jwt,
            } => (username, password, jwt),
            Auth::ApiKey(_) => {
                return Err(Error::Inconsistent("jwt requested with api-key auth".into()))
            }
        };
        if let Some(token) = cache.read().await.clone() {
            return Ok(token);
        }
        #[derive(Deserialize)]
        struct AuthResponse {
            jwt: String,
        }
        let resp = self
            .client
            .post(self.url("/api/auth"))
            .json(&json!({ "Username": username, "Password": password }))
            .send()
            .await?;
        let resp = check(resp).await?;
        let token = resp.json::<AuthResponse>().await?.jwt;
        *cache.write().await = Some(token.clone());
        Ok(token)
    }

    async fn authed(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        Ok(match &self.auth {
            Auth::ApiKey(key) => req.header("X-API-Key", key),
            Auth::Password { .. } => req.bearer_auth(self.jwt().await?),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let req = self.authed(self.client.get(self.url(path))).await?;
        let resp = check(req.send().await?).await?;
        Ok(resp.json().await?)
    }
}

/// surface any engine 4xx/5xx as a typed error carrying the engine message
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() || status == reqwest::StatusCode::NOT_MODIFIED {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(Error::Engine {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ContainerEngine for Portainer {
    async fn list_environments(&self) -> Result<Vec<Environment>> {
        self.get_json("/api/endpoints").await
    }

    async fn first_environment_id(&self) -> Result<i64> {
        self.list_environments()
            .await?
            .first()
            .map(|e| e.id)
            .ok_or_else(|| Error::Inconsistent("engine reports no environments".into()))
    }

    async fn list_stacks(&self) -> Result<Vec<Stack>> {
        self.get_json("/api/stacks").await
    }

    async fn get_stack_by_name(&self, name: &str) -> Result<Option<Stack>> {
        Ok(self
            .list_stacks()
            .await?
            .into_iter()
            .find(|s| s.name == name))
    }

    async fn create_stack(&self, name: &str, compose_text: &str, env_id: i64) -> Result<Stack> {
        debug!(stack = name, env_id, "creating stack");
        let req = self
            .authed(self.client.post(self.url(&format!(
                "/api/stacks/create/standalone/string?endpointId={env_id}"
            ))))
            .await?
            .json(&json!({ "Name": name, "StackFileContent": compose_text }));
        let resp = check(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn delete_stack(&self, id: i64, env_id: i64) -> Result<()> {
        let req = self
            .authed(
                self.client
                    .delete(self.url(&format!("/api/stacks/{id}?endpointId={env_id}"))),
            )
            .await?;
        check(req.send().await?).await?;
        Ok(())
    }

    async fn stop_stack(&self, id: i64, env_id: i64) -> Result<()> {
        let req = self
            .authed(
                self.client
                    .post(self.url(&format!("/api/stacks/{id}/stop?endpointId={env_id}"))),
            )
            .await?;
        check(req.send().await?).await?;
        Ok(())
    }

    async fn list_containers(&self, env_id: i64) -> Result<Vec<Container>> {
        self.get_json(&format!(
            "/api/endpoints/{env_id}/docker/containers/json?all=true"
        ))
        .await
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

    async fn get_container(&self, identifier: &str, env_id: i64) -> Result<Option<Container>> {
        Ok(self
            .list_containers(env_id)
            .await?
            .into_iter()
            .find(|c| c.name() == identifier || c.id.starts_with(identifier)))
    }

    async fn start_container(&self, id: &str, env_id: i64) -> Result<()> {
        let req = self
            .authed(self.client.post(self.url(&format!(
                "/api/endpoints/{env_id}/docker/containers/{id}/start"
            ))))
            .await?;
        check(req.send().await?).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, env_id: i64) -> Result<()> {
        let req = self
            .authed(self.client.post(self.url(&format!(
                "/api/endpoints/{env_id}/docker/containers/{id}/stop"
            ))))
            .await?;
        check(req.send().await?).await?;
        Ok(())
    }

    async fn delete_container(&self, id: &str, env_id: i64) -> Result<()> {
        let req = self
            .authed(self.client.delete(self.url(&format!(
                "/api/endpoints/{env_id}/docker/containers/{id}?force=true"
            ))))
            .await?;
        check(req.send().await?).await?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str, env_id: i64) -> Result<()> {
        #[derive(Deserialize)]
        struct Network {
            #[serde(rename = "Name")]
            name: String,
        }
        let networks: Vec<Network> = self
            .get_json(&format!("/api/endpoints/{env_id}/docker/networks"))
            .await?;
        if networks.iter().any(|n| n.name == name) {
            return Ok(());
        }
        debug!(network = name, env_id, "creating bridge network");
        let req = self
            .authed(
                self.client
                    .post(self.url(&format!("/api/endpoints/{env_id}/docker/networks/create"))),
            )
            .await?
            .json(&json!({ "Name": name, "Driver": "bridge" }));
        match check(req.send().await?).await {
            Ok(_) => Ok(()),
            // lost the race with another creator
            Err(Error::Engine { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[&str],
        env_id: i64,
    ) -> Result<ExecResult> {
        #[derive(Deserialize)]
        struct ExecCreated {
            #[serde(rename = "Id")]
            id: String,
        }
        #[derive(Deserialize)]
        struct ExecInspect {
            #[serde(rename = "ExitCode", default)]
            exit_code: i64,
        }
        let req = self
            .authed(self.client.post(self.url(&format!(
                "/api/endpoints/{env_id}/docker/containers/{container_id}/exec"
            ))))
            .await?
            .json(&json!({
                "AttachStdout": true,
                "AttachStderr": true,
                "Cmd": command,
            }));
        let created: ExecCreated = check(req.send().await?).await?.json().await?;

        let req = self
            .authed(self.client.post(self.url(&format!(
                "/api/endpoints/{env_id}/docker/exec/{}/start",
                created.id
            ))))
            .await?
            .json(&json!({ "Detach": false, "Tty": false }));
        let body = check(req.send().await?).await?.bytes().await?;
        let (stdout, stderr) = demux_stream(&body);

        let inspect: ExecInspect = self
            .get_json(&format!(
                "/api/endpoints/{env_id}/docker/exec/{}/json",
                created.id
            ))
            .await?;
        Ok(ExecResult {
            exit_code: inspect.exit_code,
            stdout,
            stderr,
        })
    }
}

/// split a docker attach stream into stdout/stderr. frames are
/// `[stream, 0, 0, 0, len_be32]` + payload; bodies without frame headers are
/// treated as plain stdout.
fn demux_stream(bytes: &[u8]) -> (String, String) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut rest = bytes;
    while rest.len() >= 8 {
        let stream = rest[0];
        if !matches!(stream, 0 | 1 | 2) || rest[1] != 0 || rest[2] != 0 || rest[3] != 0 {
            // not a multiplexed stream
            return (String::from_utf8_lossy(bytes).into_owned(), String::new());
        }
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + len).min(rest.len());
        let payload = &rest[8..end];
        match stream {
            2 => stderr.extend_from_slice(payload),
            _ => stdout.extend_from_slice(payload),
        }
        rest = &rest[end..];
    }
    if !rest.is_empty() && stdout.is_empty() && stderr.is_empty() {
        return (String::from_utf8_lossy(bytes).into_owned(), String::new());
    }
    (
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_strips_slash() {
        let c = Container {
            id: "abc".into(),
            names: vec!["/mc-123".into()],
            ..Container::default()
        };
        assert_eq!(c.name(), "mc-123");
    }

    #[test]
    fn demux_splits_frames() {
        let mut body = Vec::new();
        body.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 5]);
        body.extend_from_slice(b"hello");
        body.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 4]);
        body.extend_from_slice(b"oops");
        let (out, err) = demux_stream(&body);
        assert_eq!(out, "hello");
        assert_eq!(err, "oops");
    }

    #[test]
    fn demux_passes_plain_bodies_through() {
        let (out, err) = demux_stream(b"plain text output");
        assert_eq!(out, "plain text output");
        assert_eq!(err, "");
    }

    #[test]
    fn public_ports() {
        let c = Container {
            ports: vec![
                PortBinding {
                    private_port: 25565,
                    public_port: Some(25566),
                    proto: "tcp".into(),
                },
                PortBinding {
                    private_port: 25575,
                    public_port: None,
                    proto: "tcp".into(),
                },
            ],
            ..Container::default()
        };
        assert_eq!(c.public_ports().collect::<Vec<_>>(), vec![25566]);
    }
}
