use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::normalize_slashes;
use crate::settings::Settings;
use crate::{Error, Result};

pub const DEFAULT_TTL: u32 = 300;
const SRV_SERVICE: &str = "_minecraft._tcp";

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DnsRecord {
    pub id: String,
    /// fully qualified name as the registrar reports it
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub content: String,
    #[serde(default)]
    pub ttl: Option<String>,
    #[serde(default)]
    pub prio: Option<String>,
}

/// strict SRV record management at the external registrar: no fallback,
/// idempotent deletes, verified responses
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// publish `_minecraft._tcp.<subdomain>` -> `0 5 <port> <target>`;
    /// returns the registrar's record id
    async fn create_srv(
        &self,
        domain: &str,
        subdomain: &str,
        port: u16,
        target: &str,
        ttl: u32,
    ) -> Result<String>;

    /// delete every SRV record for the subdomain; true iff at least one
    /// record was removed. removing nothing is not an error.
    async fn delete_srv(&self, domain: &str, subdomain: &str) -> Result<bool>;

    async fn list_records(&self, domain: &str) -> Result<Vec<DnsRecord>>;
    async fn get_record(&self, domain: &str, id: &str) -> Result<Option<DnsRecord>>;
}

/// the SRV owner name relative to the zone; a redundant `.<domain>` suffix
/// on the subdomain is stripped first
pub fn srv_name(domain: &str, subdomain: &str) -> String {
    let trailing = format!(".{domain}");
    let sub = subdomain.strip_suffix(trailing.as_str()).unwrap_or(subdomain);
    format!("{SRV_SERVICE}.{sub}")
}

/// registrars complete relative hostnames; a trailing dot suppresses that
pub fn qualify_target(target: &str) -> String {
    if target.ends_with('.') {
        target.to_string()
    } else {
        format!("{target}.")
    }
}

pub struct Porkbun {
    base_url: String,
    api_key: String,
    secret_key: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ApiStatus {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

impl Porkbun {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.io_timeout)
            .build()?;
        Ok(Porkbun {
            base_url: String::from("https://api.porkbun.com/api/json/v3"),
            api_key: settings.porkbun_api_key.clone(),
            secret_key: settings.porkbun_secret_key.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        normalize_slashes(&format!("{}/{}", self.base_url, path))
    }

    async fn post(&self, path: &str, mut payload: serde_json::Value) -> Result<serde_json::Value> {
        if let Some(map) = payload.as_object_mut() {
            map.insert("apikey".into(), json!(self.api_key));
            map.insert("secretapikey".into(), json!(self.secret_key));
        }
        let resp = self
            .client
            .post(self.url(path))
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(Error::Unavailable(format!(
                "registrar returned {status} for {path}"
            )));
        }
        let body: serde_json::Value = resp.json().await?;
        let api: ApiStatus =
            serde_json::from_value(body.clone()).map_err(Error::Serialization)?;
        if api.status != "SUCCESS" {
            return Err(Error::Registrar(
                api.message
                    .unwrap_or_else(|| format!("registrar rejected {path}")),
            ));
        }
        Ok(body)
    }
}

#[async_trait]
impl DnsProvider for Porkbun {
    async fn create_srv(
        &self,
        domain: &str,
        subdomain: &str,
        port: u16,
        target: &str,
        ttl: u32,
    ) -> Result<String> {
        let name = srv_name(domain, subdomain);
        let content = format!("0 5 {port} {}", qualify_target(target));
        debug!(%name, %content, "creating SRV record");
        let body = self
            .post(
                &format!("dns/create/{domain}"),
                json!({
                    "name": name,
                    "type": "SRV",
                    "content": content,
                    "ttl": ttl.to_string(),
                    "prio": "0",
                }),
            )
            .await?;
        let id = body
            .get("id")
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| Error::Registrar("create response carried no record id".into()))?;
        info!(%name, id, "SRV record created");
        Ok(id)
    }

    async fn delete_srv(&self, domain: &str, subdomain: &str) -> Result<bool> {
        let name = srv_name(domain, subdomain);
        let fqdn = format!("{name}.{domain}");
        let matching: Vec<DnsRecord> = self
            .list_records(domain)
            .await?
            .into_iter()
            .filter(|r| r.record_type == "SRV" && (r.name == fqdn || r.name == name))
            .collect();
        if matching.is_empty() {
            debug!(%name, "no SRV records to delete");
            return Ok(false);
        }
        for record in &matching {
            self.post(
                &format!("dns/delete/{domain}/{}", record.id),
                json!({}),
            )
            .await?;
        }
        info!(%name, count = matching.len(), "SRV records deleted");
        Ok(true)
    }

    async fn list_records(&self, domain: &str) -> Result<Vec<DnsRecord>> {
        #[derive(Deserialize)]
        struct Records {
            #[serde(default)]
            records: Vec<DnsRecord>,
        }
        let body = self.post(&format!("dns/retrieve/{domain}"), json!({})).await?;
        let records: Records = serde_json::from_value(body).map_err(Error::Serialization)?;
        Ok(records.records)
    }

    async fn get_record(&self, domain: &str, id: &str) -> Result<Option<DnsRecord>> {
        Ok(self
            .list_records(domain)
            .await?
            .into_iter()
            .find(|r| r.id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srv_name_strips_redundant_domain_suffix() {
        assert_eq!(srv_name("example.dev", "s"), "_minecraft._tcp.s");
        assert_eq!(srv_name("example.dev", "s.example.dev"), "_minecraft._tcp.s");
        // only a full suffix match is stripped
        assert_eq!(
            srv_name("example.dev", "sexample.dev"),
            "_minecraft._tcp.sexample.dev"
        );
    }

    #[test]
    fn targets_get_exactly_one_trailing_dot() {
        assert_eq!(qualify_target("s.example.dev"), "s.example.dev.");
        assert_eq!(qualify_target("s.example.dev."), "s.example.dev.");
    }
}
