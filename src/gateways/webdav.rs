use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tracing::debug;

use super::normalize_slashes;
use crate::settings::Settings;
use crate::{Error, Result};

/// capability interface over the WebDAV-backed shared filesystem. paths are
/// absolute, rooted at the configured base.
#[async_trait]
pub trait SharedFs: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;
    async fn move_path(&self, from: &str, to: &str) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn mkdir_p(&self, path: &str) -> Result<()>;
    async fn list(&self, path: &str) -> Result<Vec<String>>;
}

pub struct WebdavFs {
    base_url: String,
    base_path: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

fn dav_method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("valid extension method")
}

impl WebdavFs {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.io_timeout)
            .build()?;
        Ok(WebdavFs {
            base_url: settings.webdav_url.trim_end_matches('/').to_string(),
            base_path: settings.webdav_base_path.clone(),
            username: settings.webdav_username.clone(),
            password: settings.webdav_password.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        normalize_slashes(&format!("{}/{}/{}", self.base_url, self.base_path, path))
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn check(resp: reqwest::Response, path: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() || status == StatusCode::MULTI_STATUS {
            return Ok(resp);
        }
        Err(Error::SharedFs {
            status: status.as_u16(),
            path: path.to_string(),
        })
    }
}

#[async_trait]
impl SharedFs for WebdavFs {
    async fn exists(&self, path: &str) -> Result<bool> {
        let resp = self
            .request(dav_method("PROPFIND"), path)
            .header("Depth", "0")
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() || s == StatusCode::MULTI_STATUS => Ok(true),
            s => Err(Error::SharedFs {
                status: s.as_u16(),
                path: path.to_string(),
            }),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let resp = self.request(Method::GET, path).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(path.to_string()));
        }
        let resp = Self::check(resp, path).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// atomic at the file level where the server cooperates: PUT to a
    /// side-file, then MOVE over the destination. servers that reject MOVE
    /// degrade to a plain PUT.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let part = format!("{path}.part");
        let resp = self
            .request(Method::PUT, &part)
            .body(data.to_vec())
            .send()
            .await?;
        Self::check(resp, &part).await?;

        let resp = self
            .request(dav_method("MOVE"), &part)
            .header("Destination", self.url(path))
            .header("Overwrite", "T")
            .send()
            .await?;
        match resp.status().as_u16() {
            405 | 501 | 502 => {
                debug!(path, "MOVE unsupported, writing directly");
                let resp = self
                    .request(Method::PUT, path)
                    .body(data.to_vec())
                    .send()
                    .await?;
                Self::check(resp, path).await?;
                let _ = self.request(Method::DELETE, &part).send().await;
                Ok(())
            }
            _ => {
                Self::check(resp, path).await?;
                Ok(())
            }
        }
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let resp = self
            .request(dav_method("MOVE"), from)
            .header("Destination", self.url(to))
            .header("Overwrite", "T")
            .send()
            .await?;
        Self::check(resp, from).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let resp = self.request(Method::DELETE, path).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp, path).await?;
        Ok(())
    }

    async fn mkdir_p(&self, path: &str) -> Result<()> {
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            let resp = self.request(dav_method("MKCOL"), &prefix).send().await?;
            match resp.status().as_u16() {
                // 405: collection already exists
                201 | 405 => {}
                s => {
                    return Err(Error::SharedFs {
                        status: s,
                        path: prefix.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let resp = self
            .request(dav_method("PROPFIND"), path)
            .header("Depth", "1")
            .send()
            .await?;
        let resp = Self::check(resp, path).await?;
        let body = resp.text().await?;
        Ok(parse_hrefs(&body))
    }
}

/// pull `<href>` values out of a PROPFIND multistatus body without dragging
/// in an XML parser; handles `D:`/`d:`/unprefixed forms
fn parse_hrefs(body: &str) -> Vec<String> {
    let lower = body.to_ascii_lowercase();
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(rel) = lower[pos..].find("href>") {
        let tag_end = pos + rel + "href>".len();
        // the nearest '<' before the match opens this tag; skip closing tags
        let is_closing = lower[..pos + rel]
            .rfind('<')
            .map(|i| lower[i..].starts_with("</"))
            .unwrap_or(true);
        let Some(close) = lower[tag_end..].find('<') else {
            break;
        };
        if !is_closing {
            let href = body[tag_end..tag_end + close].trim();
            if !href.is_empty() {
                out.push(href.to_string());
            }
        }
        pos = tag_end + close;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hrefs_with_mixed_prefixes() {
        let body = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response><D:href>/dav/mc/u/one/</D:href></D:response>
  <d:response><d:href>/dav/mc/u/two/server.properties</d:href></d:response>
</D:multistatus>"#;
        assert_eq!(
            parse_hrefs(body),
            vec!["/dav/mc/u/one/", "/dav/mc/u/two/server.properties"]
        );
    }

    #[test]
    fn parses_unprefixed_hrefs() {
        let body = "<multistatus><response><href>/a/b</href></response></multistatus>";
        assert_eq!(parse_hrefs(body), vec!["/a/b"]);
    }
}
