//! HTTP client for the remote list endpoints.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::cache::TargetRetrieval;
use crate::errors::{Error, Result};
use crate::store::targets::Target;

/// Client for the service's public API, used by the cache refresher to pull
/// the targets visible to a user.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ListTargetsBody {
    #[serde(default)]
    items: Vec<Target>,
}

impl Client {
    pub fn new() -> Result<Self> {
        const OP: &str = "api.client_new";
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::transport(OP, e))?;
        Ok(Client { http })
    }

    /// List every target visible to the token, recursively across the
    /// scopes it can read.
    pub async fn list_targets(&self, boundary_addr: &str, auth_token: &str) -> Result<Vec<Target>> {
        const OP: &str = "api.list_targets";
        if boundary_addr.is_empty() {
            return Err(Error::invalid_parameter(OP, "boundary address is empty"));
        }
        let url = format!("{}/v1/targets", boundary_addr.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .query(&[("recursive", "true")])
            .bearer_auth(auth_token)
            .send()
            .await
            .map_err(|e| Error::transport(OP, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::transport(OP, format!("{url} returned status {status}")));
        }
        let body: ListTargetsBody = resp.json().await.map_err(|e| Error::transport(OP, e))?;
        Ok(body.items)
    }
}

#[async_trait]
impl TargetRetrieval for Client {
    async fn list_targets(&self, boundary_addr: &str, auth_token: &str) -> Result<Vec<Target>> {
        Client::list_targets(self, boundary_addr, auth_token).await
    }
}
