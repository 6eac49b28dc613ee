use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

use crate::configuration::ManagementApiSettings;
use crate::helper::error_chain_fmt;

/// Read-only client for the broker's HTTP management API.
///
/// Only two things are asked of it: confirming the credentials work at
/// startup, and listing the bindings of a queue so stale routing keys can be
/// unbound. When the API is not configured, bindings are additive only.
pub struct ManagementClient {
    base_url: String,
    username: String,
    password: Secret<String>,
    vhost: String,
    client: reqwest::Client,
}

/// One row of `GET /queues/{vhost}/{queue}/bindings`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BindingInfo {
    pub source: String,
    pub destination: String,
    pub routing_key: String,
}

impl ManagementClient {
    pub fn new(settings: &ManagementApiSettings, vhost: &str) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            vhost: encode_vhost(vhost),
            client: reqwest::Client::new(),
        }
    }

    /// Cheap authenticated request, run once at startup.
    #[tracing::instrument(name = "Verifying management API credentials", skip(self))]
    pub async fn verify_credentials(&self) -> Result<(), ManagementError> {
        let response = self
            .client
            .get(format!("{}/whoami", self.base_url))
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ManagementError::Rejected {
                status: response.status().as_u16(),
            })
        }
    }

    /// Lists the bindings currently attached to a queue.
    #[tracing::instrument(name = "Listing queue bindings", skip(self))]
    pub async fn queue_bindings(&self, queue: &str) -> Result<Vec<BindingInfo>, ManagementError> {
        let response = self
            .client
            .get(format!(
                "{}/queues/{}/{}/bindings",
                self.base_url, self.vhost, queue
            ))
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ManagementError::Rejected {
                status: response.status().as_u16(),
            });
        }

        Ok(response.json().await?)
    }
}

/// The default vhost `/` must travel URL-encoded, as `%2F`.
fn encode_vhost(vhost: &str) -> String {
    vhost.replace('/', "%2F")
}

#[derive(thiserror::Error)]
pub enum ManagementError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("management API rejected the request with status {status}")]
    Rejected { status: u16 },
}

impl std::fmt::Debug for ManagementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
