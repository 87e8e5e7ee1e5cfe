//! External status providers polled by the aggregator.
//!
//! A provider answers "what is the state of resource X right now" with an
//! opaque JSON payload. The elevator feed is keyed by metro line, the
//! vehicle feed by route code.

use crate::error::FetchError;
use crate::models::{ELEVATORS_PROVIDER, VEHICLES_PROVIDER};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Which alert rule a provider's snapshots feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Elevators,
    Vehicles,
}

impl ProviderKind {
    pub fn default_id(&self) -> &'static str {
        match self {
            ProviderKind::Elevators => ELEVATORS_PROVIDER,
            ProviderKind::Vehicles => VEHICLES_PROVIDER,
        }
    }
}

#[async_trait]
pub trait StatusProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn fetch(&self, resource_id: &str) -> Result<Value, FetchError>;
}

/// Plain HTTP GET provider; `url_template` holds a `{resource}` placeholder.
pub struct HttpStatusProvider {
    id: String,
    url_template: String,
    client: Client,
}

impl HttpStatusProvider {
    pub fn new(id: impl Into<String>, url_template: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("deafnav-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Unreachable(format!("http client: {e}")))?;
        Ok(Self {
            id: id.into(),
            url_template: url_template.into(),
            client,
        })
    }

    pub fn url_for(&self, resource_id: &str) -> String {
        self.url_template.replace("{resource}", resource_id)
    }
}

#[async_trait]
impl StatusProvider for HttpStatusProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, resource_id: &str) -> Result<Value, FetchError> {
        let url = self.url_for(resource_id);
        debug!("[provider:{}] GET {url}", self.id);
        let res = self.client.get(&url).send().await?;

        if !res.status().is_success() {
            return Err(FetchError::BadStatus(res.status().as_u16()));
        }

        let body = res.text().await?;
        serde_json::from_str(&body).map_err(|e| FetchError::InvalidPayload(e.to_string()))
    }
}
