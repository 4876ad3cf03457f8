//! HTTP capability backed by reqwest.

use anyhow::Context;
use async_trait::async_trait;
use push_session::{HttpCapability, HttpResponse};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Form POSTs against the API base URL
pub struct ReqwestHttp {
    client: reqwest::Client,
    api_base: String,
}

impl ReqwestHttp {
    pub fn new(api_base: &str, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(user_agent)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl HttpCapability for ReqwestHttp {
    async fn post_form(&self, path: &str, fields: &[(String, String)]) -> anyhow::Result<HttpResponse> {
        let url = self.url(path);
        debug!("POST {} ({} fields)", url, fields.len());

        let response = self
            .client
            .post(&url)
            .form(fields)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {}", url))?;
        debug!("POST {} returned {}", url, status);

        Ok(HttpResponse { status, body })
    }
}
