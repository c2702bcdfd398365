//! HTTP client for the monitoring service API.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::{MonitorError, MonitorRequest, MonitorService, MonitorStarted, RemoteJobStatus};
use crate::util::trim_base_url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Bearer,
    /// Google API keys are passed in their own header.
    GoogleKey,
}

#[derive(Clone)]
pub struct HttpMonitorClient {
    base_url: String,
    api_key: String,
    auth_mode: AuthMode,
    client: reqwest::Client,
}

impl HttpMonitorClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let auth_mode = if api_key.starts_with("AIza") {
            AuthMode::GoogleKey
        } else {
            AuthMode::Bearer
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: format!("{}/api", trim_base_url(base_url)),
            api_key,
            auth_mode,
            client,
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.auth_mode {
            AuthMode::Bearer => builder.bearer_auth(&self.api_key),
            AuthMode::GoogleKey => builder.header("X-Google-Api-Key", &self.api_key),
        }
    }

    async fn send_raw(&self, builder: RequestBuilder, path: &str) -> Result<String, MonitorError> {
        let resp = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| MonitorError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            tracing::error!(status = %status, path = %path, body = %text, "Monitor service API error");
            return Err(MonitorError::Api {
                status: status.as_u16(),
                path: path.to_string(),
                body: text,
            });
        }
        Ok(text)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        path: &str,
    ) -> Result<T, MonitorError> {
        let text = self.send_raw(builder, path).await?;
        serde_json::from_str(&text).map_err(|e| {
            MonitorError::InvalidResponse(format!("{} ({}): {}", path, e, text))
        })
    }
}

#[async_trait]
impl MonitorService for HttpMonitorClient {
    async fn start_monitor(&self, request: &MonitorRequest) -> Result<String, MonitorError> {
        let path = "/live-monitor";
        let builder = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(request);
        let started: MonitorStarted = self.send(builder, path).await?;

        if started.status.as_deref() == Some("error") {
            return Err(MonitorError::Rejected(
                started.message.unwrap_or_else(|| "no message".to_string()),
            ));
        }
        if started.job_id.is_empty() {
            return Err(MonitorError::InvalidResponse(
                "live-monitor response has an empty job_id".to_string(),
            ));
        }
        Ok(started.job_id)
    }

    async fn job_status(&self, job_id: &str) -> Result<RemoteJobStatus, MonitorError> {
        let path = format!("/jobs/{}", urlencoding::encode(job_id));
        let builder = self.client.get(format!("{}{}", self.base_url, path));
        self.send(builder, &path).await
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), MonitorError> {
        let path = format!("/jobs/{}/cancel", urlencoding::encode(job_id));
        let builder = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&serde_json::json!({}));
        self.send_raw(builder, &path).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn google_keys_use_their_own_header() {
        let client = HttpMonitorClient::new("https://monitor.invalid/", "AIzaSyExample");
        assert_eq!(client.auth_mode, AuthMode::GoogleKey);
        assert_eq!(client.base_url, "https://monitor.invalid/api");

        let client = HttpMonitorClient::new("https://monitor.invalid", "tk_live_123");
        assert_eq!(client.auth_mode, AuthMode::Bearer);
        assert!(client.has_api_key());
    }
}
