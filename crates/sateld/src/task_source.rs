use std::time::Duration;

use reqwest::{Client, StatusCode};
use satele_core::config::BridgeConfig;
use satele_core::error::SateleError;
use satele_core::types::{ReportAck, ReportRequest, Task};
use tracing::{info, warn};

/// HTTP client for the external task queue.
#[derive(Debug, Clone)]
pub struct TaskSource {
    client: Client,
    base_url: String,
    auth_token: String,
}

impl TaskSource {
    pub fn from_config(cfg: &BridgeConfig) -> Result<Self, SateleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_seconds.max(1)))
            .build()
            .map_err(|err| SateleError::TaskSource(format!("build http client failed: {err}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim().trim_end_matches('/').to_string(),
            auth_token: cfg.auth_token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `Ok(None)` when the queue is empty.
    pub async fn fetch_next(&self) -> Result<Option<Task>, SateleError> {
        let resp = self
            .client
            .get(format!("{}/get-task", self.base_url))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .map_err(|err| SateleError::TaskSource(format!("poll failed: {err}")))?;
        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SateleError::TaskSource(format!("poll returned http {}", status.as_u16())));
        }
        let body = resp
            .text()
            .await
            .map_err(|err| SateleError::TaskSource(format!("read poll body failed: {err}")))?;
        parse_task_body(&body)
    }

    /// Deliver a result. Failures are logged and swallowed so a task is never reported twice.
    pub async fn report(&self, id: &str, output: &str) -> bool {
        let req = ReportRequest {
            id: id.to_string(),
            output: output.to_string(),
        };
        let resp = match self
            .client
            .post(format!("{}/report-result", self.base_url))
            .bearer_auth(&self.auth_token)
            .json(&req)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                warn!("report task_id={id} failed: {err}");
                return false;
            }
        };
        if !resp.status().is_success() {
            warn!("report task_id={id} rejected: http {}", resp.status().as_u16());
            return false;
        }
        let ack: ReportAck = resp.json().await.unwrap_or_default();
        info!(
            "reported task_id={id} ack={}",
            ack.status.as_deref().unwrap_or("-")
        );
        true
    }
}

/// An empty, `null` or id-less body means there is nothing to do.
pub(crate) fn parse_task_body(body: &str) -> Result<Option<Task>, SateleError> {
    let body = body.trim();
    if body.is_empty() || body == "null" || body == "{}" {
        return Ok(None);
    }
    let mut value: serde_json::Value = serde_json::from_str(body)
        .map_err(|err| SateleError::TaskSource(format!("bad task json: {err}")))?;
    let has_id = value
        .get("id")
        .map(|v| match v {
            serde_json::Value::String(s) => !s.trim().is_empty(),
            serde_json::Value::Null => false,
            _ => true,
        })
        .unwrap_or(false);
    if !has_id {
        return Ok(None);
    }
    if let Some(id) = value.get("id").filter(|v| v.is_number()).map(ToString::to_string) {
        value["id"] = serde_json::Value::String(id);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|err| SateleError::TaskSource(format!("bad task shape: {err}")))
}
