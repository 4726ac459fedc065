//! Synchronous alert lookups against the device-monitoring service.

use crate::context::ReqCtx;
use crate::error::Error;
use crate::reporting::DEFAULT_DEADLINE;

pub struct MonitoringClient {
    base_url: String,
    http: reqwest::Client,
}

impl MonitoringClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_DEADLINE)
            .build()
            .map_err(|e| Error::Internal(e.into()))?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(MonitoringClient { base_url, http })
    }

    /// Number of currently latest alerts for the device.
    pub async fn check_alerts(&self, ctx: &ReqCtx, device_id: &str) -> Result<usize, Error> {
        let tenant_id = ctx.tenant_id().unwrap_or_default();
        let url = alerts_url(&self.base_url, tenant_id, device_id);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        if !resp.status().is_success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "alerts request returned unexpected status {}",
                resp.status()
            )));
        }
        let alerts: Vec<serde_json::Value> =
            resp.json().await.map_err(|e| Error::Internal(e.into()))?;
        Ok(alerts.len())
    }
}

fn alerts_url(base: &str, tenant_id: &str, device_id: &str) -> String {
    format!("{base}/api/internal/v1/devicemonitor/tenants/{tenant_id}/devices/{device_id}/alerts/latest")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_path_templates_tenant_and_device() {
        assert_eq!(
            alerts_url("http://devicemonitor:8080", "acme", "d1"),
            "http://devicemonitor:8080/api/internal/v1/devicemonitor/tenants/acme/devices/d1/alerts/latest"
        );
    }
}
