//! Best-effort reindex notifications to the reporting orchestrator. The
//! inventory's own state is authoritative; a failed notification is logged by
//! the caller and the reporting side re-synchronizes via periodic sweeps.

use std::time::Duration;

use serde::Serialize;

use crate::context::ReqCtx;
use crate::error::Error;

/// Applied to every outbound call when the caller carries no deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

const REINDEX_URI: &str = "/api/v1/workflow/reindex_reporting/batch";
const HEALTH_URI: &str = "/api/v1/health";

#[derive(Debug, Serialize)]
struct ReindexJob<'a> {
    request_id: &'a str,
    tenant_id: &'a str,
    device_id: &'a str,
    service: &'static str,
}

pub struct ReportingClient {
    base_url: String,
    http: reqwest::Client,
}

impl ReportingClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_DEADLINE)
            .build()
            .map_err(|e| Error::Internal(e.into()))?;
        Ok(ReportingClient {
            base_url: trim_base(base_url.into()),
            http,
        })
    }

    /// Submit one reindex job per device id, as a single batch.
    pub async fn start_reindex(&self, ctx: &ReqCtx, device_ids: &[String]) -> Result<(), Error> {
        if device_ids.is_empty() {
            return Ok(());
        }
        let tenant_id = ctx.tenant_id().unwrap_or_default();
        let jobs: Vec<ReindexJob> = device_ids
            .iter()
            .map(|id| ReindexJob {
                request_id: &ctx.request_id,
                tenant_id,
                device_id: id,
                service: "inventory",
            })
            .collect();

        let url = format!("{}{REINDEX_URI}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&jobs)
            .send()
            .await
            .map_err(|e| Error::Internal(e.into()))?;

        let status = resp.status();
        if status.as_u16() < 300 {
            Ok(())
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(Error::Internal(anyhow::anyhow!(
                "reindex workflow not defined"
            )))
        } else {
            Err(Error::Internal(anyhow::anyhow!(
                "reindex request returned unexpected status {status}"
            )))
        }
    }

    pub async fn check_health(&self) -> Result<(), Error> {
        let url = format!("{}{HEALTH_URI}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Internal(anyhow::anyhow!(
                "reporting health check returned status {}",
                resp.status()
            )))
        }
    }
}

fn trim_base(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        assert_eq!(trim_base("http://orchestrator:8080/".into()), "http://orchestrator:8080");
        assert_eq!(trim_base("http://orchestrator:8080".into()), "http://orchestrator:8080");
    }

    #[test]
    fn jobs_serialize_with_service_tag() {
        let job = ReindexJob {
            request_id: "req-1",
            tenant_id: "acme",
            device_id: "d1",
            service: "inventory",
        };
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["request_id"], "req-1");
        assert_eq!(v["tenant_id"], "acme");
        assert_eq!(v["device_id"], "d1");
        assert_eq!(v["service"], "inventory");
    }
}
