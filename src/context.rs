use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;

use crate::error::Error;

pub const HEADER_TENANT_ID: &str = "x-tenant-id";
pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_DEVICE_ID: &str = "x-device-id";

/// Per-request identity: which tenant the caller acts for and the request id
/// that travels to the reporting/monitoring services. Token introspection
/// happens upstream; by the time a request reaches the core the identity is
/// plain headers.
#[derive(Debug, Clone, Default)]
pub struct ReqCtx {
    pub tenant_id: Option<String>,
    pub request_id: String,
}

impl ReqCtx {
    pub fn new(tenant_id: Option<String>) -> Self {
        ReqCtx {
            tenant_id,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        ReqCtx {
            tenant_id: header(HEADER_TENANT_ID),
            request_id: header(HEADER_REQUEST_ID)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// The tenant id, required. Internal endpoints call this and map the
    /// absence to a 400.
    pub fn require_tenant(&self) -> Result<&str, Error> {
        self.tenant_id
            .as_deref()
            .ok_or_else(|| Error::validation("missing tenant identity"))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ReqCtx {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ReqCtx::from_headers(&parts.headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn headers_populate_context() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_TENANT_ID, HeaderValue::from_static("acme"));
        headers.insert(HEADER_REQUEST_ID, HeaderValue::from_static("req-1"));
        let ctx = ReqCtx::from_headers(&headers);
        assert_eq!(ctx.tenant_id(), Some("acme"));
        assert_eq!(ctx.request_id, "req-1");
    }

    #[test]
    fn missing_request_id_is_generated() {
        let ctx = ReqCtx::from_headers(&HeaderMap::new());
        assert!(!ctx.request_id.is_empty());
        assert!(ctx.tenant_id().is_none());
        assert!(ctx.require_tenant().is_err());
    }
}
