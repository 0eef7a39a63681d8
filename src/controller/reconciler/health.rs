//! Health probe for the workspace's main endpoint.

use crate::controller::reconciler::errors::{FailureReason, ProvisionError};
use crate::provision::{HealthProbe, ProbeResult};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tracing::debug;

const HEALTHZ_PATH: &str = "/healthz";

/// Replace the path of `main_url` with `/healthz`
///
/// # Errors
///
/// `Fail(InfrastructureFailure)` when the URL cannot be parsed.
pub fn health_url(main_url: &str) -> Result<Url, ProvisionError> {
    let mut url = Url::parse(main_url).map_err(|err| {
        ProvisionError::fail_with_reason(
            format!("failed to parse main URL '{main_url}': {err}"),
            FailureReason::InfrastructureFailure,
        )
    })?;
    url.set_path(HEALTHZ_PATH);
    url.set_query(None);
    Ok(url)
}

/// Whether a response status means the endpoint is up
///
/// 401, 403 and 404 count: the server answers but either does not implement
/// `/healthz` or puts it behind authentication.
#[must_use]
pub fn status_ready(status: StatusCode) -> bool {
    status.is_success()
        || matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        )
}

/// `GET <main URL>/healthz` with a short timeout
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    /// Build a probe that gives up after `timeout`
    ///
    /// Workspace endpoints usually serve self-signed certificates, so the
    /// probe does not verify them.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, main_url: &str) -> Result<ProbeResult, ProvisionError> {
        let url = health_url(main_url)?;
        match self.client.get(url.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                Ok(ProbeResult {
                    ready: status_ready(status),
                    status_code: Some(status.as_u16()),
                })
            }
            Err(err) => {
                debug!("Health probe {} failed: {}", url, err);
                Ok(ProbeResult {
                    ready: false,
                    status_code: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url_replaces_path() {
        let test_cases = vec![
            ("https://ws.example.com/", "https://ws.example.com/healthz"),
            (
                "http://ws-service.user.svc:3100/status?tab=1",
                "http://ws-service.user.svc:3100/healthz",
            ),
            ("https://ws.example.com", "https://ws.example.com/healthz"),
        ];
        for (main_url, expected) in test_cases {
            assert_eq!(health_url(main_url).unwrap().as_str(), expected, "{main_url}");
        }
    }

    #[test]
    fn test_health_url_rejects_garbage() {
        assert!(matches!(
            health_url("not a url"),
            Err(ProvisionError::Fail {
                reason: Some(FailureReason::InfrastructureFailure),
                ..
            })
        ));
    }

    #[test]
    fn test_status_ready() {
        let test_cases = vec![
            (StatusCode::OK, true),
            (StatusCode::NO_CONTENT, true),
            (StatusCode::UNAUTHORIZED, true),
            (StatusCode::FORBIDDEN, true),
            (StatusCode::NOT_FOUND, true),
            (StatusCode::BAD_GATEWAY, false),
            (StatusCode::SERVICE_UNAVAILABLE, false),
            (StatusCode::INTERNAL_SERVER_ERROR, false),
        ];
        for (status, ready) in test_cases {
            assert_eq!(status_ready(status), ready, "status {status}");
        }
    }
}
