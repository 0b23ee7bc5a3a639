//! Google Cloud implementations of the warehouse (BigQuery) and identity (IAM) gateways.
//!
//! All calls go through the REST APIs with a token of the default credentials.

mod bigquery;
mod iam;
mod policy;

use std::{sync::Arc, time::Duration};

pub use bigquery::GcpWarehouse;
use google_cloud_auth::{project::Config, token::DefaultTokenSourceProvider};
use google_cloud_token::{TokenSource, TokenSourceProvider as _};
pub use iam::GcpIdentity;
use reqwest::{Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

use crate::service::{GatewayError, GatewayErrorKind};

const SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated HTTP client shared by the Google Cloud gateways.
#[derive(Debug, Clone)]
pub struct GcpClient {
    http: reqwest::Client,
    token_source: Arc<dyn TokenSource>,
}

impl GcpClient {
    /// Authenticate with application default credentials.
    pub async fn from_default_credentials() -> anyhow::Result<Self> {
        let provider =
            DefaultTokenSourceProvider::new(Config::default().with_scopes(SCOPES)).await?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            token_source: provider.token_source(),
        })
    }

    /// Send a JSON request. `Ok(None)` for responses without a body.
    async fn send<B, R>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        if_match: Option<&str>,
    ) -> Result<Option<R>, GatewayError>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let token = self.token_source.token().await.map_err(|e| {
            GatewayError::new(
                GatewayErrorKind::PermissionDenied,
                format!("Failed to obtain Google Cloud access token: {e}"),
            )
        })?;

        let mut request = self
            .http
            .request(method.clone(), url)
            .header(reqwest::header::AUTHORIZATION, token);
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(etag) = if_match {
            request = request.header(reqwest::header::IF_MATCH, etag);
        }

        let response = request.send().await.map_err(|e| {
            GatewayError::unavailable(format!("{method} {url} failed")).with_source(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::new(
                error_kind(status),
                format!("{method} {url} returned {status}: {text}"),
            ));
        }

        let bytes = response.bytes().await.map_err(|e| {
            GatewayError::unavailable(format!("Failed to read response of {method} {url}"))
                .with_source(e)
        })?;
        if bytes.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            GatewayError::unexpected(format!("Unexpected response body of {method} {url}"))
                .with_source(e)
        })
    }

    async fn get<R: DeserializeOwned>(&self, url: &str) -> Result<R, GatewayError> {
        self.send::<(), R>(Method::GET, url, None, None)
            .await?
            .ok_or_else(|| GatewayError::unexpected(format!("Empty response of GET {url}")))
    }

    async fn post<B, R>(&self, url: &str, body: &B) -> Result<R, GatewayError>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        self.send::<B, R>(Method::POST, url, Some(body), None)
            .await?
            .ok_or_else(|| GatewayError::unexpected(format!("Empty response of POST {url}")))
    }

    /// Conditional update. A stale `etag` fails with `Unavailable` so callers retry.
    async fn patch<B>(&self, url: &str, body: &B, etag: Option<&str>) -> Result<(), GatewayError>
    where
        B: Serialize + Sync + ?Sized,
    {
        self.send::<B, serde_json::Value>(Method::PATCH, url, Some(body), etag)
            .await
            .map(|_| ())
    }

    async fn delete(&self, url: &str) -> Result<(), GatewayError> {
        self.send::<(), serde_json::Value>(Method::DELETE, url, None, None)
            .await
            .map(|_| ())
    }
}

fn error_kind(status: StatusCode) -> GatewayErrorKind {
    match status {
        StatusCode::NOT_FOUND => GatewayErrorKind::NotFound,
        StatusCode::CONFLICT => GatewayErrorKind::AlreadyExists,
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => GatewayErrorKind::PermissionDenied,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::PRECONDITION_FAILED
        | StatusCode::REQUEST_TIMEOUT => GatewayErrorKind::Unavailable,
        s if s.is_server_error() => GatewayErrorKind::Unavailable,
        _ => GatewayErrorKind::Unexpected,
    }
}

/// IAM member string of a service account.
fn service_account_member(email: &str) -> String {
    format!("serviceAccount:{email}")
}

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(error_kind(StatusCode::NOT_FOUND), GatewayErrorKind::NotFound);
        assert_eq!(error_kind(StatusCode::CONFLICT), GatewayErrorKind::AlreadyExists);
        assert_eq!(
            error_kind(StatusCode::BAD_GATEWAY),
            GatewayErrorKind::Unavailable
        );
        assert_eq!(
            error_kind(StatusCode::BAD_REQUEST),
            GatewayErrorKind::Unexpected
        );
    }

    #[test]
    fn test_member_and_encoding() {
        assert_eq!(
            service_account_member("dp-1@p.iam.gserviceaccount.com"),
            "serviceAccount:dp-1@p.iam.gserviceaccount.com"
        );
        assert_eq!(encode("a b@c"), "a%20b%40c");
    }
}
