use std::time::Duration;

use rampart_core::error::AppError;
use rampart_core::traits::Fetcher;
use reqwest::Client;
use url::Url;

/// HTTP fetcher using reqwest.
///
/// Downloads the raw body of a source URL. Transport failures are mapped onto
/// [`AppError`] so the default retry and breaker classification applies:
/// timeouts become `Timeout`, connection failures `NetworkError` and non-2xx
/// responses `HttpStatus`.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("Rampart/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
        })
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let parsed = parse_source_url(url)?;
        tracing::debug!(%url, "Fetching source");

        let response = self.client.get(parsed).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else {
                AppError::NetworkError(format!("Failed to read response body: {e}"))
            }
        })
    }
}

/// Host (and explicit port, if any) of a source URL.
///
/// Sources sharing a host share a circuit breaker.
pub fn source_host(url: &str) -> Result<String, AppError> {
    let parsed = parse_source_url(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::HttpError(format!("URL has no host: {url}")))?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Only `http` and `https` URLs with a host are accepted.
fn parse_source_url(url: &str) -> Result<Url, AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL '{url}': {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::HttpError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(AppError::HttpError(format!("URL has no host: {url}")));
    }

    Ok(parsed)
}
