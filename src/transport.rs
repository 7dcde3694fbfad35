//! The outbound call of an iteration.
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, Url, header::CONTENT_TYPE};

use crate::error::{ConfigError, TransportError};

/// A response as seen by the checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Sends one request body to the target.
///
/// Implementations enforce their own timeout and report it as
/// [`TransportError::Timeout`].
pub trait Transport: Send + Sync {
    fn post(&self, body: Vec<u8>) -> BoxFuture<'_, Result<TransportResponse, TransportError>>;
}

/// `POST` with a JSON content type over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, ConfigError> {
        // The client is built once and cloned into every worker.
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ConfigError::Client)?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn map_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            TransportError::Body(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

impl Transport for HttpTransport {
    fn post(&self, body: Vec<u8>) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.endpoint.clone())
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(|e| self.map_error(e))?;
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(|e| self.map_error(e))?;
            Ok(TransportResponse {
                status,
                body: body.to_vec(),
            })
        })
    }
}
