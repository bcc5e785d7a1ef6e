use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Url};
use tracing::warn;

use crate::config::HttpSinkConfig;
use crate::error::{Error, Result};
use crate::message::DeliveryOutcome;
use crate::sink::DeliverySink;

const OCTET_STREAM: &str = "application/octet-stream";

/// Sends each payload as the body of a `POST` to a fixed endpoint.
#[derive(Clone)]
pub(crate) struct HttpSink {
    client: Client,
    endpoint: Url,
    request_timeout: Duration,
    static_headers: HeaderMap,
}

impl HttpSink {
    pub(crate) fn new(config: &HttpSinkConfig) -> Result<Self> {
        let mut static_headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("Invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("Invalid value for header {name}: {e}")))?;
            static_headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Sink(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            request_timeout: config.request_timeout,
            static_headers,
        })
    }

    fn request_headers(&self, headers: &HashMap<String, String>) -> HeaderMap {
        let mut request_headers =
            HeaderMap::with_capacity(headers.len() + self.static_headers.len() + 1);
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    request_headers.insert(name, value);
                }
                _ => warn!(header = name, "Skipping header that is not valid in HTTP"),
            }
        }
        for (name, value) in &self.static_headers {
            request_headers.insert(name.clone(), value.clone());
        }
        request_headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
        request_headers
    }
}

impl DeliverySink for HttpSink {
    async fn send(&self, payload: Bytes, headers: &HashMap<String, String>) -> DeliveryOutcome {
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.request_headers(headers))
            .body(payload)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    DeliveryOutcome::Success
                } else if status.is_client_error() {
                    DeliveryOutcome::terminal(format!(
                        "endpoint rejected the payload with {status}"
                    ))
                } else {
                    DeliveryOutcome::retryable(format!("endpoint responded with {status}"))
                }
            }
            Err(e) if e.is_timeout() => DeliveryOutcome::retryable(format!(
                "request timed out after {:?}",
                self.request_timeout
            )),
            Err(e) if e.is_builder() => {
                DeliveryOutcome::terminal(format!("failed to build request: {e}"))
            }
            Err(e) => DeliveryOutcome::retryable(format!("request failed: {e}")),
        }
    }
}
