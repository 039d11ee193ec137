//! Outbound HTTP capability.
//!
//! Namespace `httpclient`, operation `call`. The payload is a JSON request
//! document:
//!
//! ```json
//! {"method": "GET", "url": "https://...", "headers": {"k": "v"},
//!  "insecure": false, "body": "<base64>"}
//! ```
//!
//! and the result is a response document:
//!
//! ```json
//! {"status": {"code": 200, "status": "OK"}, "code": 200,
//!  "headers": {"server": "..."}, "body": "<base64>"}
//! ```
//!
//! `status` describes the host call itself; `code` is the upstream HTTP
//! status. A request that never got an HTTP response (bad input, connection
//! or TLS failure) fails with a response document whose `status.code` is not
//! 200 and whose `code` is 0.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::Capability;
use capsule_common::{CallbackError, HttpClientConfig, RuntimeError};
use capsule_core::CallContext;

/// Namespace served by [`HttpClientCapability`].
pub const NAMESPACE: &str = "httpclient";

/// The single operation of the namespace.
pub const OPERATION: &str = "call";

/// Request document sent by the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientRequest {
    /// HTTP method; defaults to `GET`.
    #[serde(default = "default_method")]
    pub method: String,

    /// Target URL.
    pub url: String,

    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,

    /// Request body.
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

/// Response document returned to the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientResponse {
    /// Outcome of the host call.
    pub status: CallStatus,

    /// Upstream HTTP status code; 0 when no response was received.
    pub code: u16,

    /// Response headers, names lowercased.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Response body.
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

/// Outcome of a host call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatus {
    /// 200 on success, 400 for bad input, 500 for transport failures.
    pub code: u16,
    /// Human-readable description.
    pub status: String,
}

fn default_method() -> String {
    "GET".to_string()
}

mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// HTTP client capability.
///
/// Holds two connection-pooled clients: one that verifies certificates and
/// one used only for requests that set `insecure`.
pub struct HttpClientCapability {
    client: Client,
    insecure_client: Client,
    timeout: Duration,
    max_body_bytes: usize,
}

impl HttpClientCapability {
    /// Create the capability.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] if a client cannot be built.
    pub fn new(config: &HttpClientConfig) -> Result<Self, RuntimeError> {
        Ok(Self {
            client: build_client(config, false)?,
            insecure_client: build_client(config, true)?,
            timeout: Duration::from_secs(config.timeout_secs),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Perform the request described by a request document.
    ///
    /// # Errors
    ///
    /// Returns the response document to deliver when the request failed
    /// before an HTTP response was received.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        request: HttpClientRequest,
    ) -> Result<HttpClientResponse, HttpClientResponse> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| bad_request(format!("Invalid HTTP method {}", request.method)))?;

        let url = Url::parse(&request.url)
            .map_err(|e| bad_request(format!("Invalid URL {}: {e}", request.url)))?;

        let client = if request.insecure {
            &self.insecure_client
        } else {
            &self.client
        };

        let timeout = ctx
            .remaining()
            .map_or(self.timeout, |remaining| remaining.min(self.timeout));

        debug!(
            request_id = %ctx.request_id(),
            method = %method,
            url = %url,
            insecure = request.insecure,
            "Executing HTTP request"
        );

        let mut builder = client.request(method, url.clone()).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "HTTP request failed");
            transport_failure(format!("Unable to execute HTTP request - {e}"))
        })?;

        let code = response.status().as_u16();

        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(transport_failure("Response body too large"));
        }

        let body = response.bytes().await.map_err(|e| {
            transport_failure(format!("Unable to read HTTP response body - {e}"))
        })?;
        if body.len() > self.max_body_bytes {
            return Err(transport_failure("Response body too large"));
        }

        info!(url = %url, status = code, body_size = body.len(), "HTTP request completed");

        Ok(HttpClientResponse {
            status: CallStatus {
                code: 200,
                status: "OK".to_string(),
            },
            code,
            headers,
            body: body.to_vec(),
        })
    }
}

fn build_client(config: &HttpClientConfig, insecure: bool) -> Result<Client, RuntimeError> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(10)
        .user_agent(concat!("capsule/", env!("CARGO_PKG_VERSION")))
        .danger_accept_invalid_certs(insecure)
        .build()
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to create HTTP client: {e}")))
}

fn failure(code: u16, status: String) -> HttpClientResponse {
    HttpClientResponse {
        status: CallStatus { code, status },
        ..Default::default()
    }
}

fn bad_request(status: impl Into<String>) -> HttpClientResponse {
    failure(400, status.into())
}

fn transport_failure(status: impl Into<String>) -> HttpClientResponse {
    failure(500, status.into())
}

fn into_error(response: &HttpClientResponse) -> CallbackError {
    CallbackError::Failed {
        message: response.status.status.clone(),
        payload: serde_json::to_vec(response).ok(),
    }
}

#[async_trait]
impl Capability for HttpClientCapability {
    fn namespace(&self) -> &str {
        NAMESPACE
    }

    async fn call(
        &self,
        ctx: &CallContext,
        operation: &str,
        _key: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, CallbackError> {
        if operation != OPERATION {
            return Err(CallbackError::UnknownOperation {
                namespace: NAMESPACE.to_string(),
                operation: operation.to_string(),
            });
        }

        let request: HttpClientRequest = serde_json::from_slice(payload).map_err(|e| {
            into_error(&bad_request(format!("Unable to parse request - {e}")))
        })?;

        match self.execute(ctx, request).await {
            Ok(response) => serde_json::to_vec(&response)
                .map_err(|e| CallbackError::failed(format!("Unable to encode response - {e}"))),
            Err(response) => Err(into_error(&response)),
        }
    }
}

impl std::fmt::Debug for HttpClientCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientCapability")
            .field("timeout", &self.timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish_non_exhaustive()
    }
}
