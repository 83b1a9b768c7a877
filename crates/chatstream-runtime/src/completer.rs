use std::error::Error as _;
use std::pin::Pin;
use std::time::Duration;

use futures::TryStreamExt as _;
use tracing::debug;

use crate::abort::AbortSignal;
use crate::errors::{ProviderError, RuntimeError, classify_http_error};
use crate::model::{OutgoingRequest, ProviderId};
use crate::profile::{AuthScheme, ProviderProfile};

/// Raw response body chunks.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, ProviderError>> + Send + 'static>>;

/// What a completion call returned.
pub enum CompletionResponse {
    /// Incremental body, framed according to the profile.
    Stream(ByteStream),
    /// Whole JSON response of a non-streaming request.
    Whole(serde_json::Value),
}

impl std::fmt::Debug for CompletionResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("CompletionResponse::Stream(..)"),
            Self::Whole(value) => f.debug_tuple("CompletionResponse::Whole").field(value).finish(),
        }
    }
}

/// Client seam used by `ProviderRuntime`.
///
/// Implementations receive a request that already went through the
/// profile's transforms and must report failures as `ProviderError`.
#[async_trait::async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn create(
        &self,
        request: OutgoingRequest,
        abort: AbortSignal,
    ) -> Result<CompletionResponse, ProviderError>;
}

/// `ChatCompleter` over HTTP using reqwest.
pub struct HttpCompleter {
    client: reqwest::Client,
    provider: ProviderId,
    base_url: String,
    reported_endpoint: String,
    auth: AuthScheme,
    api_key: Option<String>,
    headers: Vec<(String, String)>,
}

impl HttpCompleter {
    /// `timeout` bounds connecting and each wait for response bytes. A
    /// reply that keeps streaming is never cut off by it; callers stop long
    /// generations by aborting.
    pub fn new(
        profile: &ProviderProfile,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RuntimeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            provider: profile.id.clone(),
            base_url: profile.base_url.trim_end_matches('/').to_string(),
            reported_endpoint: profile.reported_endpoint(),
            auth: profile.auth.clone(),
            api_key,
            headers: profile
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    fn build(&self, request: &OutgoingRequest) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, request.path);
        let mut http_req = self.client.post(url).json(&request.body);
        if let Some(key) = self.api_key.as_deref() {
            http_req = match &self.auth {
                AuthScheme::Bearer => http_req.bearer_auth(key),
                AuthScheme::Header { name } => http_req.header(name.as_str(), key),
                AuthScheme::Query { param } => http_req.query(&[(param.as_str(), key)]),
                AuthScheme::None => http_req,
            };
        }
        for (name, value) in &self.headers {
            http_req = http_req.header(name.as_str(), value.as_str());
        }
        http_req
    }
}

#[async_trait::async_trait]
impl ChatCompleter for HttpCompleter {
    async fn create(
        &self,
        request: OutgoingRequest,
        mut abort: AbortSignal,
    ) -> Result<CompletionResponse, ProviderError> {
        let streaming = request.is_streaming();
        debug!(provider = %self.provider, path = %request.path, streaming, "sending completion request");

        let response = tokio::select! {
            _ = abort.aborted() => return Err(ProviderError::Cancelled),
            sent = self.build(&request).send() => sent.map_err(|e| {
                ProviderError::transport(self.provider.clone(), describe("request failed", e))
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(classify_http_error(
                &self.provider,
                status.as_u16(),
                &body,
                Some(self.reported_endpoint.clone()),
            ));
        }

        if streaming {
            let provider = self.provider.clone();
            let body: ByteStream = Box::pin(response.bytes_stream().map_err(move |e| {
                ProviderError::transport(provider.clone(), describe("body read failed", e))
            }));
            Ok(CompletionResponse::Stream(body))
        } else {
            let value = response.json::<serde_json::Value>().await.map_err(|e| {
                ProviderError::parse(self.provider.clone(), describe("invalid JSON response", e))
            })?;
            Ok(CompletionResponse::Whole(value))
        }
    }
}

/// Error text with its whole source chain. The URL is left out because it
/// may carry a query-string API key.
fn describe(context: &str, error: reqwest::Error) -> String {
    let error = error.without_url();
    let mut message = format!("{context}: {error}");
    let mut source = std::error::Error::source(&error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
