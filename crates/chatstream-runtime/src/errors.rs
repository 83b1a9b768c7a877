use crate::model::ProviderId;

/// Classification of a structured provider failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// Credentials were rejected (HTTP 401).
    InvalidApiKey,
    /// Account is out of quota or balance.
    InsufficientQuota,
    /// Requested model does not exist for this provider.
    ModelNotFound,
    /// Prompt exceeds the model context window.
    ExceededContextWindow,
    /// Any other provider-reported failure.
    ProviderBizError,
}

/// Errors surfaced by a provider runtime.
///
/// Every failure leaving `ProviderRuntime` has this shape, whatever client
/// produced it. The original cause is carried along (`cause` holds the raw
/// provider error body when one was returned).
#[derive(Debug, Clone, PartialEq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderError {
    /// Network or connection failure.
    #[error("transport error ({provider}): {message}")]
    Transport {
        provider: ProviderId,
        message: String,
    },
    /// Provider returned a structured error payload.
    #[error("provider error ({provider}, {kind:?}): {message}")]
    Api {
        provider: ProviderId,
        kind: ApiErrorKind,
        status: Option<u16>,
        message: String,
        /// Desensitized endpoint the request was sent to.
        endpoint: Option<String>,
        cause: Option<serde_json::Value>,
    },
    /// A chunk could not be decoded.
    #[error("parse error ({provider}): {message}")]
    Parse {
        provider: ProviderId,
        message: String,
    },
    /// The operation was aborted by the caller.
    #[error("cancelled")]
    Cancelled,
    /// The response body ended before the provider signalled completion.
    #[error("stream from {provider} closed before completion")]
    StreamIncomplete { provider: ProviderId },
}

impl ProviderError {
    /// Creates a transport-level error.
    pub fn transport(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates a provider business error without HTTP context.
    pub fn api(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Api {
            provider: provider.into(),
            kind: ApiErrorKind::ProviderBizError,
            status: None,
            message: message.into(),
            endpoint: None,
            cause: None,
        }
    }

    /// Creates a decode error.
    pub fn parse(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Parse {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Returns the provider associated with this error, if any.
    pub fn provider_id(&self) -> Option<&ProviderId> {
        match self {
            Self::Transport { provider, .. }
            | Self::Api { provider, .. }
            | Self::Parse { provider, .. }
            | Self::StreamIncomplete { provider } => Some(provider),
            Self::Cancelled => None,
        }
    }

    /// Returns the classified kind for API errors.
    pub fn api_kind(&self) -> Option<ApiErrorKind> {
        match self {
            Self::Api { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether this error represents a caller-side abort rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Builds a classified `ProviderError::Api` from an HTTP error response.
pub fn classify_http_error(
    provider: &ProviderId,
    status: u16,
    body: &str,
    endpoint: Option<String>,
) -> ProviderError {
    let cause = serde_json::from_str::<serde_json::Value>(body)
        .unwrap_or_else(|_| serde_json::Value::String(body.to_string()));
    let fallback = match body.trim() {
        "" => format!("HTTP {status}"),
        trimmed => trimmed.to_string(),
    };
    api_error_from_payload(provider, Some(status), cause, &fallback, endpoint)
}

/// Builds a classified `ProviderError::Api` from a provider error payload,
/// either an HTTP error body or an `error` object sent inside a stream.
pub fn api_error_from_payload(
    provider: &ProviderId,
    status: Option<u16>,
    payload: serde_json::Value,
    fallback_message: &str,
    endpoint: Option<String>,
) -> ProviderError {
    let error_obj = payload.get("error").unwrap_or(&payload);
    let code = error_obj
        .get("code")
        .or_else(|| error_obj.get("type"))
        .and_then(|v| v.as_str());
    let message = error_obj
        .get("message")
        .and_then(|v| v.as_str())
        .or_else(|| error_obj.as_str())
        .unwrap_or(fallback_message)
        .to_string();

    let kind = if status == Some(401) {
        ApiErrorKind::InvalidApiKey
    } else if message.contains("Insufficient Balance") {
        ApiErrorKind::InsufficientQuota
    } else {
        match code {
            Some("insufficient_quota") => ApiErrorKind::InsufficientQuota,
            Some("model_not_found") => ApiErrorKind::ModelNotFound,
            Some("context_length_exceeded" | "string_above_max_length") => {
                ApiErrorKind::ExceededContextWindow
            }
            Some("invalid_api_key") => ApiErrorKind::InvalidApiKey,
            _ => ApiErrorKind::ProviderBizError,
        }
    };

    ProviderError::Api {
        provider: provider.clone(),
        kind,
        status,
        message,
        endpoint,
        cause: Some(payload),
    }
}

/// Masks the host of a user-supplied endpoint so proxies and self-hosted
/// gateways do not leak into error reports.
///
/// The first host label is replaced with `***`; hosts with two labels or
/// fewer keep only their first and last characters. Port and credentials
/// are dropped, the path is kept.
pub fn desensitize_url(url: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return "***".to_string();
    };
    let host = parsed.host_str().unwrap_or_default();
    let labels: Vec<&str> = host.split('.').collect();
    let masked_host = if labels.len() > 2 {
        let mut masked = vec!["***"];
        masked.extend_from_slice(&labels[1..]);
        masked.join(".")
    } else {
        let chars: Vec<char> = host.chars().collect();
        match chars.as_slice() {
            [] => String::new(),
            [only] => format!("{only}***"),
            [first, .., last] => format!("{first}***{last}"),
        }
    };
    let path = parsed.path().trim_end_matches('/');
    format!("{}://{}{}", parsed.scheme(), masked_host, path)
}

/// Errors raised while building runtimes from configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// Invalid factory or profile configuration.
    #[error("config error: {0}")]
    Config(String),
    /// The profile is internally inconsistent.
    #[error("invalid profile {provider}: {message}")]
    InvalidProfile {
        provider: ProviderId,
        message: String,
    },
    /// No API key could be resolved for a provider that needs one.
    #[error("missing API key for {provider} (set {env})")]
    MissingApiKey { provider: ProviderId, env: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ProviderId {
        ProviderId::new("acme")
    }

    #[test]
    fn status_401_is_invalid_api_key() {
        let err = classify_http_error(&provider(), 401, r#"{"error":{"message":"bad key"}}"#, None);
        assert_eq!(err.api_kind(), Some(ApiErrorKind::InvalidApiKey));
        assert!(err.to_string().contains("bad key"));
    }

    #[test]
    fn error_codes_are_classified() {
        let cases = [
            ("insufficient_quota", ApiErrorKind::InsufficientQuota),
            ("model_not_found", ApiErrorKind::ModelNotFound),
            ("context_length_exceeded", ApiErrorKind::ExceededContextWindow),
            ("string_above_max_length", ApiErrorKind::ExceededContextWindow),
            ("something_else", ApiErrorKind::ProviderBizError),
        ];
        for (code, expected) in cases {
            let body = format!(r#"{{"error":{{"code":"{code}","message":"m"}}}}"#);
            let err = classify_http_error(&provider(), 400, &body, None);
            assert_eq!(err.api_kind(), Some(expected), "code {code}");
        }
    }

    #[test]
    fn insufficient_balance_message_wins_over_code() {
        let body = r#"{"error":{"code":"x","message":"Insufficient Balance"}}"#;
        let err = classify_http_error(&provider(), 402, body, None);
        assert_eq!(err.api_kind(), Some(ApiErrorKind::InsufficientQuota));
    }

    #[test]
    fn non_json_body_is_kept_as_cause() {
        let err = classify_http_error(&provider(), 502, "upstream down", None);
        match err {
            ProviderError::Api {
                status,
                message,
                cause,
                ..
            } => {
                assert_eq!(status, Some(502));
                assert_eq!(message, "upstream down");
                assert_eq!(cause, Some(serde_json::json!("upstream down")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn in_stream_error_object_is_classified_without_status() {
        let payload = serde_json::json!({"error": {"code": "model_not_found", "message": "no such model"}});
        let err = api_error_from_payload(&provider(), None, payload.clone(), "stream error", None);
        assert_eq!(err.api_kind(), Some(ApiErrorKind::ModelNotFound));
        match err {
            ProviderError::Api { status, cause, .. } => {
                assert_eq!(status, None);
                assert_eq!(cause, Some(payload));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn desensitize_masks_first_label_and_drops_port() {
        assert_eq!(
            desensitize_url("https://my-proxy.example.com:8443/v1/"),
            "https://***.example.com/v1"
        );
        assert_eq!(desensitize_url("http://localhost:11434"), "http://l***t");
        assert_eq!(desensitize_url("not a url"), "***");
    }

    #[test]
    fn provider_error_serializes_with_type_tag() {
        let value = serde_json::to_value(ProviderError::Cancelled).expect("serialize");
        assert_eq!(value, serde_json::json!({"type": "cancelled"}));
    }
}
