use std::fmt;

/// Stable identifier for a configured provider (for example `openai`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Creates a provider id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the provider id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Model selection: which provider serves which model.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelRef {
    /// Provider that owns the model.
    pub provider: ProviderId,
    /// Provider-specific model name (for example `gpt-4o-mini`).
    pub model: String,
}

impl ModelRef {
    /// Creates a model reference.
    pub fn new(provider: impl Into<ProviderId>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Chat message author role.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message of the conversation sent to the provider.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

fn default_stream() -> bool {
    true
}

/// Provider-agnostic chat completion request.
///
/// Fields not modelled explicitly travel in `extra` and are flattened into the
/// request body, so profile transforms can reach them like any other field.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatPayload {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Tool definitions in the provider's function-calling format.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatPayload {
    /// Creates a streaming payload for `model` with the given messages.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: Vec::new(),
            stream: true,
            extra: serde_json::Map::new(),
        }
    }

    pub fn temperature(mut self, value: f64) -> Self {
        self.temperature = Some(value);
        self
    }

    pub fn top_p(mut self, value: f64) -> Self {
        self.top_p = Some(value);
        self
    }

    pub fn max_tokens(mut self, value: u32) -> Self {
        self.max_tokens = Some(value);
        self
    }

    pub fn tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = tools;
        self
    }

    /// Requests a whole (non-streamed) response from the provider.
    pub fn non_streaming(mut self) -> Self {
        self.stream = false;
        self
    }

    /// Sets an extra provider-specific body field.
    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Dispatch-ready request: endpoint path plus JSON body.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingRequest {
    /// Path appended to the profile base URL (for example `/chat/completions`).
    pub path: String,
    pub body: serde_json::Value,
}

impl OutgoingRequest {
    /// Whether the body asks for an incremental response.
    pub fn is_streaming(&self) -> bool {
        self.body
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_extra_fields_flat_and_skips_unset_sampling() {
        let payload = ChatPayload::new("m", vec![ChatMessage::user("hi")])
            .extra("seed", serde_json::json!(7));
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value.get("seed"), Some(&serde_json::json!(7)));
        assert!(value.get("temperature").is_none());
        assert_eq!(value.get("stream"), Some(&serde_json::json!(true)));
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn outgoing_request_defaults_to_streaming() {
        let req = OutgoingRequest {
            path: "/x".into(),
            body: serde_json::json!({}),
        };
        assert!(req.is_streaming());
        let req = OutgoingRequest {
            path: "/x".into(),
            body: serde_json::json!({"stream": false}),
        };
        assert!(!req.is_streaming());
    }
}
