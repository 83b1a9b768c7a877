//! Declarative provider descriptors.
//!
//! A [`ProviderProfile`] holds everything needed to talk to one
//! OpenAI-compatible (or close enough) provider: where to send requests, how
//! to authenticate, how to reshape the body and how responses are framed.
//! Profiles are plain data so new providers can be added from a settings file.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::env::EnvSource;
use crate::errors::{ProviderError, RuntimeError, desensitize_url};
use crate::json_stream::ScanMode;
use crate::model::{ChatPayload, OutgoingRequest, ProviderId};

fn default_chat_path() -> String {
    "/chat/completions".to_string()
}

/// How the API key is attached to requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`.
    #[default]
    Bearer,
    /// Key sent verbatim in a custom header.
    Header { name: String },
    /// Key sent as a query parameter.
    Query { param: String },
    /// No credentials (local servers).
    None,
}

/// Framing of the response body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    /// Server-sent events with one JSON chunk per `data:` line.
    #[default]
    Sse,
    /// Whole JSON objects written back to back.
    JsonObjects,
    /// Raw text deltas without framing.
    PlainText,
}

/// When request/response tracing is on.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugPredicate {
    #[default]
    Never,
    Always,
    /// On when the named environment flag is truthy.
    Env(String),
}

impl DebugPredicate {
    pub fn is_enabled(&self, env: &EnvSource) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Env(name) => env.flag(name),
        }
    }
}

/// One request-shaping step. Field names may use `.` to reach nested objects.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformStep {
    /// Multiplies a numeric field.
    Scale { field: String, factor: f64 },
    /// Clamps a numeric field into `[min, max]`.
    Clamp {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Removes fields the provider rejects.
    Strip { fields: Vec<String> },
    /// Moves a field to another name.
    Rename { from: String, to: String },
    /// Forces a value.
    Set { field: String, value: Value },
    /// Sets a value only when the field is absent.
    Default { field: String, value: Value },
    /// Replaces the endpoint path. `{model}` expands to the request model.
    RewritePath { path: String },
}

impl TransformStep {
    fn apply(&self, body: &mut Map<String, Value>, path: &mut String) {
        match self {
            Self::Scale { field, factor } => {
                if let Some(n) = get_path(body, field).and_then(Value::as_f64) {
                    set_path(body, field, number(n * factor));
                }
            }
            Self::Clamp { field, min, max } => {
                if let Some(n) = get_path(body, field).and_then(Value::as_f64) {
                    let mut clamped = n;
                    if let Some(min) = min {
                        clamped = clamped.max(*min);
                    }
                    if let Some(max) = max {
                        clamped = clamped.min(*max);
                    }
                    if clamped != n {
                        set_path(body, field, number(clamped));
                    }
                }
            }
            Self::Strip { fields } => {
                for field in fields {
                    remove_path(body, field);
                }
            }
            Self::Rename { from, to } => {
                if let Some(value) = remove_path(body, from) {
                    set_path(body, to, value);
                }
            }
            Self::Set { field, value } => set_path(body, field, value.clone()),
            Self::Default { field, value } => {
                if get_path(body, field).is_none_or(Value::is_null) {
                    set_path(body, field, value.clone());
                }
            }
            Self::RewritePath { path: template } => {
                let model = body.get("model").and_then(Value::as_str).unwrap_or_default();
                *path = template.replace("{model}", model);
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Scale { factor, .. } if !factor.is_finite() => {
                Err(format!("scale factor must be finite, got {factor}"))
            }
            Self::Clamp {
                min: Some(min),
                max: Some(max),
                field,
            } if min > max => Err(format!("clamp on {field}: min {min} exceeds max {max}")),
            Self::Rename { from, to } if from.is_empty() || to.is_empty() => {
                Err("rename needs non-empty field names".into())
            }
            Self::RewritePath { path } if !path.starts_with('/') => {
                Err(format!("rewritten path must start with '/', got {path}"))
            }
            _ => Ok(()),
        }
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn get_path<'a>(body: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = body.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn set_path(body: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };
    let mut current = body;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

fn remove_path(body: &mut Map<String, Value>, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => body.remove(path),
        Some((parent, last)) => {
            let mut segments = parent.split('.');
            let mut current = body.get_mut(segments.next()?)?;
            for segment in segments {
                current = current.get_mut(segment)?;
            }
            current.as_object_mut()?.remove(last)
        }
    }
}

/// Static descriptor of one provider.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderProfile {
    pub id: ProviderId,
    pub base_url: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default)]
    pub auth: AuthScheme,
    /// Inline key; takes precedence over `api_key_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Applied in order to every outgoing request.
    #[serde(default)]
    pub transforms: Vec<TransformStep>,
    #[serde(default)]
    pub response_shape: ResponseShape,
    /// Object boundary detection for `json_objects` bodies.
    #[serde(default)]
    pub json_scan: ScanMode,
    /// Ask the provider to append token usage to streamed responses.
    #[serde(default)]
    pub include_usage: bool,
    #[serde(default)]
    pub debug: DebugPredicate,
}

impl ProviderProfile {
    /// Minimal OpenAI-compatible profile using bearer auth.
    pub fn openai_compatible(id: impl Into<ProviderId>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            chat_path: default_chat_path(),
            auth: AuthScheme::Bearer,
            api_key: None,
            api_key_env: None,
            headers: BTreeMap::new(),
            transforms: Vec::new(),
            response_shape: ResponseShape::Sse,
            json_scan: ScanMode::default(),
            include_usage: false,
            debug: DebugPredicate::Never,
        }
    }

    pub fn openai() -> Self {
        let mut profile = Self::openai_compatible("openai", OPENAI_BASE_URL);
        profile.api_key_env = Some("OPENAI_API_KEY".into());
        profile.include_usage = true;
        profile.debug = DebugPredicate::Env("DEBUG_OPENAI_CHAT_COMPLETION".into());
        profile
    }

    pub fn deepseek() -> Self {
        let mut profile = Self::openai_compatible("deepseek", DEEPSEEK_BASE_URL);
        profile.api_key_env = Some("DEEPSEEK_API_KEY".into());
        profile.include_usage = true;
        profile.debug = DebugPredicate::Env("DEBUG_DEEPSEEK_CHAT_COMPLETION".into());
        profile.transforms = vec![TransformStep::Strip {
            fields: vec!["frequency_penalty".into(), "presence_penalty".into()],
        }];
        profile
    }

    /// Local Ollama server speaking its native NDJSON chat API.
    pub fn ollama() -> Self {
        let mut profile = Self::openai_compatible("ollama", OLLAMA_BASE_URL);
        profile.chat_path = "/api/chat".into();
        profile.auth = AuthScheme::None;
        profile.response_shape = ResponseShape::JsonObjects;
        profile.debug = DebugPredicate::Env("DEBUG_OLLAMA_CHAT_COMPLETION".into());
        profile.transforms = vec![
            TransformStep::Rename {
                from: "temperature".into(),
                to: "options.temperature".into(),
            },
            TransformStep::Rename {
                from: "top_p".into(),
                to: "options.top_p".into(),
            },
            TransformStep::Rename {
                from: "max_tokens".into(),
                to: "options.num_predict".into(),
            },
        ];
        profile
    }

    /// Profiles shipped with the runtime.
    pub fn builtins() -> Vec<Self> {
        vec![Self::openai(), Self::deepseek(), Self::ollama()]
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let invalid = |message: String| RuntimeError::InvalidProfile {
            provider: self.id.clone(),
            message,
        };
        if self.id.as_str().trim().is_empty() {
            return Err(RuntimeError::Config("provider id must not be empty".into()));
        }
        reqwest::Url::parse(&self.base_url)
            .map_err(|e| invalid(format!("invalid base_url {}: {e}", self.base_url)))?;
        if !self.chat_path.starts_with('/') {
            return Err(invalid(format!(
                "chat_path must start with '/', got {}",
                self.chat_path
            )));
        }
        for step in &self.transforms {
            step.validate().map_err(&invalid)?;
        }
        Ok(())
    }

    /// Resolves the API key, or `None` for profiles without auth.
    pub fn resolve_api_key(&self, env: &EnvSource) -> Result<Option<String>, RuntimeError> {
        if self.auth == AuthScheme::None {
            return Ok(None);
        }
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Ok(Some(key.clone()));
        }
        let env_name = self
            .api_key_env
            .clone()
            .unwrap_or_else(|| format!("{}_API_KEY", self.id.as_str().to_ascii_uppercase()));
        env.get(&env_name)
            .map(Some)
            .ok_or(RuntimeError::MissingApiKey {
                provider: self.id.clone(),
                env: env_name,
            })
    }

    /// Shapes `payload` into the request actually sent to the provider.
    pub fn prepare(&self, payload: &ChatPayload) -> Result<OutgoingRequest, ProviderError> {
        let value = serde_json::to_value(payload).map_err(|e| {
            ProviderError::parse(self.id.clone(), format!("failed to encode payload: {e}"))
        })?;
        let Value::Object(mut body) = value else {
            return Err(ProviderError::parse(
                self.id.clone(),
                "payload did not encode to an object",
            ));
        };
        if self.include_usage && payload.stream {
            set_path(&mut body, "stream_options.include_usage", Value::Bool(true));
        }
        let mut path = self.chat_path.clone();
        for step in &self.transforms {
            step.apply(&mut body, &mut path);
        }
        Ok(OutgoingRequest {
            path,
            body: Value::Object(body),
        })
    }

    /// Full URL for a request path.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Endpoint as it may appear in error reports. User-supplied hosts are
    /// masked; the well-known default for a built-in provider is kept.
    pub fn reported_endpoint(&self) -> String {
        match builtin_base_url(&self.id) {
            Some(default) if default == self.base_url.trim_end_matches('/') => default.to_string(),
            _ => desensitize_url(&self.base_url),
        }
    }
}

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
const OLLAMA_BASE_URL: &str = "http://127.0.0.1:11434";

fn builtin_base_url(id: &ProviderId) -> Option<&'static str> {
    match id.as_str() {
        "openai" => Some(OPENAI_BASE_URL),
        "deepseek" => Some(DEEPSEEK_BASE_URL),
        "ollama" => Some(OLLAMA_BASE_URL),
        _ => None,
    }
}
