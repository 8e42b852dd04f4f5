use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};

const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{provider} request failed ({status}): {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} request error: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned invalid JSON payload: {source}")]
    Decode {
        provider: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(String),
    Image {
        data_url: String,
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![MessagePart::Text(text.into())],
        }
    }

    pub fn user(parts: Vec<MessagePart>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn has_image(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, MessagePart::Image { .. }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: u32,
    /// Upper bound on the whole HTTP exchange.
    pub timeout: Option<Duration>,
}

/// Text of each returned choice, in provider order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayResponse {
    pub choices: Vec<String>,
}

/// A model endpoint that turns a message list into completions.
pub trait ModelGateway: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError>;
}

/// OpenAI-compatible `/chat/completions` client (OpenAI itself or a gateway
/// speaking the same protocol).
#[derive(Debug, Clone)]
pub struct OpenAiGateway {
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiGateway {
    pub fn new(api_base: &str, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let api_base = api_base.trim().trim_end_matches('/');
        Self {
            api_base: if api_base.is_empty() {
                DEFAULT_OPENAI_API_BASE.to_string()
            } else {
                api_base.to_string()
            },
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn payload(&self, request: &GatewayRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_to_json).collect();
        let mut payload = Map::new();
        payload.insert("model".to_string(), Value::String(self.model.clone()));
        payload.insert("messages".to_string(), Value::Array(messages));
        payload.insert("max_tokens".to_string(), json!(request.max_tokens));
        if let Some(temperature) = request.temperature {
            payload.insert("temperature".to_string(), json!(temperature));
        }
        Value::Object(payload)
    }
}

impl ModelGateway for OpenAiGateway {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let transport = |source| GatewayError::Transport {
            provider: self.name().to_string(),
            source,
        };
        let mut builder = HttpClient::builder();
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(transport)?;
        let response = client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&self.payload(request))
            .send()
            .map_err(transport)?;
        let parsed = response_json_or_error(self.name(), response)?;
        Ok(GatewayResponse {
            choices: extract_choice_texts(&parsed),
        })
    }
}

fn message_to_json(message: &ChatMessage) -> Value {
    // Plain text messages go out as a string; some compatible gateways reject
    // part arrays on text-only turns.
    let content = match message.parts.as_slice() {
        [MessagePart::Text(text)] => Value::String(text.clone()),
        parts => Value::Array(parts.iter().map(part_to_json).collect()),
    };
    json!({
        "role": message.role.as_str(),
        "content": content,
    })
}

fn part_to_json(part: &MessagePart) -> Value {
    match part {
        MessagePart::Text(text) => json!({"type": "text", "text": text}),
        MessagePart::Image { data_url, detail } => {
            let mut image_url = Map::new();
            image_url.insert("url".to_string(), Value::String(data_url.clone()));
            if let Some(detail) = detail {
                image_url.insert("detail".to_string(), Value::String(detail.clone()));
            }
            json!({"type": "image_url", "image_url": image_url})
        }
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value, GatewayError> {
    let status = response.status();
    let body = response.text().map_err(|source| GatewayError::Transport {
        provider: provider.to_string(),
        source,
    })?;
    if !status.is_success() {
        return Err(GatewayError::Status {
            provider: provider.to_string(),
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|source| GatewayError::Decode {
        provider: provider.to_string(),
        source,
    })
}

fn extract_choice_texts(response: &Value) -> Vec<String> {
    let Some(choices) = response.get("choices").and_then(Value::as_array) else {
        return Vec::new();
    };
    choices
        .iter()
        .map(|choice| {
            let content = choice.get("message").and_then(|message| message.get("content"));
            match content {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Array(parts)) => parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<&str>>()
                    .join("\n"),
                _ => String::new(),
            }
        })
        .collect()
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
