use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gomath_contracts::models::ExplanationConfig;
use gomath_contracts::steps::{parse_steps_response, Explanation, ParseError, Step};

use crate::context::{CallContext, CallInterrupt};
use crate::gateway::{ChatMessage, GatewayRequest, MessagePart, ModelGateway};
use crate::image::{BlobReader, EncodedImage, FsBlobReader};
use crate::strategy::ProviderStrategy;

const SUPPORTED_PROVIDER: &str = "openai";

const STEP_FORMAT: &str = "Answer strictly as a JSON array with no text before or after it. \
Each element has title, content and image_prompt:\n\
- title: a short title for the step\n\
- content: the detailed explanation of the step; write formulas in LaTeX, inline as $...$ and display as $$...$$\n\
- image_prompt: an English description for an illustration of the step (diagram, geometry, function plot)\n";

const STEP_EXAMPLE: &str = "Output the JSON array directly, for example:\n\
[{\"title\":\"Step 1\",\"content\":\"...\",\"image_prompt\":\"...\"},{\"title\":\"Step 2\",...}]\n";

#[derive(Debug, thiserror::Error)]
pub enum ExplanationError {
    #[error("llm explanation not configured")]
    NotConfigured,

    #[error("read image {path}: {source}")]
    ImageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("no response from llm")]
    NoResponse,

    #[error("llm explanation: {0}")]
    ExplanationFailed(String),

    #[error("explanation cancelled")]
    Cancelled,

    #[error("explanation deadline exceeded")]
    DeadlineExceeded,
}

impl From<CallInterrupt> for ExplanationError {
    fn from(interrupt: CallInterrupt) -> Self {
        match interrupt {
            CallInterrupt::Cancelled => Self::Cancelled,
            CallInterrupt::DeadlineExceeded => Self::DeadlineExceeded,
            CallInterrupt::WorkerPanicked => Self::ExplanationFailed(interrupt.to_string()),
        }
    }
}

/// Problem text or image → step-by-step explanation. One model call, no retry.
pub struct ExplanationInvoker {
    strategy: ProviderStrategy,
    blobs: Arc<dyn BlobReader>,
    system_prompt: Option<String>,
    temperature: f64,
    max_tokens: u32,
    timeout: Duration,
}

impl ExplanationInvoker {
    pub fn from_config(config: &ExplanationConfig) -> Self {
        let strategy = ProviderStrategy::select(
            &config.provider,
            &config.model,
            &config.api_base,
            &config.api_key,
            |provider| provider == SUPPORTED_PROVIDER,
        );
        Self {
            strategy,
            blobs: Arc::new(FsBlobReader),
            system_prompt: load_system_prompt(&config.system_prompt_file),
            temperature: config.effective_temperature(),
            max_tokens: config.effective_max_tokens(),
            timeout: config.timeout(),
        }
    }

    pub fn with_gateway(config: &ExplanationConfig, gateway: Arc<dyn ModelGateway>) -> Self {
        Self {
            strategy: ProviderStrategy::Remote(gateway),
            ..Self::from_config(config)
        }
    }

    pub fn with_blob_reader(mut self, blobs: Arc<dyn BlobReader>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn explain(
        &self,
        ctx: &CallContext,
        problem_text: &str,
    ) -> Result<Explanation, ExplanationError> {
        let Some(gateway) = self.gateway()? else {
            return Ok(stub_explanation());
        };
        let prompt = text_prompt(problem_text);
        self.call_once(ctx, gateway, vec![MessagePart::Text(prompt)])
    }

    pub fn explain_from_image(
        &self,
        ctx: &CallContext,
        image: &Path,
    ) -> Result<Explanation, ExplanationError> {
        let Some(gateway) = self.gateway()? else {
            return Ok(stub_explanation());
        };
        let bytes =
            self.blobs
                .read_bytes(image)
                .map_err(|source| ExplanationError::ImageUnavailable {
                    path: image.to_path_buf(),
                    source,
                })?;
        let encoded = EncodedImage::from_bytes(image, &bytes);
        let parts = vec![
            MessagePart::Text(image_prompt()),
            MessagePart::Image {
                data_url: encoded.data_url(),
                detail: Some("low".to_string()),
            },
        ];
        self.call_once(ctx, gateway, parts)
    }

    /// `None` means the stub answers instead of a model.
    fn gateway(&self) -> Result<Option<Arc<dyn ModelGateway>>, ExplanationError> {
        match &self.strategy {
            ProviderStrategy::Unconfigured => Err(ExplanationError::NotConfigured),
            ProviderStrategy::Stub => Ok(None),
            ProviderStrategy::MissingKey => Err(ExplanationError::ExplanationFailed(
                "api_key or api_key_env not set".to_string(),
            )),
            ProviderStrategy::Remote(gateway) => Ok(Some(Arc::clone(gateway))),
        }
    }

    fn call_once(
        &self,
        ctx: &CallContext,
        gateway: Arc<dyn ModelGateway>,
        parts: Vec<MessagePart>,
    ) -> Result<Explanation, ExplanationError> {
        let ctx = ctx.with_timeout(self.timeout);
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(parts));
        let request = GatewayRequest {
            messages,
            temperature: Some(self.temperature),
            max_tokens: self.max_tokens,
            timeout: ctx.remaining(),
        };

        let response = ctx
            .run(move || gateway.generate(&request))?
            .map_err(|err| ExplanationError::ExplanationFailed(err.to_string()))?;
        let first = response
            .choices
            .into_iter()
            .next()
            .ok_or(ExplanationError::NoResponse)?;
        Ok(parse_steps_response(&first)?)
    }
}

/// Fixed answer used when the configured provider has no client.
pub fn stub_explanation() -> Explanation {
    Explanation::new(vec![
        Step {
            title: "Step 1".to_string(),
            content: "Let $x^2 - 5x + 6 = (x-a)(x-b)$, then $a+b=5$, $ab=6$.".to_string(),
            image_prompt: "quadratic equation factored form".to_string(),
        },
        Step {
            title: "Step 2".to_string(),
            content: "Solving gives $a=2,b=3$ or $a=3,b=2$, so $x=2$ or $x=3$.".to_string(),
            image_prompt: "number line with roots".to_string(),
        },
    ])
}

fn text_prompt(problem_text: &str) -> String {
    format!(
        "You are a math tutoring assistant. Explain the following problem step by step.\n\
         {STEP_FORMAT}\nProblem:\n{problem_text}\n\n{STEP_EXAMPLE}"
    )
}

fn image_prompt() -> String {
    format!(
        "You are a math tutoring assistant. Explain the math problem in the image step by step.\n\
         {STEP_FORMAT}\n{STEP_EXAMPLE}"
    )
}

fn load_system_prompt(path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    match fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Ok(_) => None,
        Err(err) => {
            log::warn!("ignoring system prompt file {path}: {err}");
            None
        }
    }
}
