use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gomath_contracts::models::OcrConfig;

use crate::context::{CallContext, CallInterrupt};
use crate::gateway::{ChatMessage, GatewayRequest, MessagePart, ModelGateway};
use crate::image::{BlobReader, EncodedImage, FsBlobReader};
use crate::strategy::ProviderStrategy;

const VISION_PROMPT: &str = "Transcribe the math problem shown in the image completely and accurately.\n\
Requirements: write every formula in LaTeX, inline as $...$ and display as $$...$$.\n\
Output only the problem statement itself; do not add a solution or an answer.";

/// Returned when no OCR provider is configured so the rest of the flow stays usable.
pub const PLACEHOLDER_PROBLEM: &str =
    "Sample problem: solve the quadratic equation $x^2 - 5x + 6 = 0$.";

const VISION_MAX_TOKENS: u32 = 2048;
const DEFAULT_BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Substrings marking a provider failure as worth another attempt.
const TRANSIENT_MARKERS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "Gateway",
    "unavailable",
    "internal error",
];

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("image file {path}: {source}")]
    ImageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("vision api: {0}")]
    RecognitionFailed(String),

    #[error("recognition cancelled")]
    Cancelled,

    #[error("recognition deadline exceeded")]
    DeadlineExceeded,
}

impl From<CallInterrupt> for RecognitionError {
    fn from(interrupt: CallInterrupt) -> Self {
        match interrupt {
            CallInterrupt::Cancelled => Self::Cancelled,
            CallInterrupt::DeadlineExceeded => Self::DeadlineExceeded,
            CallInterrupt::WorkerPanicked => Self::RecognitionFailed(interrupt.to_string()),
        }
    }
}

/// Attempt budget and linear backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_step: DEFAULT_BACKOFF_STEP,
        }
    }

    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    /// Wait before the zero-based `attempt`; the first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}

pub fn is_transient_failure(message: &str) -> bool {
    TRANSIENT_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Image → problem text through a vision model.
pub struct RecognitionInvoker {
    strategy: ProviderStrategy,
    blobs: Arc<dyn BlobReader>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl RecognitionInvoker {
    /// Any configured provider is assumed to speak the OpenAI-compatible protocol.
    pub fn from_config(config: &OcrConfig) -> Self {
        let strategy = ProviderStrategy::select(
            &config.provider,
            &config.model,
            &config.api_base,
            &config.api_key,
            |_| true,
        );
        Self {
            strategy,
            blobs: Arc::new(FsBlobReader),
            retry: RetryPolicy::new(config.max_attempts()),
            timeout: config.timeout(),
        }
    }

    pub fn with_gateway(config: &OcrConfig, gateway: Arc<dyn ModelGateway>) -> Self {
        Self {
            strategy: ProviderStrategy::Remote(gateway),
            ..Self::from_config(config)
        }
    }

    pub fn with_blob_reader(mut self, blobs: Arc<dyn BlobReader>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn recognize(&self, ctx: &CallContext, image: &Path) -> Result<String, RecognitionError> {
        let bytes = self
            .blobs
            .read_bytes(image)
            .map_err(|source| RecognitionError::ImageUnavailable {
                path: image.to_path_buf(),
                source,
            })?;

        let gateway = match &self.strategy {
            ProviderStrategy::Unconfigured | ProviderStrategy::Stub => {
                return Ok(PLACEHOLDER_PROBLEM.to_string())
            }
            ProviderStrategy::MissingKey => {
                return Err(RecognitionError::RecognitionFailed(
                    "api_key or api_key_env not set".to_string(),
                ))
            }
            ProviderStrategy::Remote(gateway) => Arc::clone(gateway),
        };

        let encoded = EncodedImage::from_bytes(image, &bytes);
        let ctx = ctx.with_timeout(self.timeout);
        let message = ChatMessage::user(vec![
            MessagePart::Text(VISION_PROMPT.to_string()),
            MessagePart::Image {
                data_url: encoded.data_url(),
                detail: Some("low".to_string()),
            },
        ]);
        self.call_with_retry(&ctx, gateway, message)
    }

    fn call_with_retry(
        &self,
        ctx: &CallContext,
        gateway: Arc<dyn ModelGateway>,
        message: ChatMessage,
    ) -> Result<String, RecognitionError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.retry.delay_before(attempt);
                log::info!(
                    "recognition retry {}/{} in {}ms: {last_error}",
                    attempt + 1,
                    max_attempts,
                    delay.as_millis()
                );
                ctx.sleep(delay)?;
            }

            let request = GatewayRequest {
                messages: vec![message.clone()],
                temperature: None,
                max_tokens: VISION_MAX_TOKENS,
                timeout: ctx.remaining(),
            };
            let gateway = Arc::clone(&gateway);
            let outcome = ctx.run(move || gateway.generate(&request))?;

            match outcome {
                Err(err) => {
                    last_error = err.to_string();
                    if is_transient_failure(&last_error) && attempt + 1 < max_attempts {
                        continue;
                    }
                    break;
                }
                Ok(response) => {
                    let Some(first) = response.choices.first() else {
                        last_error = "no choices in response".to_string();
                        continue;
                    };
                    let text = first.trim();
                    if text.is_empty() {
                        last_error = "empty content".to_string();
                        continue;
                    }
                    return Ok(text.to_string());
                }
            }
        }

        Err(RecognitionError::RecognitionFailed(last_error))
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use gomath_contracts::models::OcrConfig;

    use super::{
        is_transient_failure, RecognitionError, RecognitionInvoker, RetryPolicy,
        PLACEHOLDER_PROBLEM,
    };
    use crate::context::{CallContext, CancelToken};
    use crate::gateway::{GatewayError, GatewayRequest, GatewayResponse, MessagePart, ModelGateway};
    use crate::image::BlobReader;

    /// Serves the same bytes for every path.
    struct MemoryBlobs(Vec<u8>);

    impl BlobReader for MemoryBlobs {
        fn read_bytes(&self, _path: &Path) -> io::Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    /// Plays back scripted outcomes, repeating the last one once exhausted.
    struct ScriptedGateway {
        script: Vec<Result<Vec<&'static str>, &'static str>>,
        calls: AtomicUsize,
        requests: Mutex<Vec<GatewayRequest>>,
    }

    impl ScriptedGateway {
        fn new(script: Vec<Result<Vec<&'static str>, &'static str>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ModelGateway for ScriptedGateway {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            let step = self
                .script
                .get(idx)
                .or_else(|| self.script.last())
                .cloned()
                .unwrap_or(Err("empty script"));
            match step {
                Ok(choices) => Ok(GatewayResponse {
                    choices: choices.into_iter().map(str::to_string).collect(),
                }),
                Err(message) => Err(GatewayError::Other(message.to_string())),
            }
        }
    }

    fn configured(max_retries: i64) -> OcrConfig {
        OcrConfig {
            provider: "openai".to_string(),
            model: "vision-test".to_string(),
            api_key: "test-key".to_string(),
            max_retries,
            ..OcrConfig::default()
        }
    }

    fn image_file(dir: &Path, name: &str) -> anyhow::Result<PathBuf> {
        let path = dir.join(name);
        std::fs::write(&path, [0x89, b'P', b'N', b'G'])?;
        Ok(path)
    }

    fn fast(invoker: RecognitionInvoker, attempts: u32) -> RecognitionInvoker {
        invoker.with_retry_policy(
            RetryPolicy::new(attempts).with_backoff_step(Duration::from_millis(1)),
        )
    }

    #[test]
    fn unconfigured_returns_placeholder() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = image_file(temp.path(), "q.png")?;
        let invoker = RecognitionInvoker::from_config(&OcrConfig::default());
        assert_eq!(
            invoker.recognize(&CallContext::new(), &image)?,
            PLACEHOLDER_PROBLEM
        );
        Ok(())
    }

    #[test]
    fn missing_image_is_unavailable_even_for_placeholder() {
        let invoker = RecognitionInvoker::from_config(&OcrConfig::default());
        let err = invoker
            .recognize(&CallContext::new(), Path::new("/nonexistent/q.png"))
            .unwrap_err();
        assert!(matches!(err, RecognitionError::ImageUnavailable { .. }));
    }

    #[test]
    fn configured_without_key_fails_before_calling() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = image_file(temp.path(), "q.png")?;
        let config = OcrConfig {
            api_key: String::new(),
            ..configured(1)
        };
        let err = RecognitionInvoker::from_config(&config)
            .recognize(&CallContext::new(), &image)
            .unwrap_err();
        assert!(err.to_string().contains("api_key"));
        Ok(())
    }

    #[test]
    fn sends_prompt_and_jpeg_data_url() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = image_file(temp.path(), "q.JPG")?;
        let gateway = ScriptedGateway::new(vec![Ok(vec!["  $x^2 = 4$  "])]);
        let invoker = RecognitionInvoker::with_gateway(&configured(1), gateway.clone());
        assert_eq!(invoker.recognize(&CallContext::new(), &image)?, "$x^2 = 4$");

        let requests = gateway.requests.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        let request = &requests[0];
        assert_eq!(request.max_tokens, 2048);
        assert!(request.timeout.is_some_and(|t| t <= Duration::from_secs(30)));
        match &request.messages[0].parts[..] {
            [MessagePart::Text(prompt), MessagePart::Image { data_url, detail }] => {
                assert!(prompt.contains("LaTeX"));
                assert!(data_url.starts_with("data:image/jpeg;base64,"));
                assert_eq!(detail.as_deref(), Some("low"));
            }
            other => panic!("unexpected parts: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn image_bytes_come_from_the_blob_reader() -> anyhow::Result<()> {
        let gateway = ScriptedGateway::new(vec![Ok(vec!["1 + 1"])]);
        let invoker = RecognitionInvoker::with_gateway(&configured(1), gateway.clone())
            .with_blob_reader(Arc::new(MemoryBlobs(b"hello".to_vec())));
        assert_eq!(
            invoker.recognize(&CallContext::new(), Path::new("uploads/a.png"))?,
            "1 + 1"
        );

        let requests = gateway.requests.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        match &requests[0].messages[0].parts[..] {
            [_, MessagePart::Image { data_url, .. }] => {
                assert_eq!(data_url, "data:image/png;base64,aGVsbG8=");
            }
            other => panic!("unexpected parts: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn transient_failures_use_exactly_max_attempts() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = image_file(temp.path(), "q.png")?;
        let gateway = ScriptedGateway::new(vec![
            Err("openai request failed (502): Bad Gateway"),
            Err("openai request failed (503): unavailable"),
            Err("openai request failed (500): internal error #3"),
        ]);
        let invoker = fast(
            RecognitionInvoker::with_gateway(&configured(3), gateway.clone()),
            3,
        );
        let err = invoker
            .recognize(&CallContext::new(), &image)
            .unwrap_err();
        assert_eq!(gateway.calls(), 3);
        match err {
            RecognitionError::RecognitionFailed(message) => {
                assert_eq!(message, "openai request failed (500): internal error #3");
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[test]
    fn permanent_failure_stops_immediately() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = image_file(temp.path(), "q.png")?;
        let gateway = ScriptedGateway::new(vec![
            Err("openai request failed (401): invalid api key"),
            Ok(vec!["never reached"]),
        ]);
        let invoker = fast(
            RecognitionInvoker::with_gateway(&configured(5), gateway.clone()),
            5,
        );
        assert!(invoker.recognize(&CallContext::new(), &image).is_err());
        assert_eq!(gateway.calls(), 1);
        Ok(())
    }

    #[test]
    fn empty_content_is_retried_then_succeeds() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = image_file(temp.path(), "q.webp")?;
        let gateway = ScriptedGateway::new(vec![
            Ok(vec![]),
            Ok(vec!["   "]),
            Ok(vec!["2x + 3 = 7"]),
        ]);
        let invoker = fast(
            RecognitionInvoker::with_gateway(&configured(3), gateway.clone()),
            3,
        );
        assert_eq!(invoker.recognize(&CallContext::new(), &image)?, "2x + 3 = 7");
        assert_eq!(gateway.calls(), 3);
        Ok(())
    }

    #[test]
    fn empty_content_on_last_attempt_reports_it() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = image_file(temp.path(), "q.png")?;
        let gateway = ScriptedGateway::new(vec![Ok(vec![])]);
        let invoker = RecognitionInvoker::with_gateway(&configured(1), gateway.clone());
        let err = invoker
            .recognize(&CallContext::new(), &image)
            .unwrap_err();
        assert_eq!(err.to_string(), "vision api: no choices in response");
        assert_eq!(gateway.calls(), 1);
        Ok(())
    }

    #[test]
    fn cancellation_aborts_backoff() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = image_file(temp.path(), "q.png")?;
        let gateway = ScriptedGateway::new(vec![Err("503 Service Unavailable")]);
        let invoker = RecognitionInvoker::with_gateway(&configured(4), gateway.clone())
            .with_retry_policy(RetryPolicy::new(4).with_backoff_step(Duration::from_secs(10)));

        let token = CancelToken::new();
        let ctx = CallContext::with_cancel(token.clone());
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        let started = Instant::now();
        let err = invoker.recognize(&ctx, &image).unwrap_err();
        let _ = canceller.join();

        assert!(matches!(err, RecognitionError::Cancelled));
        assert_eq!(gateway.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn transient_markers() {
        assert!(is_transient_failure("openai request failed (502): Bad Gateway"));
        assert!(is_transient_failure("service unavailable"));
        assert!(is_transient_failure("upstream internal error"));
        assert!(!is_transient_failure("openai request failed (400): bad request"));
        assert!(!is_transient_failure("connection refused"));
    }

    #[test]
    fn retry_policy_is_linear() {
        let policy = RetryPolicy::new(0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_before(0), Duration::ZERO);
        assert_eq!(policy.delay_before(1), Duration::from_millis(500));
        assert_eq!(policy.delay_before(3), Duration::from_millis(1500));
    }
}
