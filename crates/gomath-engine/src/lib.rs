//! Model calls and the submission pipeline built on `gomath-contracts`.

pub mod context;
pub mod explanation;
pub mod gateway;
pub mod illustration;
pub mod image;
pub mod pipeline;
pub mod recognition;
pub mod strategy;

pub use context::{CallContext, CallInterrupt, CancelToken};
pub use explanation::{ExplanationError, ExplanationInvoker};
pub use gateway::{GatewayError, ModelGateway, OpenAiGateway};
pub use illustration::{NoopIllustrator, StepIllustrator};
pub use pipeline::{Pipeline, PipelineError, RecognizedUpload, SolvedTask};
pub use recognition::{RecognitionError, RecognitionInvoker, RetryPolicy};
pub use strategy::ProviderStrategy;
