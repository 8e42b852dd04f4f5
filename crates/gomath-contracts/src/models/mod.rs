mod config;

pub use config::{
    ConfigError, ExplanationConfig, LlmConfig, ModelsConfig, OcrConfig, VideoConfig,
    DEFAULT_CONFIG_PATH,
};
