use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/models.toml";

const DEFAULT_OCR_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EXPLANATION_TIMEOUT: Duration = Duration::from_secs(180);
const DEFAULT_TEMPERATURE: f64 = 0.3;
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read models config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse models config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Model settings for every stage of the pipeline, loaded from one TOML file.
///
/// ```toml
/// [ocr]
/// provider = "openai"
/// model = "gpt-4o-mini"
/// api_key_env = "OPENAI_API_KEY"
/// timeout_sec = 30
/// max_retries = 3
///
/// [llm.explanation]
/// provider = "openai"
/// model = "gpt-4o"
/// api_key_env = "OPENAI_API_KEY"
/// temperature = 0.3
/// max_tokens = 4096
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub ocr: OcrConfig,
    pub llm: LlmConfig,
    pub video: VideoConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub explanation: ExplanationConfig,
}

/// Image → problem text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub provider: String,
    pub model: String,
    pub api_base: String,
    pub api_key: String,
    pub api_key_env: String,
    pub timeout_sec: i64,
    pub max_retries: i64,
}

/// Problem text (or image) → explanation steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplanationConfig {
    pub provider: String,
    pub model: String,
    pub api_base: String,
    pub api_key: String,
    pub api_key_env: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub timeout_sec: i64,
    pub system_prompt_file: String,
}

/// Narration/rendering settings; only reported, nothing consumes them yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub tts_provider: String,
    pub tts_model: String,
    pub ffmpeg_bin: String,
    pub default_step_duration_sec: i64,
}

impl ModelsConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Fills empty `api_key` fields from the variables named by `api_key_env`.
    ///
    /// Runs once at startup; invokers only ever see the resolved value.
    pub fn resolve_api_keys(&mut self) {
        self.resolve_api_keys_with(|name| env::var(name).ok());
    }

    pub fn resolve_api_keys_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.ocr.api_key = resolve_api_key(&self.ocr.api_key, &self.ocr.api_key_env, &lookup);
        let explanation = &mut self.llm.explanation;
        explanation.api_key =
            resolve_api_key(&explanation.api_key, &explanation.api_key_env, &lookup);
    }

    /// One-line summary without secrets, printed at startup.
    pub fn status(&self) -> String {
        let ocr = if self.ocr.is_configured() {
            format!("ocr={}/{}", self.ocr.provider, self.ocr.model)
        } else {
            "ocr=stub(unconfigured)".to_string()
        };
        let explanation = &self.llm.explanation;
        let llm = if explanation.is_configured() {
            format!("llm={}/{}", explanation.provider, explanation.model)
        } else {
            "llm=stub(unconfigured)".to_string()
        };
        let video = if self.video.ffmpeg_bin.is_empty() {
            "video=unconfigured".to_string()
        } else {
            format!("video=ffmpeg({})", self.video.ffmpeg_bin)
        };
        format!("config loaded: {ocr}; {llm}; {video}")
    }
}

impl OcrConfig {
    pub fn is_configured(&self) -> bool {
        !self.provider.is_empty() && !self.model.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        positive_secs(self.timeout_sec).unwrap_or(DEFAULT_OCR_TIMEOUT)
    }

    /// Attempt budget; anything below one means a single attempt.
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.max_retries).unwrap_or(0).max(1)
    }
}

impl ExplanationConfig {
    pub fn is_configured(&self) -> bool {
        !self.provider.is_empty() && !self.model.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        positive_secs(self.timeout_sec).unwrap_or(DEFAULT_EXPLANATION_TIMEOUT)
    }

    pub fn effective_temperature(&self) -> f64 {
        if self.temperature > 0.0 {
            self.temperature
        } else {
            DEFAULT_TEMPERATURE
        }
    }

    pub fn effective_max_tokens(&self) -> u32 {
        u32::try_from(self.max_tokens)
            .ok()
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_TOKENS)
    }
}

fn resolve_api_key(
    value: &str,
    env_name: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> String {
    if !value.trim().is_empty() {
        return value.trim().to_string();
    }
    if env_name.trim().is_empty() {
        return String::new();
    }
    lookup(env_name.trim())
        .map(|found| found.trim().to_string())
        .unwrap_or_default()
}

fn positive_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs)
        .ok()
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
}
