mod parser;

pub use parser::{parse_steps_response, render_steps, ParseError};

use serde::{Deserialize, Deserializer, Serialize};

/// One explanation step as produced by the model.
///
/// `content` is markdown with LaTeX math (`$...$` inline, `$$...$$` display).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub image_prompt: String,
}

/// Reads a JSON `null` string field as empty.
pub(crate) fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Ordered steps for a single generation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explanation {
    pub steps: Vec<Step>,
}

impl Explanation {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A step paired with the illustration produced for it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepView {
    #[serde(flatten)]
    pub step: Step,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl StepView {
    pub fn new(step: Step, image_url: Option<String>) -> Self {
        Self { step, image_url }
    }
}

impl From<Step> for StepView {
    fn from(step: Step) -> Self {
        Self::new(step, None)
    }
}
