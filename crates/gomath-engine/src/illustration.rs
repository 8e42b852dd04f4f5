use gomath_contracts::steps::{Explanation, Step, StepView};

use crate::context::CallContext;

/// Turns a step's description into an image path or URL.
pub trait StepIllustrator: Send + Sync {
    fn illustrate(&self, ctx: &CallContext, prompt: &str) -> anyhow::Result<Option<String>>;
}

/// Produces no images; every step is shown as text only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIllustrator;

impl StepIllustrator for NoopIllustrator {
    fn illustrate(&self, _ctx: &CallContext, _prompt: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Attaches an illustration to each step. Failures leave that step without an image.
pub fn illustrate_steps(
    ctx: &CallContext,
    illustrator: &dyn StepIllustrator,
    explanation: &Explanation,
) -> Vec<StepView> {
    explanation
        .steps
        .iter()
        .enumerate()
        .map(|(idx, step)| {
            if ctx.check().is_err() {
                return StepView::from(step.clone());
            }
            let prompt = illustration_prompt(step);
            let image_url = match illustrator.illustrate(ctx, &prompt) {
                Ok(url) => url.filter(|url| !url.trim().is_empty()),
                Err(err) => {
                    log::warn!("illustration for step {} failed: {err:#}", idx + 1);
                    None
                }
            };
            StepView::new(step.clone(), image_url)
        })
        .collect()
}

fn illustration_prompt(step: &Step) -> String {
    let prompt = step.image_prompt.trim();
    if prompt.is_empty() {
        format!("{}: {}", step.title, step.content)
    } else {
        prompt.to_string()
    }
}
