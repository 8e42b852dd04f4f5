use std::path::Path;
use std::sync::Arc;

use gomath_contracts::clock::{Clock, SystemClock};
use gomath_contracts::history::{HistoryItem, HistoryLog};
use gomath_contracts::models::ModelsConfig;
use gomath_contracts::steps::{Explanation, StepView};
use gomath_contracts::tasks::ResultCache;

use crate::context::CallContext;
use crate::explanation::{ExplanationError, ExplanationInvoker};
use crate::illustration::{illustrate_steps, NoopIllustrator, StepIllustrator};
use crate::recognition::{RecognitionError, RecognitionInvoker};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("problem text is empty")]
    EmptyProblem,

    #[error(transparent)]
    Recognition(#[from] RecognitionError),

    #[error(transparent)]
    Explanation(#[from] ExplanationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizedUpload {
    pub history_id: String,
    pub text: String,
}

/// An explanation that has been cached and attached to its history item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolvedTask {
    pub task_id: String,
    pub history_id: String,
    pub explanation: Explanation,
    pub steps: Vec<StepView>,
}

/// Submission flow: invoke the model, cache the result, record it in history.
pub struct Pipeline {
    recognizer: RecognitionInvoker,
    explainer: ExplanationInvoker,
    illustrator: Arc<dyn StepIllustrator>,
    cache: Arc<ResultCache>,
    history: Arc<HistoryLog>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(
        recognizer: RecognitionInvoker,
        explainer: ExplanationInvoker,
        cache: Arc<ResultCache>,
        history: Arc<HistoryLog>,
    ) -> Self {
        Self {
            recognizer,
            explainer,
            illustrator: Arc::new(NoopIllustrator),
            cache,
            history,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_config(
        config: &ModelsConfig,
        cache: Arc<ResultCache>,
        history: Arc<HistoryLog>,
    ) -> Self {
        Self::new(
            RecognitionInvoker::from_config(&config.ocr),
            ExplanationInvoker::from_config(&config.llm.explanation),
            cache,
            history,
        )
    }

    pub fn with_illustrator(mut self, illustrator: Arc<dyn StepIllustrator>) -> Self {
        self.illustrator = illustrator;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    /// Reads the problem off an image and records the upload once it succeeds.
    pub fn recognize_upload(
        &self,
        ctx: &CallContext,
        image: &Path,
    ) -> Result<RecognizedUpload, PipelineError> {
        let text = self.recognizer.recognize(ctx, image)?;
        let history_id = self.history.add(HistoryItem::upload(
            image.display().to_string(),
            self.clock.now_millis(),
        ));
        log::info!("recognized {} as history item {history_id}", image.display());
        Ok(RecognizedUpload { history_id, text })
    }

    pub fn explain_text(
        &self,
        ctx: &CallContext,
        problem_text: &str,
    ) -> Result<SolvedTask, PipelineError> {
        let problem_text = problem_text.trim();
        if problem_text.is_empty() {
            return Err(PipelineError::EmptyProblem);
        }
        let history_id = self
            .history
            .add(HistoryItem::text(problem_text, self.clock.now_millis()));
        let explanation = self.explainer.explain(ctx, problem_text)?;
        Ok(self.store(ctx, history_id, explanation))
    }

    /// Explains an image, attaching the result to the latest upload of the same
    /// path or to a new upload item when there is none.
    pub fn explain_upload(
        &self,
        ctx: &CallContext,
        image: &Path,
    ) -> Result<SolvedTask, PipelineError> {
        let explanation = self.explainer.explain_from_image(ctx, image)?;
        let path = image.display().to_string();
        let history_id = match self.history.find_latest_upload_by_path(&path) {
            Some(item) => item.id,
            None => self
                .history
                .add(HistoryItem::upload(path, self.clock.now_millis())),
        };
        Ok(self.store(ctx, history_id, explanation))
    }

    /// Caches the text-only steps, attaches them to history, then swaps in the
    /// illustrated steps once every image has been requested.
    fn store(&self, ctx: &CallContext, history_id: String, explanation: Explanation) -> SolvedTask {
        let plain: Vec<StepView> = explanation
            .steps
            .iter()
            .cloned()
            .map(StepView::from)
            .collect();
        let task_id = self.cache.put(&plain);
        if !self
            .history
            .update_result(&history_id, &explanation, &task_id)
        {
            log::warn!("history item {history_id} vanished before its result was attached");
        }
        let steps = illustrate_steps(ctx, self.illustrator.as_ref(), &explanation);
        if steps != plain {
            self.cache.update(&task_id, &steps);
        }
        log::info!(
            "stored task {task_id} with {} steps for history item {history_id}",
            explanation.steps.len()
        );
        SolvedTask {
            task_id,
            history_id,
            explanation,
            steps,
        }
    }
}
