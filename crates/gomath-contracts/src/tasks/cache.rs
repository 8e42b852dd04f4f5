use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use uuid::Uuid;

use crate::steps::StepView;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task not found: {0}")]
pub struct TaskNotFound(pub String);

/// In-memory explanation results keyed by task id.
///
/// A result is the step list as shown to the user, illustrations included.
/// Entries live for the lifetime of the process. Values are cloned on the way
/// in and out, so a caller mutating its copy never affects the stored one.
#[derive(Debug, Default)]
pub struct ResultCache {
    by_id: RwLock<HashMap<String, Vec<StepView>>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `result` under a fresh task id and returns the id.
    pub fn put(&self, result: &[StepView]) -> String {
        let task_id = Uuid::new_v4().to_string();
        self.by_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.clone(), result.to_vec());
        task_id
    }

    pub fn get(&self, task_id: &str) -> Result<Vec<StepView>, TaskNotFound> {
        self.by_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskNotFound(task_id.to_string()))
    }

    /// Replaces the stored result, inserting it when the id is unknown.
    pub fn update(&self, task_id: &str, result: &[StepView]) {
        self.by_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_string(), result.to_vec());
    }

    pub fn len(&self) -> usize {
        self.by_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
