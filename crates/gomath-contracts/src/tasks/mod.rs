mod cache;

pub use cache::{ResultCache, TaskNotFound};
