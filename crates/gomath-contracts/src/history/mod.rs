mod store;

pub use store::{HistoryError, HistoryItem, HistoryKind, HistoryLog, MAX_ITEMS};
