//! Data types and stores shared by the gomath engine and CLI.

pub mod chat;
pub mod clock;
pub mod events;
pub mod history;
pub mod models;
pub mod steps;
pub mod tasks;
