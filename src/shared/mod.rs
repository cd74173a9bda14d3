//! Cross-cutting configuration shared by adapters and use cases.

pub mod config;

pub use config::{AppConfig, BotSettings, SharedSettings};
