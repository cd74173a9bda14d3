//! Application use cases. Orchestrate domain logic via ports.

pub mod command_parser;
pub mod commands;
pub mod credential_linker;
pub mod dispatcher;
pub mod group_map;
pub mod rate_limiter;
pub mod reconciler;
pub mod scheduler;

#[cfg(test)]
pub mod fakes;

pub use commands::CommandRegistry;
pub use credential_linker::CredentialLinker;
pub use dispatcher::{CommandDispatcher, DispatcherDeps, IncomingMessage, RuntimeStatus};
pub use group_map::GroupMapStore;
pub use rate_limiter::LoginRateLimiter;
pub use reconciler::{Reconciler, SyncMode, SyncReport};
pub use scheduler::SyncScheduler;
