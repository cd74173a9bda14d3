//! Forum membership store adapters.

pub mod libsql_store;
pub mod retry;

pub use libsql_store::{ForumSchema, ForumSource, LibsqlForumStore};
pub use retry::RetryingForumStore;
