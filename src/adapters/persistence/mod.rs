//! File-backed adapters: group map JSON and audit logs.

pub mod audit_log;
pub mod group_map_json;

pub use audit_log::FileAuditLog;
pub use group_map_json::GroupMapJson;
