//! Infrastructure adapters. Implement outbound ports.
//!
//! ServerQuery, forum database, files. Map errors to DomainError.

pub mod forum;
pub mod persistence;
pub mod teamspeak;
