//! ts-forum-sync: TeamSpeak 3 server groups mirrored from forum group membership, with Hexagonal Architecture.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod shared;
pub mod usecases;
