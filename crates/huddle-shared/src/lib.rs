//! # huddle-shared
//!
//! Types shared by the store and the server: the persisted document model,
//! the role/permission predicates, and the relay's event protocol.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod roles;
pub mod types;
