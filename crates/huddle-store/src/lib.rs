//! # huddle-store
//!
//! Persistence for huddle. Group and user documents live in a generic
//! [`DocumentStore`] (SQLite via [`Database`], or [`MemoryStore`] for
//! ephemeral runs); the async [`MembershipStore`] adapter owns every
//! read/modify/write cycle against them.

pub mod database;
pub mod document;
pub mod membership;
pub mod memory;
pub mod migrations;

mod error;

pub use database::Database;
pub use document::{Document, DocumentStore, Filter, Update, UpdateResult};
pub use error::{Result, StoreError};
pub use membership::{GroupField, MembershipStore, PurgeOutcome};
pub use memory::MemoryStore;
