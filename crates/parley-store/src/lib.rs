//! # parley-store
//!
//! Event-sourced message storage for Parley, backed by SQLite.
//!
//! Messages are stored once and changed only through append-only patches.
//! Recent ("hot") messages live in relational tables; once a card holds
//! more than the archival threshold, its oldest range is folded into an
//! immutable YAML blob and recorded as a messages group. The [`Finder`]
//! reads across both, and the [`Router`] turns inbound events into store
//! mutations and session broadcasts.

pub mod adapter;
pub mod archival;
pub mod blobs;
pub mod database;
pub mod finder;
pub mod migrations;
pub mod router;
pub mod sessions;

mod attachments;
mod collaborators;
mod error;
mod groups;
mod messages;
mod notifications;
mod patches;
mod reactions;
mod sql;
mod threads;

pub use adapter::{shared, DbAdapter, NewMessage, SharedStore, StoreGuard};
pub use archival::{ArchivalPolicy, Archiver};
pub use blobs::{BlobStorage, FsBlobStorage, MemoryBlobStorage};
pub use database::Database;
pub use error::{Result, StoreError};
pub use finder::Finder;
pub use router::Router;
pub use sessions::{Session, SessionRegistry};
