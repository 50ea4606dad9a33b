//! Types shared by the Parley store, server and client.
//!
//! Holds the domain model with its patch folding, inbound events and
//! broadcasts, query parameters, the archive blob codec, the common error
//! taxonomy and the retry helper.

pub mod archive;
pub mod constants;
pub mod error;
pub mod event;
pub mod model;
pub mod query;
pub mod retry;
pub mod types;

pub use error::{CommunicationError, Result};
