//! # parley-client
//!
//! Gateways to a Parley communication store and the client-side views
//! built on top of them.
//!
//! - [`RestClient`] talks to `parley-server` over HTTP and receives
//!   broadcasts as server-sent events.
//! - [`LocalClient`] runs the store in-process for offline use.
//! - [`LiveQuery`] keeps a find result current from broadcasts.
//! - [`Window`] pages through notification contexts.

pub mod api;
pub mod blob_http;
pub mod error;
pub mod live_query;
pub mod local;
pub mod rest;
pub mod window;

pub use api::{Broadcasts, CommunicationApi, Subscription};
pub use blob_http::HttpBlobStorage;
pub use error::{ClientError, Result};
pub use live_query::{
    CollaboratorsQuery, Delta, LiveQuery, LiveQueryHandle, MessagesQuery,
    NotificationContextsQuery, NotificationsQuery, QueryDef, QueryResult,
};
pub use local::{LocalClient, LocalClientConfig};
pub use rest::{RestClient, RestClientConfig};
pub use window::{ContextPages, Direction, PageSource, Window};
