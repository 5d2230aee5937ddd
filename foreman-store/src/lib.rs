//! # foreman-store
//!
//! The shared configuration store: a single-writer actor owning the
//! canonical key/value mapping and its version counter, with snapshot and
//! subscription operations, optional file persistence, and a framed proxy
//! protocol for worker processes.
//!
//! Call [`ConfigStore::spawn`] to start the actor, then clone
//! [`StoreHandle`] freely; cross-process clients use [`remote::RemoteStore`]
//! over a transport endpoint served by [`remote::serve_connection`].

pub mod backend;
pub mod error;
pub mod remote;
pub mod store;
pub mod watch;

pub use backend::{ConfigBackend, ConfigDocument, FileBackend};
pub use error::StoreError;
pub use remote::{serve_connection, RemoteStore, RemoteSubscription, StoreReply, StoreRequest};
pub use store::{ConfigChange, ConfigStore, StoreHandle, Subscription, SubscriptionFilter};
pub use watch::{watch_config_file, DEBOUNCE_WINDOW};
