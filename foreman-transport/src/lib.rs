//! # foreman-transport
//!
//! Length-framed, bidirectional message channels between one authority and
//! one client. Every other Foreman component talks through this layer;
//! there is no shared mutable memory across the boundary.
//!
//! Guarantees: FIFO per endpoint per direction, at-most-once delivery per
//! call, no ordering across distinct endpoints.

pub mod endpoint;
pub mod error;
pub mod frame;

pub use endpoint::Endpoint;
pub use error::TransportError;
pub use frame::MAX_FRAME_BYTES;
