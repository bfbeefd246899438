//! One data channel multiplexed into many concurrent RPC streams.
//!
//! [`ClientChannel`] originates streams and routes responses back to them by
//! id; [`ServerChannel`] creates a stream on the first Headers frame for an
//! unseen id and runs the registered handler for it. Both sit on a shared
//! [`BaseChannel`] that owns the transport events.

mod base;
mod client;
mod server;
pub mod wire;

pub use base::BaseChannel;
pub use client::{CallOptions, ClientChannel};
pub use server::ServerChannel;
pub use wire::Metadata;

pub(crate) use client::{ClientInner, StreamEvent};

/// Streams a single channel may carry at once.
pub const MAX_CONCURRENT_STREAMS: usize = 256;
