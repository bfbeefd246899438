//! RPC calls carried over a WebRTC data channel.
//!
//! Responsibilities:
//! - a call queue matching callers with the host they want to reach
//! - a signaling service (HTTP `Call`, WebSocket `Answer`) and the answerer
//!   loop that keeps a host reachable
//! - peer negotiation of one pre-agreed, ordered data channel
//! - a multiplexed channel carrying many concurrent streams over that pipe

pub mod call_queue;
pub mod channel;
pub mod client;
pub mod config;
pub mod peer;
pub mod server;
pub mod service;
pub mod signaling;
pub mod status;
pub mod stream;

pub use channel::{CallOptions, ClientChannel, Metadata, ServerChannel};
pub use client::{dial, dial_with, DialError, DialOptions};
pub use config::{PeerOptions, QueueConfig, SignalingEndpoint};
pub use server::RpcServer;
pub use service::{MethodHandler, ServiceRegistry};
pub use status::{Code, Status};
pub use stream::{ClientStream, RequestContext, RequestStream, ResponseSink, ServerStream};
