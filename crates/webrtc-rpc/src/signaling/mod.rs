//! Signaling service: callers submit offers over HTTP, hosts hold a
//! WebSocket `Answer` stream open and reply to the offers pushed to them.

mod answerer;
mod client;
mod http;
mod local;
mod server;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call_queue::{IceCandidate, QueueError};
use crate::status::Status;

pub use answerer::{AnswerConnector, OfferAcceptor, SignalingAnswerer};
pub use client::{SignalingClient, WebSocketConnector};
pub use http::router;
pub use local::LocalAnswerConnector;
pub use server::SignalingServer;

/// Metadata key (an HTTP header on the wire) naming the target host.
pub const HOST_METADATA_KEY: &str = "rpc-host";

pub const CALL_PATH: &str = "/rpc/signaling/call";
pub const ANSWER_PATH: &str = "/rpc/signaling/answer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
    pub sdp: String,
}

/// Server -> answerer messages on the `Answer` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerRequest {
    Init {
        uuid: String,
        sdp: String,
        #[serde(default)]
        disable_trickle: bool,
    },
    Update {
        uuid: String,
        candidate: IceCandidate,
    },
    Done {
        uuid: String,
    },
}

impl AnswerRequest {
    pub fn uuid(&self) -> &str {
        match self {
            AnswerRequest::Init { uuid, .. }
            | AnswerRequest::Update { uuid, .. }
            | AnswerRequest::Done { uuid } => uuid,
        }
    }
}

/// Answerer -> server messages on the `Answer` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerResponse {
    Init { uuid: String, sdp: String },
    Error { uuid: String, status: Status },
}

impl AnswerResponse {
    pub fn uuid(&self) -> &str {
        match self {
            AnswerResponse::Init { uuid, .. } | AnswerResponse::Error { uuid, .. } => uuid,
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("missing or empty rpc-host metadata")]
    MissingHost,
    #[error(transparent)]
    Status(#[from] Status),
    #[error("answer stream disconnected")]
    Disconnected,
    #[error("call queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("signaling protocol error: {0}")]
    Protocol(String),
}

impl SignalingError {
    /// Transient conditions an answerer retries without raising its voice.
    pub fn is_expected(&self) -> bool {
        matches!(self, SignalingError::Status(_) | SignalingError::Disconnected)
    }

    pub fn to_status(&self) -> Status {
        match self {
            SignalingError::MissingHost => Status::invalid_argument(self.to_string()),
            SignalingError::Status(status) => status.clone(),
            SignalingError::Disconnected | SignalingError::Transport(_) => {
                Status::unavailable(self.to_string())
            }
            SignalingError::Queue(err) => err.clone().into(),
            SignalingError::Protocol(_) => Status::internal(self.to_string()),
        }
    }
}

/// Server end of an `Answer` stream.
#[async_trait]
pub trait AnswerServerStream: Send {
    async fn send(&mut self, request: AnswerRequest) -> Result<(), SignalingError>;

    /// `Ok(None)` once the answerer closed the stream.
    async fn recv(&mut self) -> Result<Option<AnswerResponse>, SignalingError>;
}

/// Answerer end of an `Answer` stream.
#[async_trait]
pub trait AnswerClientStream: Send {
    async fn send(&mut self, response: AnswerResponse) -> Result<(), SignalingError>;

    /// `Ok(None)` once the server closed the stream.
    async fn recv(&mut self) -> Result<Option<AnswerRequest>, SignalingError>;
}

pub(crate) fn require_host(host: Option<&str>) -> Result<&str, SignalingError> {
    match host.map(str::trim) {
        Some(host) if !host.is_empty() => Ok(host),
        _ => Err(SignalingError::MissingHost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn answer_messages_are_tagged_json() {
        let request = AnswerRequest::Init {
            uuid: "u1".into(),
            sdp: "offer".into(),
            disable_trickle: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "init");
        assert_eq!(json["disable_trickle"], true);

        let response: AnswerResponse = serde_json::from_str(
            r#"{"type":"error","uuid":"u1","status":{"code":"unknown","message":"whoops"}}"#,
        )
        .unwrap();
        assert_eq!(response.uuid(), "u1");
        match response {
            AnswerResponse::Error { status, .. } => assert_eq!(status.message(), "whoops"),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn host_is_required() {
        assert!(matches!(require_host(None), Err(SignalingError::MissingHost)));
        assert!(matches!(
            require_host(Some("  ")),
            Err(SignalingError::MissingHost)
        ));
        assert_eq!(require_host(Some("yeehaw")).unwrap(), "yeehaw");
        assert!(SignalingError::Disconnected.is_expected());
        assert!(!SignalingError::Transport("refused".into()).is_expected());
    }
}
