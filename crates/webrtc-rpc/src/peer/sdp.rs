//! Session descriptions travel as base64 (standard alphabet) of their JSON.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::PeerError;

pub fn encode_sdp(description: &RTCSessionDescription) -> Result<String, PeerError> {
    let json = serde_json::to_vec(description).map_err(|err| PeerError::Sdp(err.to_string()))?;
    Ok(BASE64_STANDARD.encode(json))
}

pub fn decode_sdp(encoded: &str) -> Result<RTCSessionDescription, PeerError> {
    let json = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|err| PeerError::Sdp(format!("invalid base64: {err}")))?;
    serde_json::from_slice(&json).map_err(|err| PeerError::Sdp(format!("invalid json: {err}")))
}
