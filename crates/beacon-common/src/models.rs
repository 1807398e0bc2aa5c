//! Wire models shared between the signaling protocol and the media layer.

use crate::SessionId;
use serde::{Deserialize, Serialize};

/// An ICE candidate as exchanged with browsers (`RTCIceCandidateInit`).
///
/// Unknown fields such as `usernameFragment` are ignored on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// One entry of the presenter directory shown to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenterInfo {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    pub name: String,
}
