//! Signaling wire protocol.
//!
//! Every frame is a JSON object whose `id` field names the message kind:
//!
//! | client → server | server → client |
//! |---|---|
//! | `presenter {sdpOffer, presenterName}` | `presenterResponse` |
//! | `getPresenters` | `getPresentersResponse {presenters}` |
//! | `viewer {sdpOffer, presenterID}` | `viewerResponse` |
//! | `stop` | none |
//! | `onIceCandidate {candidate, presenterID}` | none |
//! | | `iceCandidate {candidate}` (push) |
//! | | `stopCommunication` (push) |
//! | anything else | `error {message}` |

use crate::error::SignalError;
use beacon_common::{IceCandidate, PresenterInfo, SessionId};
use serde::{Deserialize, Serialize};

/// Messages sent by a browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum ClientMessage {
    /// Start broadcasting.
    #[serde(rename = "presenter")]
    Presenter {
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
        #[serde(rename = "presenterName", default)]
        presenter_name: String,
    },

    /// Ask for the presenter directory.
    #[serde(rename = "getPresenters")]
    GetPresenters,

    /// Watch a presenter.
    #[serde(rename = "viewer")]
    Viewer {
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
        #[serde(rename = "presenterID")]
        presenter_id: SessionId,
    },

    /// Leave whatever role the session holds.
    #[serde(rename = "stop")]
    Stop,

    /// Remote ICE candidate for this session's endpoint. `presenterID`
    /// defaults to the sender's own session.
    #[serde(rename = "onIceCandidate")]
    OnIceCandidate {
        candidate: IceCandidate,
        #[serde(rename = "presenterID", default)]
        presenter_id: Option<SessionId>,
    },
}

/// Messages sent to a browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum ServerMessage {
    #[serde(rename = "presenterResponse")]
    PresenterResponse(Negotiation),

    #[serde(rename = "getPresentersResponse")]
    GetPresentersResponse { presenters: Vec<PresenterInfo> },

    #[serde(rename = "viewerResponse")]
    ViewerResponse(Negotiation),

    /// A candidate the media server discovered for this session's endpoint.
    #[serde(rename = "iceCandidate")]
    IceCandidate { candidate: IceCandidate },

    /// The presenter this viewer was watching went away.
    #[serde(rename = "stopCommunication")]
    StopCommunication,

    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// Outcome of a presenter or viewer request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Negotiation {
    pub response: Verdict,
    #[serde(rename = "sdpAnswer", skip_serializing_if = "Option::is_none")]
    pub sdp_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Negotiation {
    pub fn accepted(sdp_answer: String) -> Self {
        Self {
            response: Verdict::Accepted,
            sdp_answer: Some(sdp_answer),
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            response: Verdict::Rejected,
            sdp_answer: None,
            message: Some(message.into()),
        }
    }
}

/// Decode a client frame. Anything that is not a known, well-formed message
/// is a [`SignalError::ProtocolViolation`] naming what was received.
pub fn parse(text: &str) -> Result<ClientMessage, SignalError> {
    serde_json::from_str(text).map_err(|e| {
        let kind = serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|v| v.get("id").map(|id| id.to_string()));
        SignalError::ProtocolViolation(match kind {
            Some(id) => format!("{id}: {e}"),
            None => format!("{text:?}: {e}"),
        })
    })
}
