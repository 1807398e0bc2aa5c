//! # beacon-media
//!
//! The media collaborator contract. Beacon never touches RTP, DTLS or ICE
//! itself; it drives an external media server that does:
//!
//! ```text
//!   Presenter ──WebRTC──▶ [endpoint]─┐
//!                                    ├─ pipeline (owned by the presenter)
//!   Viewer 1  ◀──WebRTC── [endpoint]◀┤
//!   Viewer N  ◀──WebRTC── [endpoint]◀┘
//! ```
//!
//! Each presenter owns one pipeline. Its own endpoint and every viewer's
//! endpoint are created on that pipeline, and the presenter endpoint is
//! connected to each viewer endpoint (fan-out). Releasing the pipeline releases
//! everything derived from it.
//!
//! [`KurentoClient`] speaks the Kurento JSON-RPC protocol. The `mock` feature
//! adds an in-memory [`mock::MockMediaServer`] for tests.

pub mod kurento;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use kurento::KurentoClient;

use async_trait::async_trait;
use beacon_common::IceCandidate;
use std::fmt;
use tokio::sync::mpsc;

/// Handle to a media pipeline on the media server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineId(String);

/// Handle to a WebRTC endpoint on the media server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId(String);

macro_rules! media_handle {
    ($ty:ident) => {
        impl $ty {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

media_handle!(PipelineId);
media_handle!(EndpointId);

/// Stream of candidates the media server discovers locally for one endpoint.
///
/// Ends when the endpoint is released or the media server connection drops.
pub type CandidateStream = mpsc::UnboundedReceiver<IceCandidate>;

/// Operations Beacon needs from a media server. All calls are asynchronous
/// and fallible.
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Control URI, used in diagnostics sent to clients.
    fn uri(&self) -> &str;

    async fn create_pipeline(&self) -> MediaResult<PipelineId>;

    async fn create_endpoint(&self, pipeline: &PipelineId) -> MediaResult<EndpointId>;

    /// Process a remote SDP offer and return the SDP answer.
    async fn process_offer(&self, endpoint: &EndpointId, offer: &str) -> MediaResult<String>;

    async fn add_ice_candidate(
        &self,
        endpoint: &EndpointId,
        candidate: &IceCandidate,
    ) -> MediaResult<()>;

    /// Route media from `source` into `sink`.
    async fn connect(&self, source: &EndpointId, sink: &EndpointId) -> MediaResult<()>;

    /// Start ICE gathering; discovered candidates arrive on the endpoint's
    /// [`CandidateStream`].
    async fn gather_candidates(&self, endpoint: &EndpointId) -> MediaResult<()>;

    async fn subscribe_candidates(&self, endpoint: &EndpointId) -> MediaResult<CandidateStream>;

    /// Release a pipeline and every endpoint created on it.
    async fn release_pipeline(&self, pipeline: &PipelineId) -> MediaResult<()>;

    async fn release_endpoint(&self, endpoint: &EndpointId) -> MediaResult<()>;
}

/// Media collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Could not find media server at address {uri}: {reason}")]
    Unavailable { uri: String, reason: String },

    #[error("Media server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Unexpected media server reply: {0}")]
    Protocol(String),

    #[error("Media server connection closed")]
    Closed,

    #[error("Media server did not answer {method} in time")]
    Timeout { method: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MediaError {
    /// Whether the media server itself is unreachable (as opposed to it
    /// refusing one request).
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Closed | Self::WebSocket(_)
        )
    }
}

pub type MediaResult<T> = Result<T, MediaError>;
