//! Signaling errors. Every variant ends up as the `message` of a rejection or
//! `error` frame, so the display strings are written for the browser.

use beacon_common::SessionId;
use beacon_media::MediaError;

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// The media server cannot be reached; only the requester is told.
    #[error("{0}")]
    CollaboratorUnavailable(String),

    /// A viewer or candidate referenced a presenter that does not exist.
    #[error("No active presenter. Try again later...")]
    PresenterNotFound,

    /// A presenter record was removed or replaced while its pipeline or
    /// endpoint was being created.
    #[error("No active presenter. Try again later...")]
    UnknownPresenter,

    /// The record a flow was building vanished while the flow was suspended.
    #[error("No active presenter. Try again later...")]
    StaleSession,

    #[error("This session is already presenting")]
    AlreadyPresenting,

    #[error("A presenting session cannot join as a viewer")]
    RoleConflict,

    #[error("Invalid message {0}")]
    ProtocolViolation(String),

    #[error("Connection {0} is closed")]
    ConnectionClosed(SessionId),

    #[error("Media server error: {0}")]
    Media(MediaError),
}

impl SignalError {
    /// Error code string for logs and programmatic handling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CollaboratorUnavailable(_) => "COLLABORATOR_UNAVAILABLE",
            Self::PresenterNotFound => "PRESENTER_NOT_FOUND",
            Self::UnknownPresenter => "UNKNOWN_PRESENTER",
            Self::StaleSession => "STALE_SESSION",
            Self::AlreadyPresenting => "ALREADY_PRESENTING",
            Self::RoleConflict => "ROLE_CONFLICT",
            Self::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            Self::ConnectionClosed(_) => "CONNECTION_CLOSED",
            Self::Media(_) => "MEDIA_ERROR",
        }
    }

    /// Whether the record a flow depended on disappeared under it.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            Self::PresenterNotFound | Self::UnknownPresenter | Self::StaleSession
        )
    }
}

impl From<MediaError> for SignalError {
    fn from(err: MediaError) -> Self {
        if err.is_unavailable() {
            Self::CollaboratorUnavailable(err.to_string())
        } else {
            Self::Media(err)
        }
    }
}

pub type SignalResult<T> = Result<T, SignalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vanished_presenter_reads_the_same_to_clients() {
        for err in [
            SignalError::PresenterNotFound,
            SignalError::UnknownPresenter,
            SignalError::StaleSession,
        ] {
            assert!(err.is_stale());
            assert_eq!(err.to_string(), "No active presenter. Try again later...");
        }
    }

    #[test]
    fn unreachable_media_server_maps_to_unavailable() {
        let err: SignalError = MediaError::Unavailable {
            uri: "ws://localhost:8888/kurento".into(),
            reason: "refused".into(),
        }
        .into();
        assert_eq!(err.error_code(), "COLLABORATOR_UNAVAILABLE");
        assert!(err.to_string().starts_with("Could not find media server at address ws://localhost:8888/kurento"));

        let err: SignalError = MediaError::Protocol("odd".into()).into();
        assert_eq!(err.error_code(), "MEDIA_ERROR");
    }
}
