//! Outbound side of one signaling connection.

use crate::error::SignalError;
use crate::protocol::ServerMessage;
use beacon_common::SessionId;
use tokio::sync::mpsc;

/// Cloneable sender for frames to one connection.
///
/// The gateway owns the receiving end and writes frames to the socket; viewer
/// records keep a clone so a presenter's teardown can reach its viewers.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { session_id, tx }
    }

    /// A handle plus the receiver its frames arrive on.
    pub fn channel(session_id: SessionId) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(session_id, tx), rx)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn send(&self, message: ServerMessage) -> Result<(), SignalError> {
        self.tx
            .send(message)
            .map_err(|_| SignalError::ConnectionClosed(self.session_id))
    }
}
