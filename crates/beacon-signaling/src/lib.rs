//! # beacon-signaling
//!
//! Session/role state machine for one-to-many broadcasting.
//!
//! A connection becomes either a presenter (owns a media pipeline and one
//! endpoint on it) or a viewer of a presenter (owns one endpoint on that
//! presenter's pipeline, fed from the presenter's endpoint). ICE candidates
//! that arrive before their endpoint exists wait in the [`CandidateQueue`].
//!
//! Every negotiation suspends on the media server several times, and a
//! `stop` or disconnect may run to completion in between. Flows therefore
//! hold a [`Ticket`] and re-validate it after each suspension point.

pub mod connection;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod queue;
pub mod registry;

#[cfg(test)]
mod tests;

pub use connection::ConnectionHandle;
pub use error::{SignalError, SignalResult};
pub use handler::SignalingHandler;
pub use queue::{CandidateQueue, QueueLimits};
pub use registry::{
    PresenterTicket, RegistryStats, Routed, SessionRegistry, SessionState, Ticket, ViewerClaim,
    ViewerTicket,
};
