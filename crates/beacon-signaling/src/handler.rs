//! Signaling protocol handler: turns client messages into registry and
//! media server operations.
//!
//! Presenter and viewer negotiations suspend on the media server several
//! times, so they run on their own tasks once their registry step is done;
//! `stop`, `getPresenters` and ICE candidates are handled inline and stay
//! responsive meanwhile. After every suspension a flow re-validates its
//! [`Ticket`]; a flow whose record vanished releases what it created and
//! replies `rejected`.

use crate::connection::ConnectionHandle;
use crate::error::{SignalError, SignalResult};
use crate::protocol::{self, ClientMessage, Negotiation, ServerMessage};
use crate::registry::{PresenterTicket, Routed, SessionRegistry, Ticket, ViewerClaim, ViewerTicket};
use beacon_common::{IceCandidate, PresenterInfo, SessionId};
use beacon_media::EndpointId;

/// Handles the signaling protocol for every connection.
#[derive(Clone)]
pub struct SignalingHandler {
    registry: SessionRegistry,
}

impl SignalingHandler {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Handle one inbound text frame. A frame that does not parse is answered
    /// with an `error` frame; the connection stays open.
    pub async fn handle_text(&self, conn: &ConnectionHandle, text: &str) {
        match protocol::parse(text) {
            Ok(message) => self.dispatch(conn, message).await,
            Err(err) => {
                tracing::warn!(session = %conn.session_id(), error = %err, "Rejected client message");
                let _ = conn.send(ServerMessage::Error {
                    message: err.to_string(),
                });
            }
        }
    }

    /// Act on one client message.
    ///
    /// The registry step of a presenter or viewer request completes before
    /// this returns, so later frames of the same connection (candidates,
    /// `stop`) see it. Only the media negotiation runs on its own task.
    pub async fn dispatch(&self, conn: &ConnectionHandle, message: ClientMessage) {
        let session = conn.session_id();
        match message {
            ClientMessage::Presenter {
                sdp_offer,
                presenter_name,
            } => {
                let Some(ticket) = self.begin_presenter(conn, presenter_name).await else {
                    return;
                };
                let handler = self.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    handler.run_presenter(&conn, ticket, &sdp_offer).await;
                });
            }
            ClientMessage::Viewer {
                sdp_offer,
                presenter_id,
            } => {
                let Some(claim) = self.begin_viewer(conn, presenter_id).await else {
                    return;
                };
                let handler = self.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    handler
                        .run_viewer(&conn, presenter_id, claim, &sdp_offer)
                        .await;
                });
            }
            ClientMessage::GetPresenters => {
                let presenters = self.list_presenters().await;
                let _ = conn.send(ServerMessage::GetPresentersResponse { presenters });
            }
            ClientMessage::Stop => self.stop(session).await,
            ClientMessage::OnIceCandidate {
                candidate,
                presenter_id,
            } => self.on_ice_candidate(session, presenter_id, candidate).await,
        }
    }

    pub async fn list_presenters(&self) -> Vec<PresenterInfo> {
        self.registry.list_presenters().await
    }

    /// Run the whole become-presenter flow and reply `presenterResponse`.
    pub async fn on_presenter(&self, conn: &ConnectionHandle, name: String, sdp_offer: String) {
        if let Some(ticket) = self.begin_presenter(conn, name).await {
            self.run_presenter(conn, ticket, &sdp_offer).await;
        }
    }

    /// Register the presenter record. A refusal is answered right away.
    async fn begin_presenter(&self, conn: &ConnectionHandle, name: String) -> Option<PresenterTicket> {
        let session = conn.session_id();
        tracing::info!(session = %session, name = %name, "Presenter request");
        match self.registry.register_presenter(session, name).await {
            Ok(ticket) => Some(ticket),
            Err(err) => {
                Self::reject_presenter(conn, err);
                None
            }
        }
    }

    async fn run_presenter(&self, conn: &ConnectionHandle, ticket: PresenterTicket, sdp_offer: &str) {
        if let Err(err) = self.negotiate_presenter(conn, ticket, sdp_offer).await {
            self.registry.abort(ticket.into()).await;
            Self::reject_presenter(conn, err);
        }
    }

    fn reject_presenter(conn: &ConnectionHandle, err: SignalError) {
        Self::log_rejection(conn.session_id(), None, &err);
        let _ = conn.send(ServerMessage::PresenterResponse(Negotiation::rejected(
            err.to_string(),
        )));
    }

    fn log_rejection(session: SessionId, presenter: Option<SessionId>, err: &SignalError) {
        let role = if presenter.is_some() { "Viewer" } else { "Presenter" };
        if err.is_stale() {
            tracing::info!(session = %session, code = err.error_code(), "{role} flow superseded: {err}");
        } else {
            tracing::warn!(
                session = %session,
                presenter = ?presenter,
                code = err.error_code(),
                error = %err,
                "{role} rejected"
            );
        }
    }

    async fn negotiate_presenter(
        &self,
        conn: &ConnectionHandle,
        presenter: PresenterTicket,
        sdp_offer: &str,
    ) -> SignalResult<()> {
        let media = self.registry.media();
        let ticket = Ticket::from(presenter);

        let pipeline = media.create_pipeline().await?;
        if let Err(err) = self.registry.attach_pipeline(&presenter, pipeline.clone()).await {
            if let Err(e) = media.release_pipeline(&pipeline).await {
                tracing::warn!(pipeline = %pipeline, error = %e, "Failed to release orphaned pipeline");
            }
            return Err(err);
        }

        // Once the pipeline is attached, whoever removes the record releases
        // it and every endpoint on it.
        let endpoint = media.create_endpoint(&pipeline).await?;
        self.registry.attach_endpoint(&presenter, endpoint.clone()).await?;
        self.registry.flush_candidates(ticket, &endpoint).await?;
        self.forward_local_candidates(conn, &endpoint).await?;

        let sdp_answer = media.process_offer(&endpoint, sdp_offer).await?;
        self.registry.mark_active(ticket).await?;
        conn.send(ServerMessage::PresenterResponse(Negotiation::accepted(
            sdp_answer,
        )))?;
        tracing::info!(session = %presenter.presenter, pipeline = %pipeline, "Presenter accepted");

        media.gather_candidates(&endpoint).await?;
        Ok(())
    }

    /// Run the whole become-viewer flow and reply `viewerResponse`.
    pub async fn on_viewer(&self, conn: &ConnectionHandle, presenter: SessionId, sdp_offer: String) {
        if let Some(claim) = self.begin_viewer(conn, presenter).await {
            self.run_viewer(conn, presenter, claim, &sdp_offer).await;
        }
    }

    /// Claim the viewer role. A refusal is answered right away.
    async fn begin_viewer(&self, conn: &ConnectionHandle, presenter: SessionId) -> Option<ViewerClaim> {
        let session = conn.session_id();
        tracing::info!(session = %session, presenter = %presenter, "Viewer request");
        match self.registry.claim_viewer(session).await {
            Ok(claim) => Some(claim),
            Err(err) => {
                Self::reject_viewer(conn, presenter, err);
                None
            }
        }
    }

    async fn run_viewer(
        &self,
        conn: &ConnectionHandle,
        presenter_id: SessionId,
        claim: ViewerClaim,
        sdp_offer: &str,
    ) {
        let (presenter, viewer, endpoint) = match self.attach_viewer(conn, presenter_id, claim).await {
            Ok(attached) => attached,
            Err(err) => {
                self.registry.withdraw_claim(claim).await;
                Self::reject_viewer(conn, presenter_id, err);
                return;
            }
        };

        let ticket = Ticket::from(viewer);
        if let Err(err) = self
            .negotiate_viewer(conn, presenter, ticket, &endpoint, sdp_offer)
            .await
        {
            self.registry.abort(ticket).await;
            Self::reject_viewer(conn, presenter_id, err);
        }
    }

    fn reject_viewer(conn: &ConnectionHandle, presenter: SessionId, err: SignalError) {
        Self::log_rejection(conn.session_id(), Some(presenter), &err);
        let _ = conn.send(ServerMessage::ViewerResponse(Negotiation::rejected(
            err.to_string(),
        )));
    }

    /// Create the viewer's endpoint on the presenter's pipeline and turn the
    /// claim into a viewer record owning it.
    async fn attach_viewer(
        &self,
        conn: &ConnectionHandle,
        presenter_id: SessionId,
        claim: ViewerClaim,
    ) -> SignalResult<(PresenterTicket, ViewerTicket, EndpointId)> {
        let media = self.registry.media();
        let (presenter, pipeline) = self.registry.presenter_pipeline(presenter_id).await?;

        let endpoint = media.create_endpoint(&pipeline).await?;
        match self
            .registry
            .register_viewer(&presenter, claim, conn.clone(), endpoint.clone())
            .await
        {
            Ok(viewer) => Ok((presenter, viewer, endpoint)),
            Err(err) => {
                if let Err(e) = media.release_endpoint(&endpoint).await {
                    tracing::debug!(endpoint = %endpoint, error = %e, "Failed to release orphaned endpoint");
                }
                Err(err)
            }
        }
    }

    async fn negotiate_viewer(
        &self,
        conn: &ConnectionHandle,
        presenter: PresenterTicket,
        ticket: Ticket,
        endpoint: &EndpointId,
        sdp_offer: &str,
    ) -> SignalResult<()> {
        let media = self.registry.media();

        self.registry.flush_candidates(ticket, endpoint).await?;
        self.forward_local_candidates(conn, endpoint).await?;

        let sdp_answer = media.process_offer(endpoint, sdp_offer).await?;
        self.registry.ensure_current(ticket).await?;

        let source = self.registry.presenter_endpoint(&presenter).await?;
        media.connect(&source, endpoint).await?;

        self.registry.mark_active(ticket).await?;
        conn.send(ServerMessage::ViewerResponse(Negotiation::accepted(
            sdp_answer,
        )))?;
        tracing::info!(
            session = %conn.session_id(),
            presenter = %presenter.presenter,
            "Viewer accepted"
        );

        media.gather_candidates(endpoint).await?;
        Ok(())
    }

    /// Forward candidates the media server finds for `endpoint` to the
    /// browser until the endpoint is released or the connection goes away.
    async fn forward_local_candidates(
        &self,
        conn: &ConnectionHandle,
        endpoint: &EndpointId,
    ) -> SignalResult<()> {
        let mut local = self.registry.media().subscribe_candidates(endpoint).await?;
        let conn = conn.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            while let Some(candidate) = local.recv().await {
                if conn.send(ServerMessage::IceCandidate { candidate }).is_err() {
                    break;
                }
            }
            tracing::debug!(session = %conn.session_id(), endpoint = %endpoint, "Local candidate stream ended");
        });
        Ok(())
    }

    /// Leave whatever role the session holds.
    pub async fn stop(&self, session: SessionId) {
        if let Some(state) = self.registry.stop(session).await {
            tracing::info!(session = %session, from = ?state, "Session stopped");
        }
    }

    /// Connection closed or failed: same as `stop`.
    pub async fn disconnect(&self, session: SessionId) {
        tracing::debug!(session = %session, "Tearing down disconnected session");
        self.stop(session).await;
    }

    /// Apply a remote candidate to the session's endpoint, or queue it until
    /// the endpoint is ready.
    pub async fn on_ice_candidate(
        &self,
        session: SessionId,
        presenter: Option<SessionId>,
        candidate: IceCandidate,
    ) {
        match self
            .registry
            .route_candidate(session, presenter, candidate.clone())
            .await
        {
            Routed::Apply(endpoint) => {
                if let Err(e) = self
                    .registry
                    .media()
                    .add_ice_candidate(&endpoint, &candidate)
                    .await
                {
                    tracing::warn!(
                        session = %session,
                        endpoint = %endpoint,
                        error = %e,
                        "Failed to apply candidate"
                    );
                }
            }
            Routed::Queued => {
                tracing::debug!(session = %session, "Queued candidate");
            }
        }
    }
}
