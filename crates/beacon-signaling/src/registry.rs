//! Session registry: who presents, who watches whom, and which media objects
//! each of them owns.
//!
//! This is the authoritative source of truth for roles:
//! - `presenters`: presenter session → its record, with the viewer set nested
//!   inside so a presenter and its viewers are removed in one step
//! - `claims`: viewer requests whose endpoint is still being created
//! - every record carries a generation; flows hold a [`Ticket`] and compare it
//!   after each suspension point to learn whether their record still exists
//!
//! All mutations happen synchronously under the write guard. The guard is
//! never held across a media server call: removals collect a [`Teardown`]
//! under the guard and run it after releasing it. Lock order is registry, then
//! candidate queue.

use crate::connection::ConnectionHandle;
use crate::error::{SignalError, SignalResult};
use crate::protocol::ServerMessage;
use crate::queue::CandidateQueue;
use beacon_common::config::PresenterPolicy;
use beacon_common::{IceCandidate, PresenterInfo, SessionId};
use beacon_media::{EndpointId, MediaServer, PipelineId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Role of one session as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    PresenterPending,
    PresenterActive,
    ViewerPending,
    ViewerActive,
}

/// Proof held by a presenter flow that the record it registered is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenterTicket {
    pub presenter: SessionId,
    generation: u64,
}

/// Proof held by a viewer flow that its record under `presenter` is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerTicket {
    pub presenter: SessionId,
    pub viewer: SessionId,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ticket {
    Presenter(PresenterTicket),
    Viewer(ViewerTicket),
}

impl Ticket {
    /// The session whose record this ticket refers to.
    pub fn session(&self) -> SessionId {
        match self {
            Self::Presenter(t) => t.presenter,
            Self::Viewer(t) => t.viewer,
        }
    }
}

/// Claim on the viewer role taken before the viewer's endpoint exists. A
/// `stop`, a presenter request or a newer viewer request voids it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerClaim {
    pub viewer: SessionId,
    generation: u64,
}

impl From<PresenterTicket> for Ticket {
    fn from(t: PresenterTicket) -> Self {
        Self::Presenter(t)
    }
}

impl From<ViewerTicket> for Ticket {
    fn from(t: ViewerTicket) -> Self {
        Self::Viewer(t)
    }
}

/// Where an incoming remote candidate went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// The session has a routable endpoint; apply the candidate to it now.
    Apply(EndpointId),
    /// No routable endpoint yet; the candidate waits in the queue.
    Queued,
}

/// Counters for `/health`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub presenters: usize,
    pub viewers: usize,
    pub queued_candidates: usize,
}

struct PresenterRecord {
    name: String,
    generation: u64,
    pipeline: Option<PipelineId>,
    endpoint: Option<EndpointId>,
    /// Set once the candidate queue was observed empty after attachment.
    routable: bool,
    /// Set once the answer was sent.
    active: bool,
    viewers: HashMap<SessionId, ViewerRecord>,
}

struct ViewerRecord {
    generation: u64,
    endpoint: EndpointId,
    connection: ConnectionHandle,
    routable: bool,
    active: bool,
}

/// Side effects of removing records, run after the guard is released.
#[derive(Default)]
struct Teardown {
    notify: Vec<ConnectionHandle>,
    pipelines: Vec<PipelineId>,
    endpoints: Vec<EndpointId>,
}

impl Teardown {
    fn absorb(&mut self, other: Teardown) {
        self.notify.extend(other.notify);
        self.pipelines.extend(other.pipelines);
        self.endpoints.extend(other.endpoints);
    }

    /// Notify viewers, then release media objects. Every failure is logged
    /// and the rest still runs.
    async fn run(self, media: &dyn MediaServer) {
        for conn in &self.notify {
            if let Err(e) = conn.send(ServerMessage::StopCommunication) {
                tracing::debug!(session = %conn.session_id(), error = %e, "Viewer gone before stopCommunication");
            }
        }
        for pipeline in &self.pipelines {
            if let Err(e) = media.release_pipeline(pipeline).await {
                tracing::warn!(pipeline = %pipeline, error = %e, "Failed to release pipeline");
            }
        }
        for endpoint in &self.endpoints {
            if let Err(e) = media.release_endpoint(endpoint).await {
                tracing::warn!(endpoint = %endpoint, error = %e, "Failed to release endpoint");
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    presenters: HashMap<SessionId, PresenterRecord>,
    /// Viewer requests still waiting for their endpoint: session → generation.
    claims: HashMap<SessionId, u64>,
    next_generation: u64,
}

impl Inner {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn presenter(&self, t: &PresenterTicket) -> Option<&PresenterRecord> {
        self.presenters
            .get(&t.presenter)
            .filter(|p| p.generation == t.generation)
    }

    fn presenter_mut(&mut self, t: &PresenterTicket) -> Option<&mut PresenterRecord> {
        self.presenters
            .get_mut(&t.presenter)
            .filter(|p| p.generation == t.generation)
    }

    fn viewer_mut(&mut self, t: &ViewerTicket) -> Option<&mut ViewerRecord> {
        self.presenters
            .get_mut(&t.presenter)?
            .viewers
            .get_mut(&t.viewer)
            .filter(|v| v.generation == t.generation)
    }

    fn is_current(&self, ticket: &Ticket) -> bool {
        match ticket {
            Ticket::Presenter(t) => self.presenter(t).is_some(),
            Ticket::Viewer(t) => self
                .presenters
                .get(&t.presenter)
                .and_then(|p| p.viewers.get(&t.viewer))
                .is_some_and(|v| v.generation == t.generation),
        }
    }

    fn take_presenter(&mut self, presenter: SessionId) -> Option<Teardown> {
        let record = self.presenters.remove(&presenter)?;
        Some(Teardown {
            notify: record.viewers.into_values().map(|v| v.connection).collect(),
            pipelines: record.pipeline.into_iter().collect(),
            endpoints: Vec::new(),
        })
    }

    /// Remove the viewer record held by `viewer`, under whichever presenter.
    fn take_viewer(&mut self, viewer: SessionId) -> Option<Teardown> {
        let record = self
            .presenters
            .values_mut()
            .find_map(|p| p.viewers.remove(&viewer))?;
        Some(Teardown {
            endpoints: vec![record.endpoint],
            ..Teardown::default()
        })
    }

    fn find_viewer(&self, viewer: SessionId) -> Option<&ViewerRecord> {
        self.presenters.values().find_map(|p| p.viewers.get(&viewer))
    }
}

/// Shared registry of presenter and viewer records.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
    queue: CandidateQueue,
    media: Arc<dyn MediaServer>,
    policy: PresenterPolicy,
}

impl SessionRegistry {
    pub fn new(media: Arc<dyn MediaServer>, queue: CandidateQueue, policy: PresenterPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            queue,
            media,
            policy,
        }
    }

    pub fn queue(&self) -> &CandidateQueue {
        &self.queue
    }

    pub fn media(&self) -> &dyn MediaServer {
        self.media.as_ref()
    }

    pub fn policy(&self) -> PresenterPolicy {
        self.policy
    }

    /// Install a fresh presenter record for `session` with no media objects
    /// yet.
    ///
    /// Clears the session's queued candidates. Under [`PresenterPolicy::Replace`]
    /// a previous record of the same session is torn down; under
    /// [`PresenterPolicy::Reject`] it makes this call fail. A viewer role held
    /// by the session is torn down either way.
    pub async fn register_presenter(
        &self,
        session: SessionId,
        name: String,
    ) -> SignalResult<PresenterTicket> {
        let (ticket, teardown) = {
            let mut inner = self.inner.write().await;
            if self.policy == PresenterPolicy::Reject && inner.presenters.contains_key(&session) {
                return Err(SignalError::AlreadyPresenting);
            }
            self.queue.clear(session).await;
            inner.claims.remove(&session);

            let mut teardown = Teardown::default();
            if let Some(old) = inner.take_presenter(session) {
                tracing::info!(presenter = %session, "Replacing previous presenter registration");
                teardown.absorb(old);
            }
            if let Some(old) = inner.take_viewer(session) {
                tracing::info!(session = %session, "Viewer becoming presenter, leaving viewer role");
                teardown.absorb(old);
            }

            let generation = inner.generation();
            inner.presenters.insert(
                session,
                PresenterRecord {
                    name,
                    generation,
                    pipeline: None,
                    endpoint: None,
                    routable: false,
                    active: false,
                    viewers: HashMap::new(),
                },
            );
            (
                PresenterTicket {
                    presenter: session,
                    generation,
                },
                teardown,
            )
        };
        teardown.run(self.media()).await;
        Ok(ticket)
    }

    /// Record the pipeline created for a presenter. Fails with
    /// [`SignalError::UnknownPresenter`] when the record was removed or
    /// replaced meanwhile; the caller still owns the pipeline then.
    pub async fn attach_pipeline(
        &self,
        ticket: &PresenterTicket,
        pipeline: PipelineId,
    ) -> SignalResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .presenter_mut(ticket)
            .ok_or(SignalError::UnknownPresenter)?;
        record.pipeline = Some(pipeline);
        Ok(())
    }

    /// Record the presenter's endpoint. It stays non-routable until
    /// [`flush_candidates`](Self::flush_candidates) has run.
    pub async fn attach_endpoint(
        &self,
        ticket: &PresenterTicket,
        endpoint: EndpointId,
    ) -> SignalResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .presenter_mut(ticket)
            .ok_or(SignalError::UnknownPresenter)?;
        record.endpoint = Some(endpoint);
        record.routable = false;
        Ok(())
    }

    /// The pipeline a viewer of `presenter` must create its endpoint on, with
    /// a ticket to re-check the presenter later.
    pub async fn presenter_pipeline(
        &self,
        presenter: SessionId,
    ) -> SignalResult<(PresenterTicket, PipelineId)> {
        let inner = self.inner.read().await;
        let record = inner
            .presenters
            .get(&presenter)
            .ok_or(SignalError::PresenterNotFound)?;
        let pipeline = record
            .pipeline
            .clone()
            .ok_or(SignalError::PresenterNotFound)?;
        let ticket = PresenterTicket {
            presenter,
            generation: record.generation,
        };
        Ok((ticket, pipeline))
    }

    /// The presenter's endpoint, if the presenter is still the one `ticket`
    /// saw and has one.
    pub async fn presenter_endpoint(&self, ticket: &PresenterTicket) -> SignalResult<EndpointId> {
        let inner = self.inner.read().await;
        inner
            .presenter(ticket)
            .and_then(|p| p.endpoint.clone())
            .ok_or(SignalError::PresenterNotFound)
    }

    /// Claim the viewer role for `session` ahead of creating its endpoint.
    ///
    /// Clears the session's queued candidates and evicts any viewer record it
    /// already holds, so candidates sent from here on wait for the new
    /// endpoint. Fails with [`SignalError::RoleConflict`] for a presenter.
    pub async fn claim_viewer(&self, session: SessionId) -> SignalResult<ViewerClaim> {
        let (claim, teardown) = {
            let mut inner = self.inner.write().await;
            if inner.presenters.contains_key(&session) {
                return Err(SignalError::RoleConflict);
            }
            self.queue.clear(session).await;

            let teardown = inner.take_viewer(session);
            let generation = inner.generation();
            inner.claims.insert(session, generation);
            (
                ViewerClaim {
                    viewer: session,
                    generation,
                },
                teardown,
            )
        };
        if let Some(teardown) = teardown {
            tracing::info!(session = %session, "Replacing previous viewer registration");
            teardown.run(self.media()).await;
        }
        Ok(claim)
    }

    /// Drop `claim` if it is still the session's current one.
    pub async fn withdraw_claim(&self, claim: ViewerClaim) -> bool {
        let mut inner = self.inner.write().await;
        if inner.claims.get(&claim.viewer) == Some(&claim.generation) {
            inner.claims.remove(&claim.viewer);
            true
        } else {
            false
        }
    }

    /// Turn `claim` into a viewer record under the presenter `presenter`
    /// refers to, owning `endpoint`.
    ///
    /// Fails with [`SignalError::StaleSession`] when the claim was voided and
    /// with [`SignalError::PresenterNotFound`] when the presenter is gone. On
    /// error the caller still owns `endpoint`.
    pub async fn register_viewer(
        &self,
        presenter: &PresenterTicket,
        claim: ViewerClaim,
        connection: ConnectionHandle,
        endpoint: EndpointId,
    ) -> SignalResult<ViewerTicket> {
        let viewer = claim.viewer;
        let mut inner = self.inner.write().await;
        if inner.claims.get(&viewer) != Some(&claim.generation) {
            return Err(SignalError::StaleSession);
        }
        if inner.presenters.contains_key(&viewer) {
            return Err(SignalError::RoleConflict);
        }
        let Some(record) = inner.presenter_mut(presenter) else {
            return Err(SignalError::PresenterNotFound);
        };
        record.viewers.insert(
            viewer,
            ViewerRecord {
                generation: claim.generation,
                endpoint,
                connection,
                routable: false,
                active: false,
            },
        );
        inner.claims.remove(&viewer);
        Ok(ViewerTicket {
            presenter: presenter.presenter,
            viewer,
            generation: claim.generation,
        })
    }

    /// Routable endpoint for a remote candidate sent by `session`.
    ///
    /// With `presenter == session` (or no presenter given) the session's own
    /// presenter endpoint is tried first; otherwise, or failing that, the
    /// viewer endpoint `session` holds under `presenter`. Without a presenter
    /// id the viewer record is looked up under whichever presenter holds it.
    pub async fn lookup_endpoint(
        &self,
        session: SessionId,
        presenter: Option<SessionId>,
    ) -> Option<EndpointId> {
        let inner = self.inner.read().await;
        Self::resolve(&inner, session, presenter)
    }

    fn resolve(inner: &Inner, session: SessionId, presenter: Option<SessionId>) -> Option<EndpointId> {
        if presenter.is_none_or(|p| p == session) {
            if let Some(record) = inner.presenters.get(&session) {
                return record.endpoint.clone().filter(|_| record.routable);
            }
        }
        let viewer = match presenter {
            Some(p) => inner.presenters.get(&p)?.viewers.get(&session)?,
            None => inner.find_viewer(session)?,
        };
        viewer.routable.then(|| viewer.endpoint.clone())
    }

    /// Resolve a remote candidate to an endpoint or queue it under `session`,
    /// in one step so that no candidate can slip between a failed lookup and
    /// the endpoint becoming routable.
    pub async fn route_candidate(
        &self,
        session: SessionId,
        presenter: Option<SessionId>,
        candidate: IceCandidate,
    ) -> Routed {
        let inner = self.inner.write().await;
        match Self::resolve(&inner, session, presenter) {
            Some(endpoint) => Routed::Apply(endpoint),
            None => {
                self.queue.enqueue(session, candidate).await;
                Routed::Queued
            }
        }
    }

    /// Mark the ticket's endpoint routable if no candidates are queued for
    /// its session. Returns whether it did.
    pub async fn open_if_drained(&self, ticket: Ticket) -> SignalResult<bool> {
        let mut inner = self.inner.write().await;
        if !self.queue.is_empty(ticket.session()).await {
            return Ok(false);
        }
        let routable = match &ticket {
            Ticket::Presenter(t) => inner.presenter_mut(t).map(|p| &mut p.routable),
            Ticket::Viewer(t) => inner.viewer_mut(t).map(|v| &mut v.routable),
        }
        .ok_or(SignalError::StaleSession)?;
        *routable = true;
        Ok(true)
    }

    /// Apply every queued candidate to the freshly attached `endpoint`, then
    /// make it routable.
    ///
    /// Candidates keep being queued while a batch is applied; the loop ends
    /// only once the queue is seen empty under the registry guard, so queued
    /// candidates are applied in arrival order and exactly once before any
    /// later candidate goes straight to the endpoint.
    pub async fn flush_candidates(&self, ticket: Ticket, endpoint: &EndpointId) -> SignalResult<()> {
        let session = ticket.session();
        loop {
            if self.open_if_drained(ticket).await? {
                return Ok(());
            }
            self.ensure_current(ticket).await?;
            self.queue.drain_into(session, endpoint, self.media()).await;
        }
    }

    pub async fn is_current(&self, ticket: Ticket) -> bool {
        self.inner.read().await.is_current(&ticket)
    }

    /// Fail with [`SignalError::StaleSession`] if the ticket's record is gone.
    pub async fn ensure_current(&self, ticket: Ticket) -> SignalResult<()> {
        if self.is_current(ticket).await {
            Ok(())
        } else {
            Err(SignalError::StaleSession)
        }
    }

    /// Mark the record as negotiated.
    pub async fn mark_active(&self, ticket: Ticket) -> SignalResult<()> {
        let mut inner = self.inner.write().await;
        let active = match &ticket {
            Ticket::Presenter(t) => inner.presenter_mut(t).map(|p| &mut p.active),
            Ticket::Viewer(t) => inner.viewer_mut(t).map(|v| &mut v.active),
        }
        .ok_or(SignalError::StaleSession)?;
        *active = true;
        Ok(())
    }

    /// Tear down the ticket's record if it is still current. A stale ticket
    /// is a no-op: whoever removed the record already released its objects.
    pub async fn abort(&self, ticket: Ticket) -> bool {
        let teardown = {
            let mut inner = self.inner.write().await;
            if !inner.is_current(&ticket) {
                return false;
            }
            match ticket {
                Ticket::Presenter(t) => inner.take_presenter(t.presenter),
                Ticket::Viewer(t) => inner.take_viewer(t.viewer),
            }
        };
        match teardown {
            Some(teardown) => {
                teardown.run(self.media()).await;
                true
            }
            None => false,
        }
    }

    /// Remove the presenter record of `session`: every viewer receives
    /// `stopCommunication` and the pipeline is released, which takes the
    /// viewers' endpoints with it.
    pub async fn remove_presenter(&self, session: SessionId) -> bool {
        let teardown = self.inner.write().await.take_presenter(session);
        self.run_removal(teardown).await
    }

    /// Remove the viewer record `session` holds and release its endpoint.
    pub async fn remove_viewer(&self, session: SessionId) -> bool {
        let teardown = self.inner.write().await.take_viewer(session);
        self.run_removal(teardown).await
    }

    async fn run_removal(&self, teardown: Option<Teardown>) -> bool {
        match teardown {
            Some(teardown) => {
                teardown.run(self.media()).await;
                true
            }
            None => false,
        }
    }

    /// Leave whatever role `session` holds and discard its queued
    /// candidates.
    ///
    /// The id is tried as a presenter first and only then searched for as a
    /// viewer, so a viewer id that equals some presenter's id can never take
    /// that presenter down. Idempotent.
    pub async fn stop(&self, session: SessionId) -> Option<SessionState> {
        let (state, teardown, claimed) = {
            let mut inner = self.inner.write().await;
            let state = Self::state_in(&inner, session);
            let teardown = inner
                .take_presenter(session)
                .or_else(|| inner.take_viewer(session));
            let claimed = inner.claims.remove(&session).is_some();
            self.queue.clear(session).await;
            (state, teardown, claimed)
        };
        let removed = self.run_removal(teardown).await;
        (removed || claimed).then_some(state)
    }

    /// Directory of presenters, ordered by session id.
    pub async fn list_presenters(&self) -> Vec<PresenterInfo> {
        let inner = self.inner.read().await;
        let mut list: Vec<_> = inner
            .presenters
            .iter()
            .map(|(id, record)| PresenterInfo {
                session_id: *id,
                name: record.name.clone(),
            })
            .collect();
        list.sort_by_key(|p| p.session_id);
        list
    }

    pub async fn state_of(&self, session: SessionId) -> SessionState {
        Self::state_in(&*self.inner.read().await, session)
    }

    fn state_in(inner: &Inner, session: SessionId) -> SessionState {
        if let Some(p) = inner.presenters.get(&session) {
            return if p.active {
                SessionState::PresenterActive
            } else {
                SessionState::PresenterPending
            };
        }
        match inner.find_viewer(session) {
            Some(v) if v.active => SessionState::ViewerActive,
            Some(_) => SessionState::ViewerPending,
            None if inner.claims.contains_key(&session) => SessionState::ViewerPending,
            None => SessionState::Idle,
        }
    }

    /// Viewers currently registered under `presenter`, ordered by session id.
    pub async fn viewers_of(&self, presenter: SessionId) -> Vec<SessionId> {
        let inner = self.inner.read().await;
        let mut ids: Vec<_> = inner
            .presenters
            .get(&presenter)
            .map(|p| p.viewers.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> RegistryStats {
        let (presenters, viewers) = {
            let inner = self.inner.read().await;
            (
                inner.presenters.len(),
                inner.presenters.values().map(|p| p.viewers.len()).sum(),
            )
        };
        RegistryStats {
            presenters,
            viewers,
            queued_candidates: self.queue.total().await,
        }
    }
}
