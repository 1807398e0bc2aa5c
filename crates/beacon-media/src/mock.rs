//! In-memory media server for tests.
//!
//! Records every call, hands out deterministic ids, and lets a test inject
//! failures, pause a call until released, or emit local candidates.

use crate::{CandidateStream, EndpointId, MediaError, MediaResult, MediaServer, PipelineId};
use async_trait::async_trait;
use beacon_common::IceCandidate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};

/// Collaborator operations, used to target failures and pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CreatePipeline,
    CreateEndpoint,
    ProcessOffer,
    AddIceCandidate,
    Connect,
    GatherCandidates,
    Subscribe,
    ReleasePipeline,
    ReleaseEndpoint,
}

/// A call that completed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreatePipeline(PipelineId),
    CreateEndpoint {
        pipeline: PipelineId,
        endpoint: EndpointId,
    },
    ProcessOffer {
        endpoint: EndpointId,
        offer: String,
    },
    AddIceCandidate {
        endpoint: EndpointId,
        candidate: IceCandidate,
    },
    Connect {
        source: EndpointId,
        sink: EndpointId,
    },
    GatherCandidates(EndpointId),
    Subscribe(EndpointId),
    ReleasePipeline(PipelineId),
    ReleaseEndpoint(EndpointId),
}

/// Holds one call of an [`Op`] until the test lets it continue.
#[derive(Default)]
pub struct Gate {
    reached: Notify,
    release: Notify,
}

impl Gate {
    /// Wait until the paused call has started.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the paused call continue.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    unavailable: bool,
    calls: Vec<Call>,
    failures: HashMap<Op, usize>,
    gates: HashMap<Op, Arc<Gate>>,
    endpoints: HashMap<EndpointId, PipelineId>,
    listeners: HashMap<EndpointId, mpsc::UnboundedSender<IceCandidate>>,
}

#[derive(Default)]
pub struct MockMediaServer {
    state: Mutex<State>,
}

impl MockMediaServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent call fail as if the server were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Fail the next call of `op`.
    pub fn fail_next(&self, op: Op) {
        *self.state().failures.entry(op).or_default() += 1;
    }

    /// Pause the next call of `op` until [`Gate::release`].
    pub fn pause(&self, op: Op) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.state().gates.insert(op, gate.clone());
        gate
    }

    /// Push a locally discovered candidate to the endpoint's subscriber.
    pub fn emit_candidate(&self, endpoint: &EndpointId, candidate: IceCandidate) -> bool {
        self.state()
            .listeners
            .get(endpoint)
            .is_some_and(|tx| tx.send(candidate).is_ok())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Candidates applied to `endpoint`, in application order.
    pub fn applied_candidates(&self, endpoint: &EndpointId) -> Vec<IceCandidate> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::AddIceCandidate {
                    endpoint: ep,
                    candidate,
                } if ep == endpoint => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn endpoints_on(&self, pipeline: &PipelineId) -> Vec<EndpointId> {
        let mut eps: Vec<_> = self
            .state()
            .endpoints
            .iter()
            .filter(|(_, p)| *p == pipeline)
            .map(|(e, _)| e.clone())
            .collect();
        eps.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        eps
    }

    pub fn pipeline_release_count(&self, pipeline: &PipelineId) -> usize {
        self.count(|call| matches!(call, Call::ReleasePipeline(p) if p == pipeline))
    }

    pub fn endpoint_release_count(&self, endpoint: &EndpointId) -> usize {
        self.count(|call| matches!(call, Call::ReleaseEndpoint(e) if e == endpoint))
    }

    /// Released directly or through its pipeline.
    pub fn is_released(&self, endpoint: &EndpointId) -> bool {
        let pipeline = self.state().endpoints.get(endpoint).cloned();
        self.endpoint_release_count(endpoint) > 0
            || pipeline.is_some_and(|p| self.pipeline_release_count(&p) > 0)
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    async fn enter(&self, op: Op) -> MediaResult<()> {
        let gate = self.state().gates.remove(&op);
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }

        let mut state = self.state();
        if state.unavailable {
            return Err(MediaError::Unavailable {
                uri: "mock://media".into(),
                reason: "connection refused".into(),
            });
        }
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MediaError::Rpc {
                    code: 500,
                    message: format!("injected {op:?} failure"),
                });
            }
        }
        Ok(())
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state();
        state.next_id += 1;
        format!("{prefix}{}", state.next_id)
    }
}

#[async_trait]
impl MediaServer for MockMediaServer {
    fn uri(&self) -> &str {
        "mock://media"
    }

    async fn create_pipeline(&self) -> MediaResult<PipelineId> {
        self.enter(Op::CreatePipeline).await?;
        let pipeline = PipelineId::new(self.next_id("pipeline-"));
        self.record(Call::CreatePipeline(pipeline.clone()));
        Ok(pipeline)
    }

    async fn create_endpoint(&self, pipeline: &PipelineId) -> MediaResult<EndpointId> {
        self.enter(Op::CreateEndpoint).await?;
        let endpoint = EndpointId::new(format!("{pipeline}/{}", self.next_id("endpoint-")));
        self.state()
            .endpoints
            .insert(endpoint.clone(), pipeline.clone());
        self.record(Call::CreateEndpoint {
            pipeline: pipeline.clone(),
            endpoint: endpoint.clone(),
        });
        Ok(endpoint)
    }

    async fn process_offer(&self, endpoint: &EndpointId, offer: &str) -> MediaResult<String> {
        self.enter(Op::ProcessOffer).await?;
        self.record(Call::ProcessOffer {
            endpoint: endpoint.clone(),
            offer: offer.to_owned(),
        });
        Ok(format!("answer-for:{offer}"))
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &EndpointId,
        candidate: &IceCandidate,
    ) -> MediaResult<()> {
        self.enter(Op::AddIceCandidate).await?;
        self.record(Call::AddIceCandidate {
            endpoint: endpoint.clone(),
            candidate: candidate.clone(),
        });
        Ok(())
    }

    async fn connect(&self, source: &EndpointId, sink: &EndpointId) -> MediaResult<()> {
        self.enter(Op::Connect).await?;
        self.record(Call::Connect {
            source: source.clone(),
            sink: sink.clone(),
        });
        Ok(())
    }

    async fn gather_candidates(&self, endpoint: &EndpointId) -> MediaResult<()> {
        self.enter(Op::GatherCandidates).await?;
        self.record(Call::GatherCandidates(endpoint.clone()));
        Ok(())
    }

    async fn subscribe_candidates(&self, endpoint: &EndpointId) -> MediaResult<CandidateStream> {
        self.enter(Op::Subscribe).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().listeners.insert(endpoint.clone(), tx);
        self.record(Call::Subscribe(endpoint.clone()));
        Ok(rx)
    }

    async fn release_pipeline(&self, pipeline: &PipelineId) -> MediaResult<()> {
        self.enter(Op::ReleasePipeline).await?;
        {
            let mut state = self.state();
            let children: Vec<_> = state
                .endpoints
                .iter()
                .filter(|(_, p)| *p == pipeline)
                .map(|(e, _)| e.clone())
                .collect();
            for endpoint in children {
                state.listeners.remove(&endpoint);
            }
        }
        self.record(Call::ReleasePipeline(pipeline.clone()));
        Ok(())
    }

    async fn release_endpoint(&self, endpoint: &EndpointId) -> MediaResult<()> {
        self.enter(Op::ReleaseEndpoint).await?;
        self.state().listeners.remove(endpoint);
        self.record(Call::ReleaseEndpoint(endpoint.clone()));
        Ok(())
    }
}
