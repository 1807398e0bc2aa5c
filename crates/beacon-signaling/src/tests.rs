//! End-to-end signaling scenarios against the in-memory media server.

use crate::connection::ConnectionHandle;
use crate::handler::SignalingHandler;
use crate::protocol::{Negotiation, ServerMessage, Verdict};
use crate::queue::{CandidateQueue, QueueLimits};
use crate::registry::{SessionRegistry, SessionState};
use beacon_common::config::PresenterPolicy;
use beacon_common::{IceCandidate, SessionId};
use beacon_media::mock::{Call, MockMediaServer, Op};
use beacon_media::{EndpointId, PipelineId};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const NO_PRESENTER: &str = "No active presenter. Try again later...";

struct Peer {
    conn: ConnectionHandle,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Peer {
    fn new(id: u64) -> Self {
        let (conn, rx) = ConnectionHandle::channel(SessionId::new(id));
        Self { conn, rx }
    }

    fn id(&self) -> SessionId {
        self.conn.session_id()
    }

    async fn send(&self, handler: &SignalingHandler, frame: serde_json::Value) {
        handler.handle_text(&self.conn, &frame.to_string()).await;
    }

    async fn recv(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection channel closed")
    }

    fn assert_silent(&mut self) {
        assert!(self.rx.try_recv().is_err(), "unexpected frame");
    }

    /// Present and wait for the whole flow, gathering included.
    async fn present(&mut self, handler: &SignalingHandler, offer: &str) -> ServerMessage {
        handler
            .on_presenter(&self.conn, format!("presenter {}", self.id()), offer.into())
            .await;
        self.recv().await
    }

    async fn view(&mut self, handler: &SignalingHandler, presenter: &Peer, offer: &str) -> ServerMessage {
        handler
            .on_viewer(&self.conn, presenter.id(), offer.into())
            .await;
        self.recv().await
    }
}

fn setup(policy: PresenterPolicy, limits: QueueLimits) -> (SignalingHandler, Arc<MockMediaServer>) {
    let media = Arc::new(MockMediaServer::new());
    let registry = SessionRegistry::new(media.clone(), CandidateQueue::new(limits), policy);
    (SignalingHandler::new(registry), media)
}

fn default_setup() -> (SignalingHandler, Arc<MockMediaServer>) {
    setup(PresenterPolicy::Replace, QueueLimits::default())
}

fn accepted(answer: &str) -> Negotiation {
    Negotiation::accepted(answer.into())
}

fn cand(n: u32) -> IceCandidate {
    IceCandidate::new(format!("candidate:{n}"))
}

fn ice(n: u32) -> serde_json::Value {
    json!({"id": "onIceCandidate", "candidate": {"candidate": format!("candidate:{n}")}})
}

/// Endpoints in creation order.
fn created_endpoints(media: &MockMediaServer) -> Vec<EndpointId> {
    media
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::CreateEndpoint { endpoint, .. } => Some(endpoint),
            _ => None,
        })
        .collect()
}

fn rejected_with(message: &ServerMessage) -> Option<&str> {
    match message {
        ServerMessage::PresenterResponse(n) | ServerMessage::ViewerResponse(n)
            if n.response == Verdict::Rejected =>
        {
            n.message.as_deref()
        }
        _ => None,
    }
}

#[tokio::test]
async fn presenter_viewer_stop_scenario() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    let mut v = Peer::new(2);

    assert_eq!(
        p.present(&handler, "O1").await,
        ServerMessage::PresenterResponse(accepted("answer-for:O1"))
    );
    assert_eq!(
        v.view(&handler, &p, "O2").await,
        ServerMessage::ViewerResponse(accepted("answer-for:O2"))
    );

    let eps = created_endpoints(&media);
    assert_eq!(eps.len(), 2);
    assert_eq!(
        media.count(|c| *c == Call::Connect { source: eps[0].clone(), sink: eps[1].clone() }),
        1
    );
    assert_eq!(handler.registry().state_of(p.id()).await, SessionState::PresenterActive);
    assert_eq!(handler.registry().state_of(v.id()).await, SessionState::ViewerActive);

    p.send(&handler, json!({"id": "stop"})).await;
    assert_eq!(v.recv().await, ServerMessage::StopCommunication);
    assert_eq!(media.pipeline_release_count(&PipelineId::new("pipeline-1")), 1);
    assert!(media.is_released(&eps[1]));

    let mut late = Peer::new(3);
    let reply = late.view(&handler, &p, "O3").await;
    assert_eq!(rejected_with(&reply), Some(NO_PRESENTER));
}

#[tokio::test]
async fn dispatched_requests_reply_on_the_connection() {
    let (handler, _media) = default_setup();
    let mut p = Peer::new(1);
    let mut v = Peer::new(2);

    p.send(&handler, json!({"id": "presenter", "sdpOffer": "O1", "presenterName": "ann"}))
        .await;
    assert_eq!(p.recv().await, ServerMessage::PresenterResponse(accepted("answer-for:O1")));

    v.send(&handler, json!({"id": "getPresenters"})).await;
    match v.recv().await {
        ServerMessage::GetPresentersResponse { presenters } => {
            assert_eq!(presenters.len(), 1);
            assert_eq!(presenters[0].name, "ann");
            assert_eq!(presenters[0].session_id, p.id());
        }
        other => panic!("unexpected {other:?}"),
    }

    v.send(&handler, json!({"id": "viewer", "sdpOffer": "O2", "presenterID": "1"}))
        .await;
    assert_eq!(v.recv().await, ServerMessage::ViewerResponse(accepted("answer-for:O2")));
}

#[tokio::test]
async fn early_candidates_reach_the_endpoint_in_order() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);

    let endpoint_gate = media.pause(Op::CreateEndpoint);
    p.send(&handler, json!({"id": "presenter", "sdpOffer": "O1"})).await;
    endpoint_gate.reached().await;

    for n in 0..3 {
        p.send(&handler, ice(n)).await;
    }
    assert_eq!(handler.registry().queue().len(p.id()).await, 3);

    endpoint_gate.release();
    assert_eq!(p.recv().await, ServerMessage::PresenterResponse(accepted("answer-for:O1")));

    // Routable now: applied straight away.
    p.send(&handler, ice(3)).await;

    let endpoint = &created_endpoints(&media)[0];
    assert_eq!(
        media.applied_candidates(endpoint),
        vec![cand(0), cand(1), cand(2), cand(3)]
    );
    assert_eq!(handler.registry().queue().total().await, 0);
}

#[tokio::test]
async fn candidate_arriving_during_the_drain_is_not_overtaken() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);

    let endpoint_gate = media.pause(Op::CreateEndpoint);
    p.send(&handler, json!({"id": "presenter", "sdpOffer": "O1"})).await;
    endpoint_gate.reached().await;
    p.send(&handler, ice(0)).await;

    let apply_gate = media.pause(Op::AddIceCandidate);
    endpoint_gate.release();
    apply_gate.reached().await;

    // First queued candidate is mid-application; this one must wait its turn.
    p.send(&handler, ice(1)).await;
    assert_eq!(handler.registry().queue().len(p.id()).await, 1);

    apply_gate.release();
    assert_eq!(p.recv().await, ServerMessage::PresenterResponse(accepted("answer-for:O1")));
    let endpoint = &created_endpoints(&media)[0];
    assert_eq!(media.applied_candidates(endpoint), vec![cand(0), cand(1)]);
}

#[tokio::test]
async fn candidate_right_after_the_offer_is_applied() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);

    p.send(&handler, json!({"id": "presenter", "sdpOffer": "O1"})).await;
    p.send(&handler, ice(0)).await;
    assert_eq!(p.recv().await, ServerMessage::PresenterResponse(accepted("answer-for:O1")));

    let endpoint = &created_endpoints(&media)[0];
    assert_eq!(media.applied_candidates(endpoint), vec![cand(0)]);
}

#[tokio::test]
async fn viewer_candidate_right_after_the_offer_is_applied() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    let mut v = Peer::new(2);
    p.present(&handler, "O1").await;

    v.send(&handler, json!({"id": "viewer", "sdpOffer": "O2", "presenterID": 1}))
        .await;
    v.send(
        &handler,
        json!({"id": "onIceCandidate", "candidate": {"candidate": "candidate:0"}, "presenterID": 1}),
    )
    .await;
    assert_eq!(v.recv().await, ServerMessage::ViewerResponse(accepted("answer-for:O2")));

    let eps = created_endpoints(&media);
    assert!(media.applied_candidates(&eps[0]).is_empty());
    assert_eq!(media.applied_candidates(&eps[1]), vec![cand(0)]);
}

#[tokio::test]
async fn stop_right_after_presenter_request_wins() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);

    p.send(&handler, json!({"id": "presenter", "sdpOffer": "O1"})).await;
    p.send(&handler, json!({"id": "stop"})).await;

    let reply = p.recv().await;
    assert_eq!(rejected_with(&reply), Some(NO_PRESENTER));
    assert_eq!(handler.registry().state_of(p.id()).await, SessionState::Idle);
    assert!(handler.list_presenters().await.is_empty());
    assert_eq!(media.pipeline_release_count(&PipelineId::new("pipeline-1")), 1);
}

#[tokio::test]
async fn stop_right_after_viewer_request_wins() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    let mut v = Peer::new(2);
    p.present(&handler, "O1").await;

    v.send(&handler, json!({"id": "viewer", "sdpOffer": "O2", "presenterID": 1}))
        .await;
    v.send(&handler, json!({"id": "stop"})).await;

    let reply = v.recv().await;
    assert_eq!(rejected_with(&reply), Some(NO_PRESENTER));
    assert_eq!(handler.registry().state_of(v.id()).await, SessionState::Idle);
    assert!(handler.registry().viewers_of(p.id()).await.is_empty());
    let eps = created_endpoints(&media);
    assert_eq!(media.endpoint_release_count(&eps[1]), 1);
    assert_eq!(media.count(|c| matches!(c, Call::ProcessOffer { .. })), 1);
}

#[tokio::test]
async fn stop_during_pipeline_creation_releases_the_pipeline() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);

    let gate = media.pause(Op::CreatePipeline);
    p.send(&handler, json!({"id": "presenter", "sdpOffer": "O1"})).await;
    gate.reached().await;
    p.send(&handler, json!({"id": "stop"})).await;
    gate.release();

    let reply = p.recv().await;
    assert_eq!(rejected_with(&reply), Some(NO_PRESENTER));
    assert_eq!(media.pipeline_release_count(&PipelineId::new("pipeline-1")), 1);
    assert_eq!(media.count(|c| matches!(c, Call::CreateEndpoint { .. })), 0);
    assert_eq!(handler.registry().stats().await.presenters, 0);
}

#[tokio::test]
async fn stop_during_offer_processing_tears_down_once() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);

    let gate = media.pause(Op::ProcessOffer);
    p.send(&handler, json!({"id": "presenter", "sdpOffer": "O1"})).await;
    gate.reached().await;
    p.send(&handler, json!({"id": "stop"})).await;
    gate.release();

    let reply = p.recv().await;
    assert_eq!(rejected_with(&reply), Some(NO_PRESENTER));
    assert_eq!(media.pipeline_release_count(&PipelineId::new("pipeline-1")), 1);
    assert_eq!(media.count(|c| matches!(c, Call::GatherCandidates(_))), 0);
}

#[tokio::test]
async fn queued_candidate_is_discarded_on_stop() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    let mut v = Peer::new(2);

    v.send(
        &handler,
        json!({"id": "onIceCandidate", "candidate": {"candidate": "candidate:0"}, "presenterID": 1}),
    )
    .await;
    assert_eq!(handler.registry().queue().len(v.id()).await, 1);
    v.send(&handler, json!({"id": "stop"})).await;
    assert_eq!(handler.registry().queue().len(v.id()).await, 0);

    p.present(&handler, "O1").await;
    v.view(&handler, &p, "O2").await;
    let viewer_endpoint = &created_endpoints(&media)[1];
    assert!(media.applied_candidates(viewer_endpoint).is_empty());
}

#[tokio::test]
async fn viewer_candidates_route_to_the_viewer_endpoint() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    let mut v = Peer::new(2);
    p.present(&handler, "O1").await;
    v.view(&handler, &p, "O2").await;

    v.send(
        &handler,
        json!({"id": "onIceCandidate", "candidate": {"candidate": "candidate:0"}, "presenterID": "1"}),
    )
    .await;
    v.send(&handler, ice(1)).await;

    let eps = created_endpoints(&media);
    assert!(media.applied_candidates(&eps[0]).is_empty());
    assert_eq!(media.applied_candidates(&eps[1]), vec![cand(0), cand(1)]);
}

#[tokio::test]
async fn local_candidates_are_forwarded_to_the_browser() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    let mut v = Peer::new(2);
    p.present(&handler, "O1").await;
    v.view(&handler, &p, "O2").await;

    let eps = created_endpoints(&media);
    assert!(media.emit_candidate(&eps[1], cand(9)));
    assert_eq!(v.recv().await, ServerMessage::IceCandidate { candidate: cand(9) });
    p.assert_silent();
}

#[tokio::test]
async fn presenter_id_collision_leaves_other_presenters_alone() {
    let (handler, media) = default_setup();
    let mut p1 = Peer::new(1);
    let mut p2 = Peer::new(2);
    p1.present(&handler, "O1").await;
    p2.present(&handler, "O2").await;

    // A presenting session asking to view is refused and keeps presenting.
    let reply = p2.view(&handler, &p1, "O3").await;
    assert_eq!(
        rejected_with(&reply),
        Some("A presenting session cannot join as a viewer")
    );
    assert!(handler.registry().viewers_of(p1.id()).await.is_empty());

    // Stopping session 2 only ends its own presentation.
    p2.send(&handler, json!({"id": "stop"})).await;
    let listed = handler.list_presenters().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_id, p1.id());
    assert_eq!(media.pipeline_release_count(&PipelineId::new("pipeline-1")), 0);
}

#[tokio::test]
async fn reject_policy_refuses_a_second_presentation() {
    let (handler, media) = setup(PresenterPolicy::Reject, QueueLimits::default());
    let mut p = Peer::new(1);
    p.present(&handler, "O1").await;

    let reply = p.present(&handler, "O2").await;
    assert_eq!(rejected_with(&reply), Some("This session is already presenting"));
    assert_eq!(handler.registry().state_of(p.id()).await, SessionState::PresenterActive);
    assert_eq!(media.count(|c| matches!(c, Call::CreatePipeline(_))), 1);
}

#[tokio::test]
async fn replace_policy_stops_previous_viewers() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    let mut v = Peer::new(2);
    p.present(&handler, "O1").await;
    v.view(&handler, &p, "O2").await;

    assert_eq!(
        p.present(&handler, "O3").await,
        ServerMessage::PresenterResponse(accepted("answer-for:O3"))
    );
    assert_eq!(v.recv().await, ServerMessage::StopCommunication);
    assert_eq!(media.pipeline_release_count(&PipelineId::new("pipeline-1")), 1);
    assert_eq!(handler.registry().stats().await.presenters, 1);
}

#[tokio::test]
async fn bounded_queue_keeps_the_newest_candidates() {
    let limits = QueueLimits {
        max_queued: 2,
        ttl: None,
    };
    let (handler, media) = setup(PresenterPolicy::Replace, limits);
    let mut p = Peer::new(1);

    let gate = media.pause(Op::CreateEndpoint);
    p.send(&handler, json!({"id": "presenter", "sdpOffer": "O1"})).await;
    gate.reached().await;
    for n in 0..3 {
        p.send(&handler, ice(n)).await;
    }
    gate.release();
    p.recv().await;

    let endpoint = &created_endpoints(&media)[0];
    assert_eq!(media.applied_candidates(endpoint), vec![cand(1), cand(2)]);
}

#[tokio::test]
async fn expired_candidates_are_not_applied() {
    let limits = QueueLimits {
        max_queued: 16,
        ttl: Some(Duration::from_millis(20)),
    };
    let (handler, media) = setup(PresenterPolicy::Replace, limits);
    let mut p = Peer::new(1);

    let gate = media.pause(Op::CreateEndpoint);
    p.send(&handler, json!({"id": "presenter", "sdpOffer": "O1"})).await;
    gate.reached().await;
    p.send(&handler, ice(0)).await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    p.send(&handler, ice(1)).await;
    gate.release();
    p.recv().await;

    let endpoint = &created_endpoints(&media)[0];
    assert_eq!(media.applied_candidates(endpoint), vec![cand(1)]);
}

#[tokio::test]
async fn directory_lists_only_live_presenters() {
    let (handler, _media) = default_setup();
    let mut p1 = Peer::new(1);
    let mut p2 = Peer::new(2);
    let mut v = Peer::new(3);
    p1.present(&handler, "O1").await;
    p2.present(&handler, "O2").await;
    handler.stop(p1.id()).await;

    v.send(&handler, json!({"id": "getPresenters"})).await;
    match v.recv().await {
        ServerMessage::GetPresentersResponse { presenters } => {
            let ids: Vec<_> = presenters.iter().map(|p| p.session_id).collect();
            assert_eq!(ids, vec![p2.id()]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn presenter_disconnect_stops_every_viewer_once() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    p.present(&handler, "O1").await;

    let mut viewers = Vec::new();
    for id in 2..5 {
        let mut v = Peer::new(id);
        v.view(&handler, &p, "offer").await;
        viewers.push(v);
    }

    handler.disconnect(p.id()).await;
    handler.disconnect(p.id()).await;

    let eps = created_endpoints(&media);
    for (v, endpoint) in viewers.iter_mut().zip(&eps[1..]) {
        assert_eq!(v.recv().await, ServerMessage::StopCommunication);
        v.assert_silent();
        assert!(media.is_released(endpoint));
    }
    assert_eq!(media.pipeline_release_count(&PipelineId::new("pipeline-1")), 1);
    assert_eq!(handler.registry().stats().await.viewers, 0);
}

#[tokio::test]
async fn viewer_disconnect_releases_only_its_endpoint() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    let mut v = Peer::new(2);
    p.present(&handler, "O1").await;
    v.view(&handler, &p, "O2").await;

    handler.disconnect(v.id()).await;
    let eps = created_endpoints(&media);
    assert_eq!(media.endpoint_release_count(&eps[1]), 1);
    assert_eq!(media.pipeline_release_count(&PipelineId::new("pipeline-1")), 0);
    assert_eq!(handler.registry().state_of(p.id()).await, SessionState::PresenterActive);
    p.assert_silent();
}

#[tokio::test]
async fn unreachable_media_server_rejects_with_its_address() {
    let (handler, media) = default_setup();
    media.set_unavailable(true);
    let mut p = Peer::new(1);

    let reply = p.present(&handler, "O1").await;
    let message = rejected_with(&reply).unwrap_or_default();
    assert!(
        message.starts_with("Could not find media server at address mock://media"),
        "{message}"
    );
    assert_eq!(handler.registry().state_of(p.id()).await, SessionState::Idle);
}

#[tokio::test]
async fn failed_gathering_after_accept_rejects_and_tears_down() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    media.fail_next(Op::GatherCandidates);

    assert_eq!(
        p.present(&handler, "O1").await,
        ServerMessage::PresenterResponse(accepted("answer-for:O1"))
    );
    let reply = p.recv().await;
    assert!(rejected_with(&reply).is_some());
    assert_eq!(media.pipeline_release_count(&PipelineId::new("pipeline-1")), 1);
    assert_eq!(handler.registry().state_of(p.id()).await, SessionState::Idle);
}

#[tokio::test]
async fn failed_connect_releases_the_viewer_endpoint() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    let mut v = Peer::new(2);
    p.present(&handler, "O1").await;
    media.fail_next(Op::Connect);

    let reply = v.view(&handler, &p, "O2").await;
    assert!(rejected_with(&reply).is_some());
    let eps = created_endpoints(&media);
    assert_eq!(media.endpoint_release_count(&eps[1]), 1);
    assert!(handler.registry().viewers_of(p.id()).await.is_empty());
}

#[tokio::test]
async fn presenter_leaving_mid_viewer_flow_rejects_the_viewer() {
    let (handler, media) = default_setup();
    let mut p = Peer::new(1);
    let mut v = Peer::new(2);
    p.present(&handler, "O1").await;

    let gate = media.pause(Op::ProcessOffer);
    v.send(&handler, json!({"id": "viewer", "sdpOffer": "O2", "presenterID": 1}))
        .await;
    gate.reached().await;
    handler.stop(p.id()).await;
    gate.release();

    assert_eq!(v.recv().await, ServerMessage::StopCommunication);
    let reply = v.recv().await;
    assert_eq!(rejected_with(&reply), Some(NO_PRESENTER));
    assert_eq!(media.count(|c| matches!(c, Call::Connect { .. })), 0);
    assert_eq!(handler.registry().state_of(v.id()).await, SessionState::Idle);
}

#[tokio::test]
async fn unknown_message_gets_an_error_frame() {
    let (handler, _media) = default_setup();
    let mut p = Peer::new(1);

    p.send(&handler, json!({"id": "dance"})).await;
    match p.recv().await {
        ServerMessage::Error { message } => assert!(message.contains("dance"), "{message}"),
        other => panic!("unexpected {other:?}"),
    }

    // The connection is still usable.
    p.send(&handler, json!({"id": "getPresenters"})).await;
    assert!(matches!(p.recv().await, ServerMessage::GetPresentersResponse { .. }));
}
