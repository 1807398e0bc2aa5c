//! Kurento Media Server client.
//!
//! One WebSocket carries every request. The connection is opened lazily on
//! the first call and reopened on the next call after it drops, so a media
//! server that is down at startup only fails the requests made while it is
//! down.

pub mod rpc;

use crate::{CandidateStream, EndpointId, MediaError, MediaResult, MediaServer, PipelineId};
use async_trait::async_trait;
use beacon_common::IceCandidate;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = oneshot::Sender<Result<Value, MediaError>>;

/// [`MediaServer`] backed by a Kurento Media Server.
pub struct KurentoClient {
    uri: String,
    request_timeout: Option<Duration>,
    conn: Mutex<Option<Arc<Connection>>>,
}

impl KurentoClient {
    pub fn new(uri: impl Into<String>, request_timeout: Option<Duration>) -> Self {
        Self {
            uri: uri.into(),
            request_timeout,
            conn: Mutex::new(None),
        }
    }

    /// Current connection, dialing the media server if there is none.
    async fn connection(&self) -> MediaResult<Arc<Connection>> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            tracing::warn!(uri = %self.uri, "Media server connection lost, reconnecting");
        }

        let dial = connect_async(self.uri.as_str());
        let dialed = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .map_err(|_| self.unavailable("connect timed out"))?,
            None => dial.await,
        };
        let (ws, _) = dialed.map_err(|e| self.unavailable(e))?;

        tracing::info!(uri = %self.uri, "Connected to media server");

        let conn = Connection::spawn(ws);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    fn unavailable(&self, reason: impl ToString) -> MediaError {
        MediaError::Unavailable {
            uri: self.uri.clone(),
            reason: reason.to_string(),
        }
    }

    async fn call(&self, method: &str, params: Value) -> MediaResult<Value> {
        let conn = self.connection().await?;
        conn.request(method, params, self.request_timeout).await
    }

    async fn invoke(&self, object: &str, operation: &str, params: Value) -> MediaResult<Value> {
        self.call("invoke", rpc::invoke(object, operation, params))
            .await
    }
}

#[async_trait]
impl MediaServer for KurentoClient {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn create_pipeline(&self) -> MediaResult<PipelineId> {
        let result = self
            .call("create", rpc::create(rpc::MEDIA_PIPELINE, json!({})))
            .await?;
        rpc::result_value(&result).map(PipelineId::new)
    }

    async fn create_endpoint(&self, pipeline: &PipelineId) -> MediaResult<EndpointId> {
        let params = rpc::create(
            rpc::WEBRTC_ENDPOINT,
            json!({ "mediaPipeline": pipeline.as_str() }),
        );
        let result = self.call("create", params).await?;
        rpc::result_value(&result).map(EndpointId::new)
    }

    async fn process_offer(&self, endpoint: &EndpointId, offer: &str) -> MediaResult<String> {
        let result = self
            .invoke(endpoint.as_str(), "processOffer", json!({ "offer": offer }))
            .await?;
        rpc::result_value(&result)
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &EndpointId,
        candidate: &IceCandidate,
    ) -> MediaResult<()> {
        let params = json!({ "candidate": rpc::complex_candidate(candidate) });
        self.invoke(endpoint.as_str(), "addIceCandidate", params)
            .await?;
        Ok(())
    }

    async fn connect(&self, source: &EndpointId, sink: &EndpointId) -> MediaResult<()> {
        self.invoke(source.as_str(), "connect", json!({ "sink": sink.as_str() }))
            .await?;
        Ok(())
    }

    async fn gather_candidates(&self, endpoint: &EndpointId) -> MediaResult<()> {
        self.invoke(endpoint.as_str(), "gatherCandidates", json!({}))
            .await?;
        Ok(())
    }

    async fn subscribe_candidates(&self, endpoint: &EndpointId) -> MediaResult<CandidateStream> {
        let conn = self.connection().await?;

        // Register before subscribing so no event can slip past.
        let (tx, rx) = mpsc::unbounded_channel();
        conn.listeners
            .lock()
            .await
            .insert(endpoint.as_str().to_owned(), tx);

        let params = rpc::subscribe(endpoint.as_str(), rpc::ICE_CANDIDATE_FOUND);
        if let Err(e) = conn.request("subscribe", params, self.request_timeout).await {
            conn.listeners.lock().await.remove(endpoint.as_str());
            return Err(e);
        }
        Ok(rx)
    }

    async fn release_pipeline(&self, pipeline: &PipelineId) -> MediaResult<()> {
        let conn = self.connection().await?;
        // Endpoint ids are scoped under their pipeline: "<pipeline>/<endpoint>".
        let prefix = format!("{pipeline}/");
        conn.listeners
            .lock()
            .await
            .retain(|object, _| !object.starts_with(&prefix));
        conn.request("release", rpc::release(pipeline.as_str()), self.request_timeout)
            .await?;
        Ok(())
    }

    async fn release_endpoint(&self, endpoint: &EndpointId) -> MediaResult<()> {
        let conn = self.connection().await?;
        conn.listeners.lock().await.remove(endpoint.as_str());
        conn.request("release", rpc::release(endpoint.as_str()), self.request_timeout)
            .await?;
        Ok(())
    }
}

/// One live WebSocket to the media server with its pending requests and
/// event listeners.
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, Reply>>,
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<IceCandidate>>>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    fn spawn(ws: WsStream) -> Arc<Self> {
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let conn = Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        // ── Writer task ─────────────────────────────────────────────────────
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(error = %e, "Media server send failed");
                    break;
                }
            }
        });

        // ── Reader task ─────────────────────────────────────────────────────
        let reader = conn.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader.dispatch(text.as_str()).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Media server connection error");
                        break;
                    }
                }
            }
            reader.shutdown().await;
        });

        conn
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> MediaResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = rpc::with_session(params, self.session_id.lock().await.as_deref());
        let (tx, rx) = oneshot::channel();
        {
            // `closed` only flips under this lock, so a registered reply is
            // always either answered or failed by `shutdown`.
            let mut pending = self.pending.lock().await;
            if self.is_closed() {
                return Err(MediaError::Closed);
            }
            pending.insert(id, tx);
        }

        tracing::trace!(id, method, "Media server request");
        let frame = rpc::request(id, method, params);
        if self.outbound.send(Message::Text(frame.into())).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(MediaError::Closed);
        }

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    return Err(MediaError::Timeout {
                        method: method.to_owned(),
                    });
                }
            },
            None => rx.await,
        };
        let result = reply.map_err(|_| MediaError::Closed)??;

        if let Some(sid) = result.get("sessionId").and_then(Value::as_str) {
            let mut session = self.session_id.lock().await;
            if session.as_deref() != Some(sid) {
                *session = Some(sid.to_owned());
            }
        }
        Ok(result)
    }

    async fn dispatch(&self, text: &str) {
        match rpc::parse(text) {
            Ok(rpc::Incoming::Response { id, outcome }) => {
                match self.pending.lock().await.remove(&id) {
                    Some(reply) => {
                        let _ = reply.send(outcome);
                    }
                    None => tracing::debug!(id, "Reply for unknown or expired request"),
                }
            }
            Ok(rpc::Incoming::Candidate { object, candidate }) => {
                let mut listeners = self.listeners.lock().await;
                if let Some(tx) = listeners.get(&object) {
                    if tx.send(candidate).is_err() {
                        listeners.remove(&object);
                    }
                }
            }
            Ok(rpc::Incoming::Ignored) => {}
            Err(e) => tracing::warn!(error = %e, "Unparseable media server frame"),
        }
    }

    /// Fail everything still waiting and end every candidate stream.
    async fn shutdown(&self) {
        {
            let mut pending = self.pending.lock().await;
            self.closed.store(true, Ordering::Release);
            for (_, reply) in pending.drain() {
                let _ = reply.send(Err(MediaError::Closed));
            }
        }
        self.listeners.lock().await.clear();
        tracing::info!("Media server connection closed");
    }
}
