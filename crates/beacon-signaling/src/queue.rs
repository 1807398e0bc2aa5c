//! Per-session buffer for ICE candidates that arrive before the session's
//! endpoint can take them.
//!
//! Browsers start trickling candidates as soon as they send their offer, long
//! before the media server has created the endpoint. Candidates are held here
//! in arrival order and drained into the endpoint once it exists.

use beacon_common::config::CandidateConfig;
use beacon_common::{IceCandidate, SessionId};
use beacon_media::{EndpointId, MediaServer};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Bounds applied to every session's list.
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    /// Entries kept per session; the oldest is dropped beyond this.
    pub max_queued: usize,
    /// Entries older than this are never applied. `None` keeps them forever;
    /// a configured `ttl_secs` of zero maps to `None`.
    pub ttl: Option<Duration>,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_queued: 128,
            ttl: Some(Duration::from_secs(60)),
        }
    }
}

impl From<&CandidateConfig> for QueueLimits {
    fn from(cfg: &CandidateConfig) -> Self {
        Self {
            max_queued: cfg.max_queued.max(1),
            ttl: Some(cfg.ttl()).filter(|ttl| !ttl.is_zero()),
        }
    }
}

#[derive(Debug, Clone)]
struct Queued {
    candidate: IceCandidate,
    at: Instant,
}

#[derive(Clone)]
pub struct CandidateQueue {
    lists: Arc<RwLock<HashMap<SessionId, VecDeque<Queued>>>>,
    limits: QueueLimits,
}

impl CandidateQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            lists: Arc::new(RwLock::new(HashMap::new())),
            limits,
        }
    }

    fn expired(&self, entry: &Queued, now: Instant) -> bool {
        self.limits
            .ttl
            .is_some_and(|ttl| now.duration_since(entry.at) > ttl)
    }

    /// Append a candidate to the session's list.
    pub async fn enqueue(&self, session: SessionId, candidate: IceCandidate) {
        let mut lists = self.lists.write().await;
        let list = lists.entry(session).or_default();
        if list.len() >= self.limits.max_queued {
            list.pop_front();
            tracing::warn!(
                session = %session,
                max_queued = self.limits.max_queued,
                "Candidate queue full, dropped oldest candidate"
            );
        }
        list.push_back(Queued {
            candidate,
            at: Instant::now(),
        });
    }

    /// Remove and return every unexpired candidate for the session, oldest
    /// first.
    pub async fn take(&self, session: SessionId) -> Vec<IceCandidate> {
        let Some(list) = self.lists.write().await.remove(&session) else {
            return Vec::new();
        };
        let now = Instant::now();
        let total = list.len();
        let fresh: Vec<_> = list
            .into_iter()
            .filter(|entry| !self.expired(entry, now))
            .map(|entry| entry.candidate)
            .collect();
        if fresh.len() < total {
            tracing::debug!(
                session = %session,
                expired = total - fresh.len(),
                "Skipped expired candidates"
            );
        }
        fresh
    }

    /// Apply every queued candidate for the session to `endpoint` in arrival
    /// order. A candidate the media server refuses is logged and skipped.
    /// Returns how many were applied.
    pub async fn drain_into(
        &self,
        session: SessionId,
        endpoint: &EndpointId,
        media: &dyn MediaServer,
    ) -> usize {
        let mut applied = 0;
        for candidate in self.take(session).await {
            match media.add_ice_candidate(endpoint, &candidate).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(
                    session = %session,
                    endpoint = %endpoint,
                    error = %e,
                    "Failed to apply queued candidate"
                ),
            }
        }
        if applied > 0 {
            tracing::debug!(session = %session, endpoint = %endpoint, applied, "Drained candidate queue");
        }
        applied
    }

    /// Discard the session's list. Returns how many entries were dropped.
    pub async fn clear(&self, session: SessionId) -> usize {
        self.lists
            .write()
            .await
            .remove(&session)
            .map_or(0, |list| list.len())
    }

    /// Drop expired entries everywhere and forget emptied lists.
    pub async fn sweep_expired(&self) -> usize {
        if self.limits.ttl.is_none() {
            return 0;
        }
        let now = Instant::now();
        let mut lists = self.lists.write().await;
        let mut removed = 0;
        lists.retain(|_, list| {
            let before = list.len();
            list.retain(|entry| !self.expired(entry, now));
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    pub async fn len(&self, session: SessionId) -> usize {
        self.lists
            .read()
            .await
            .get(&session)
            .map_or(0, VecDeque::len)
    }

    pub async fn is_empty(&self, session: SessionId) -> bool {
        self.len(session).await == 0
    }

    /// Entries held across all sessions.
    pub async fn total(&self) -> usize {
        self.lists.read().await.values().map(VecDeque::len).sum()
    }
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::new(QueueLimits::default())
    }
}
