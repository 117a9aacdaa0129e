//! In-memory connector
//!
//! Pairs sessions created from the same `MemoryRtc` through their session
//! descriptions, so two clients in one process can negotiate a working
//! data channel. Also records applied remote candidates and can inject
//! failures.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use super::NegotiationState;
use super::connector::{Role, RtcConnector, RtcEvent, RtcSession};
use crate::error::{Result, TetherError};
use crate::id::generate_id;
use crate::transport::DataChannel;

const OFFER_PREFIX: &str = "memory-offer";
const ANSWER_PREFIX: &str = "memory-answer";

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RtcInner {
    sessions: DashMap<String, Arc<MemorySession>>,
    candidates_per_session: AtomicUsize,
    failing: AtomicBool,
    stall_gathering: AtomicBool,
    applied: Mutex<Vec<String>>,
}

/// In-process peer connection stack
#[derive(Clone)]
pub struct MemoryRtc {
    inner: Arc<RtcInner>,
}

impl Default for MemoryRtc {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRtc {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RtcInner {
                sessions: DashMap::new(),
                candidates_per_session: AtomicUsize::new(2),
                failing: AtomicBool::new(false),
                stall_gathering: AtomicBool::new(false),
                applied: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Number of local candidates each session gathers
    pub fn with_candidates(self, count: usize) -> Self {
        self.inner.candidates_per_session.store(count, Ordering::SeqCst);
        self
    }

    /// Makes offers and answers fail
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Gathering never completes
    pub fn set_stall_gathering(&self, stall: bool) {
        self.inner.stall_gathering.store(stall, Ordering::SeqCst);
    }

    /// Every remote candidate applied so far, in application order
    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.inner.applied).clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Drops every connection as if the network went away
    pub fn sever_all(&self) {
        for entry in self.inner.sessions.iter() {
            let session = entry.value();
            if let Some(channel) = lock(&session.channel).as_ref() {
                channel.open.store(false, Ordering::SeqCst);
            }
            session.emit(RtcEvent::StateChange(NegotiationState::Disconnected));
        }
    }

    fn check_failing(&self) -> Result<()> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(TetherError::Negotiation("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RtcConnector for MemoryRtc {
    async fn create_session(
        &self,
        role: Role,
    ) -> Result<(Arc<dyn RtcSession>, mpsc::UnboundedReceiver<RtcEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(MemorySession {
            id: generate_id(),
            role,
            rtc: Arc::downgrade(&self.inner),
            events: Mutex::new(Some(tx)),
            remote_set: AtomicBool::new(false),
            local: Mutex::new(None),
            channel: Mutex::new(None),
        });
        self.inner.sessions.insert(session.id.clone(), session.clone());
        Ok((session, rx))
    }
}

struct MemorySession {
    id: String,
    role: Role,
    rtc: Weak<RtcInner>,
    events: Mutex<Option<mpsc::UnboundedSender<RtcEvent>>>,
    remote_set: AtomicBool,
    local: Mutex<Option<String>>,
    channel: Mutex<Option<Arc<MemoryChannel>>>,
}

impl MemorySession {
    fn emit(&self, event: RtcEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn rtc(&self) -> Result<MemoryRtc> {
        self.rtc
            .upgrade()
            .map(|inner| MemoryRtc { inner })
            .ok_or_else(|| TetherError::Negotiation("connector dropped".into()))
    }

    fn gather(&self, rtc: &MemoryRtc) {
        let count = rtc.inner.candidates_per_session.load(Ordering::SeqCst);
        for i in 0..count {
            self.emit(RtcEvent::LocalCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    i,
                    50_000 + i
                ),
                mid: Some("0".to_string()),
            });
        }
        if !rtc.inner.stall_gathering.load(Ordering::SeqCst) {
            self.emit(RtcEvent::GatheringComplete);
        }
    }

    fn peer_id(sdp: &str, prefix: &str) -> Result<String> {
        let mut parts = sdp.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(p), Some(id)) if p == prefix => Ok(id.to_string()),
            _ => Err(TetherError::Negotiation(format!("malformed sdp: {}", sdp))),
        }
    }
}

#[async_trait]
impl RtcSession for MemorySession {
    async fn create_offer(&self) -> Result<String> {
        let rtc = self.rtc()?;
        rtc.check_failing()?;
        if self.role != Role::Offerer {
            return Err(TetherError::Negotiation("answerer cannot offer".into()));
        }
        let sdp = format!("{} {}", OFFER_PREFIX, self.id);
        *lock(&self.local) = Some(sdp.clone());
        self.gather(&rtc);
        Ok(sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let rtc = self.rtc()?;
        rtc.check_failing()?;
        let offerer = Self::peer_id(sdp, OFFER_PREFIX)?;
        if !rtc.inner.sessions.contains_key(&offerer) {
            return Err(TetherError::Negotiation(format!("unknown offer {}", offerer)));
        }
        self.remote_set.store(true, Ordering::SeqCst);

        let answer = format!("{} {}", ANSWER_PREFIX, self.id);
        *lock(&self.local) = Some(answer.clone());
        self.gather(&rtc);
        Ok(answer)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let rtc = self.rtc()?;
        let answerer_id = Self::peer_id(sdp, ANSWER_PREFIX)?;
        let answerer = rtc
            .inner
            .sessions
            .get(&answerer_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TetherError::Negotiation(format!("unknown answer {}", answerer_id)))?;
        self.remote_set.store(true, Ordering::SeqCst);

        let open = Arc::new(AtomicBool::new(true));
        let mine = Arc::new(MemoryChannel {
            local: self.id.clone(),
            remote: answerer.id.clone(),
            rtc: self.rtc.clone(),
            open: open.clone(),
        });
        let theirs = Arc::new(MemoryChannel {
            local: answerer.id.clone(),
            remote: self.id.clone(),
            rtc: self.rtc.clone(),
            open,
        });
        *lock(&self.channel) = Some(mine.clone());
        *lock(&answerer.channel) = Some(theirs.clone());

        debug!("Memory sessions {} and {} paired", self.id, answerer.id);
        answerer.emit(RtcEvent::StateChange(NegotiationState::Connected));
        answerer.emit(RtcEvent::ChannelOpen(theirs));
        self.emit(RtcEvent::StateChange(NegotiationState::Connected));
        self.emit(RtcEvent::ChannelOpen(mine));
        Ok(())
    }

    async fn add_candidate(&self, candidate: &str, _mid: Option<&str>) -> Result<()> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(TetherError::Negotiation(
                "candidate applied before remote description".into(),
            ));
        }
        let rtc = self.rtc()?;
        lock(&rtc.inner.applied).push(candidate.to_string());
        Ok(())
    }

    async fn local_description(&self) -> Option<String> {
        lock(&self.local).clone()
    }

    async fn close(&self) {
        let channel = lock(&self.channel).take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        if let Ok(rtc) = self.rtc() {
            rtc.inner.sessions.remove(&self.id);
        }
        lock(&self.events).take();
    }
}

/// One end of an in-memory channel pair
struct MemoryChannel {
    local: String,
    remote: String,
    rtc: Weak<RtcInner>,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn session(&self, id: &str) -> Option<Arc<MemorySession>> {
        let rtc = self.rtc.upgrade()?;
        rtc.sessions.get(id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(TetherError::DataChannel("channel closed".into()));
        }
        let remote = self
            .session(&self.remote)
            .ok_or_else(|| TetherError::DataChannel("remote session gone".into()))?;
        remote.emit(RtcEvent::Message(data));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            for id in [&self.local, &self.remote] {
                if let Some(session) = self.session(id) {
                    session.emit(RtcEvent::ChannelClosed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sessions_pair_through_descriptions() {
        let rtc = MemoryRtc::new().with_candidates(1);
        let (offerer, mut offer_events) = rtc.create_session(Role::Offerer).await.unwrap();
        let (answerer, mut answer_events) = rtc.create_session(Role::Answerer).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        let answer = answerer.accept_offer(&offer).await.unwrap();
        offerer.apply_answer(&answer).await.unwrap();

        let mut offer_channel = None;
        while let Some(event) = offer_events.recv().await {
            if let RtcEvent::ChannelOpen(dc) = event {
                offer_channel = Some(dc);
                break;
            }
        }
        let offer_channel = offer_channel.unwrap();
        offer_channel.send(Bytes::from_static(b"hello")).await.unwrap();

        let mut received = None;
        while let Some(event) = answer_events.recv().await {
            if let RtcEvent::Message(data) = event {
                received = Some(data);
                break;
            }
        }
        assert_eq!(received.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let rtc = MemoryRtc::new();
        let (session, _rx) = rtc.create_session(Role::Offerer).await.unwrap();
        assert!(session.add_candidate("c", None).await.is_err());
    }

    #[tokio::test]
    async fn test_close_removes_session() {
        let rtc = MemoryRtc::new();
        let (session, _rx) = rtc.create_session(Role::Offerer).await.unwrap();
        assert_eq!(rtc.session_count(), 1);
        session.close().await;
        assert_eq!(rtc.session_count(), 0);
    }
}
