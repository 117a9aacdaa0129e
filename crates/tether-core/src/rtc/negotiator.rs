//! Data-channel negotiator
//!
//! State machine `idle → connecting → connected | disconnected | closed |
//! failed` for one remote host. Outbound signals go through a single
//! ordered queue; remote candidates that arrive before the remote
//! description are buffered and replayed once it is applied.
//!
//! When both sides offer at once, the side with the lower host name stays
//! the offerer and the other one answers.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use super::NegotiationState;
use super::candidates::CandidateQueue;
use super::connector::{Role, RtcConnector, RtcEvent, RtcSession};
use crate::config::TetherConfig;
use crate::error::Result;
use crate::host::normalize_host;
use crate::protocol::Signal;
use crate::transport::DataChannelTransport;

/// Delivers signals to the remote host's `rtcSignal` method
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send_signal(&self, signal: Signal) -> Result<()>;
}

/// What the negotiator reports to the owning peer
pub enum ChannelEvent {
    /// The data channel opened
    Opened(DataChannelTransport),
    /// A message arrived on the data channel
    Message(Bytes),
    /// The session ended; anything riding the channel is gone
    Terminal(NegotiationState),
}

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Our own normalized host name, compared against the remote one
    /// when both sides offer at once
    pub local_host: String,
    /// Upper bound on waiting for local gathering in non-trickle mode
    pub gathering_timeout: Duration,
    /// Send descriptions immediately and each candidate as gathered
    pub trickle: bool,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            local_host: String::new(),
            gathering_timeout: Duration::from_millis(2_000),
            trickle: true,
        }
    }
}

impl From<&TetherConfig> for NegotiatorConfig {
    fn from(config: &TetherConfig) -> Self {
        Self {
            local_host: normalize_host(&config.host_name),
            gathering_timeout: config.gathering_timeout(),
            trickle: config.trickle_ice,
        }
    }
}

struct ActiveSession {
    generation: u64,
    role: Role,
    session: Arc<dyn RtcSession>,
    remote_set: bool,
    gathered: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct Inner {
    active: Option<ActiveSession>,
    queue: CandidateQueue,
    generation: u64,
}

impl Inner {
    fn current(&self, generation: u64) -> Option<&ActiveSession> {
        self.active.as_ref().filter(|a| a.generation == generation)
    }
}

/// Session state shared with the outbound signal queue
#[derive(Clone)]
struct Shared {
    host: String,
    inner: Arc<Mutex<Inner>>,
    channel: Arc<StdMutex<Option<DataChannelTransport>>>,
    state: Arc<watch::Sender<NegotiationState>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Shared {
    fn set_channel(&self, channel: Option<DataChannelTransport>) {
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = channel;
    }

    fn set_state(&self, state: NegotiationState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Negotiation with {}: {} → {}", self.host, previous, state);
        }
    }

    fn take_session(
        &self,
        inner: &mut Inner,
        generation: u64,
        state: NegotiationState,
    ) -> Option<Arc<dyn RtcSession>> {
        inner.current(generation)?;
        let active = inner.active.take()?;
        inner.queue.clear();
        self.set_channel(None);
        self.set_state(state);
        let _ = self.events.send(ChannelEvent::Terminal(state));
        Some(active.session)
    }

    async fn terminate(&self, generation: u64, state: NegotiationState) {
        let session = {
            let mut inner = self.inner.lock().await;
            self.take_session(&mut inner, generation, state)
        };
        if let Some(session) = session {
            info!("Data channel to {} {}", self.host, state);
            session.close().await;
        }
    }

    /// Fails the session if it is still connecting; an open channel stays
    async fn fail_connecting(&self, generation: u64) -> bool {
        let session = {
            let mut inner = self.inner.lock().await;
            if *self.state.borrow() != NegotiationState::Connecting {
                return false;
            }
            self.take_session(&mut inner, generation, NegotiationState::Failed)
        };
        match session {
            Some(session) => {
                info!("Data channel to {} failed", self.host);
                session.close().await;
                true
            }
            None => false,
        }
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().await.current(generation).is_some()
    }
}

/// Negotiates and tracks the data channel to one remote host
#[derive(Clone)]
pub struct Negotiator {
    shared: Shared,
    connector: Arc<dyn RtcConnector>,
    config: NegotiatorConfig,
    outbound: mpsc::UnboundedSender<(u64, Signal)>,
}

impl Negotiator {
    /// Creates a negotiator and starts its outbound signal queue
    ///
    /// Channel events for the owning peer are delivered on `events`. A
    /// signal that cannot be delivered fails a session still connecting.
    pub fn new(
        host: impl Into<String>,
        connector: Arc<dyn RtcConnector>,
        signals: Arc<dyn SignalSink>,
        config: NegotiatorConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<(u64, Signal)>();
        let (state, _) = watch::channel(NegotiationState::Idle);
        let shared = Shared {
            host: host.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
            channel: Arc::new(StdMutex::new(None)),
            state: Arc::new(state),
            events,
        };

        let queue = shared.clone();
        tokio::spawn(async move {
            while let Some((generation, signal)) = outbound_rx.recv().await {
                let kind = signal.kind();
                if !queue.is_current(generation).await {
                    debug!("Dropping stale {} signal to {}", kind, queue.host);
                    continue;
                }
                debug!("↑ {} signal to {}", kind, queue.host);
                if let Err(e) = signals.send_signal(signal).await {
                    warn!("Failed to send {} signal to {}: {}", kind, queue.host, e);
                    queue.fail_connecting(generation).await;
                }
            }
        });

        Self {
            shared,
            connector,
            config,
            outbound,
        }
    }

    pub fn state(&self) -> NegotiationState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.shared.state.subscribe()
    }

    /// The open data channel, if any
    pub fn channel(&self) -> Option<DataChannelTransport> {
        self.shared
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|dc| dc.is_open())
    }

    fn host(&self) -> &str {
        &self.shared.host
    }

    fn queue_signal(&self, generation: u64, signal: Signal) {
        if self.outbound.send((generation, signal)).is_err() {
            warn!("Signal queue for {} is closed", self.host());
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state(),
            NegotiationState::Connecting | NegotiationState::Connected
        )
    }

    // ─────────────────────────────────────────────────────────────────────
    // Offerer
    // ─────────────────────────────────────────────────────────────────────

    /// Starts negotiating as the offerer
    ///
    /// A no-op while a negotiation is already connecting or connected.
    pub async fn start_offer(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.active.is_some() && self.is_active() {
            debug!("Negotiation with {} already {}", self.host(), self.state());
            return Ok(());
        }
        if let Some(stale) = inner.active.take() {
            stale.session.close().await;
        }
        inner.queue.clear();

        let (generation, session, gathered) = self.open_session(&mut inner, Role::Offerer).await?;
        info!("Offering data channel to {}", self.host());

        let sdp = match session.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                self.fail_locked(inner, generation).await;
                return Err(e);
            }
        };

        if self.config.trickle {
            // still holding the lock so no candidate can overtake the offer
            self.queue_signal(generation, Signal::Offer { sdp });
            return Ok(());
        }

        drop(inner);
        let sdp = self.await_gathering(&session, gathered, sdp).await;
        self.queue_signal(generation, Signal::Offer { sdp });
        Ok(())
    }

    async fn open_session(
        &self,
        inner: &mut Inner,
        role: Role,
    ) -> Result<(u64, Arc<dyn RtcSession>, watch::Receiver<bool>)> {
        inner.generation += 1;
        let generation = inner.generation;

        let (session, events) = match self.connector.create_session(role).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Could not create session for {}: {}", self.host(), e);
                self.shared.set_state(NegotiationState::Failed);
                return Err(e);
            }
        };

        let (gathered_tx, gathered_rx) = watch::channel(false);
        inner.active = Some(ActiveSession {
            generation,
            role,
            session: session.clone(),
            remote_set: false,
            gathered: Arc::new(gathered_tx),
        });
        self.shared.set_state(NegotiationState::Connecting);
        self.spawn_pump(generation, events);
        Ok((generation, session, gathered_rx))
    }

    async fn await_gathering(
        &self,
        session: &Arc<dyn RtcSession>,
        mut gathered: watch::Receiver<bool>,
        fallback: String,
    ) -> String {
        let done = gathered.wait_for(|done| *done);
        if tokio::time::timeout(self.config.gathering_timeout, done)
            .await
            .is_err()
        {
            warn!("Gathering for {} timed out, sending what we have", self.host());
        }
        session.local_description().await.unwrap_or(fallback)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound signals
    // ─────────────────────────────────────────────────────────────────────

    /// Applies one signal received through `rtcSignal`
    pub async fn handle_signal(&self, signal: Signal) -> Result<()> {
        debug!("↓ {} signal from {}", signal.kind(), self.host());
        match signal {
            Signal::Offer { sdp } => self.handle_offer(sdp).await,
            Signal::Answer { sdp } => self.handle_answer(sdp).await,
            Signal::Candidate { candidate, mid } => {
                self.handle_candidate(candidate, mid).await;
                Ok(())
            }
        }
    }

    /// Whether an offer that crosses our own pending offer wins
    fn yields_to_remote_offer(&self, active: &ActiveSession) -> bool {
        active.role == Role::Offerer
            && !active.remote_set
            && self.state() == NegotiationState::Connecting
            && self.config.local_host.as_str() > self.host()
    }

    async fn handle_offer(&self, sdp: String) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if let Some(active) = inner.active.as_ref() {
            if self.is_active() {
                if !self.yields_to_remote_offer(active) {
                    debug!("Ignoring offer from {}: negotiation already active", self.host());
                    return Ok(());
                }
                info!("Offers to {} crossed, answering theirs", self.host());
            }
        }
        if let Some(stale) = inner.active.take() {
            stale.session.close().await;
        }
        inner.queue.clear();

        let (generation, session, gathered) = self.open_session(&mut inner, Role::Answerer).await?;
        info!("Answering data channel offer from {}", self.host());

        let answer = match session.accept_offer(&sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_locked(inner, generation).await;
                return Err(e);
            }
        };

        if let Some(active) = inner.active.as_mut() {
            active.remote_set = true;
        }
        Self::flush_queue(self.host(), &session, &mut inner.queue).await;

        if self.config.trickle {
            self.queue_signal(generation, Signal::Answer { sdp: answer });
            return Ok(());
        }

        drop(inner);
        let this = self.clone();
        tokio::spawn(async move {
            let sdp = this.await_gathering(&session, gathered, answer).await;
            this.queue_signal(generation, Signal::Answer { sdp });
        });
        Ok(())
    }

    async fn handle_answer(&self, sdp: String) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let (generation, session) = match inner.active.as_ref() {
            Some(active) if active.role == Role::Offerer && !active.remote_set => {
                (active.generation, active.session.clone())
            }
            _ => {
                warn!("Unexpected answer from {}, ignoring", self.host());
                return Ok(());
            }
        };

        if let Err(e) = session.apply_answer(&sdp).await {
            self.fail_locked(inner, generation).await;
            return Err(e);
        }

        if let Some(active) = inner.active.as_mut() {
            active.remote_set = true;
        }
        Self::flush_queue(self.host(), &session, &mut inner.queue).await;
        Ok(())
    }

    async fn handle_candidate(&self, candidate: String, mid: Option<String>) {
        let mut inner = self.shared.inner.lock().await;
        let ready = inner
            .active
            .as_ref()
            .filter(|a| a.remote_set)
            .map(|a| a.session.clone());

        match ready {
            Some(session) => {
                if let Err(e) = session.add_candidate(&candidate, mid.as_deref()).await {
                    warn!("Bad candidate from {}: {}", self.host(), e);
                }
            }
            None => {
                inner.queue.enqueue(candidate, mid);
                debug!("Queued candidate from {} ({} pending)", self.host(), inner.queue.len());
            }
        }
    }

    async fn flush_queue(host: &str, session: &Arc<dyn RtcSession>, queue: &mut CandidateQueue) {
        let pending = queue.drain();
        if !pending.is_empty() {
            debug!("Replaying {} queued candidates from {}", pending.len(), host);
        }
        for candidate in pending {
            if let Err(e) = session
                .add_candidate(&candidate.candidate, candidate.mid.as_deref())
                .await
            {
                warn!("Bad queued candidate from {}: {}", host, e);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session events
    // ─────────────────────────────────────────────────────────────────────

    fn spawn_pump(&self, generation: u64, mut events: mpsc::UnboundedReceiver<RtcEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.handle_event(generation, event).await;
            }
        });
    }

    /// Applies one session event; events from superseded sessions are ignored
    pub async fn handle_event(&self, generation: u64, event: RtcEvent) {
        match event {
            RtcEvent::LocalCandidate { candidate, mid } => {
                let inner = self.shared.inner.lock().await;
                if inner.current(generation).is_some() && self.config.trickle {
                    self.queue_signal(generation, Signal::Candidate { candidate, mid });
                }
            }
            RtcEvent::GatheringComplete => {
                let inner = self.shared.inner.lock().await;
                if let Some(active) = inner.current(generation) {
                    active.gathered.send_replace(true);
                }
            }
            RtcEvent::ChannelOpen(channel) => {
                if !self.shared.is_current(generation).await {
                    channel.close().await;
                    return;
                }
                info!("Data channel to {} open", self.host());
                let transport = DataChannelTransport::new(channel);
                self.shared.set_channel(Some(transport.clone()));
                self.shared.set_state(NegotiationState::Connected);
                let _ = self.shared.events.send(ChannelEvent::Opened(transport));
            }
            RtcEvent::Message(data) => {
                if self.shared.is_current(generation).await {
                    let _ = self.shared.events.send(ChannelEvent::Message(data));
                }
            }
            RtcEvent::StateChange(state) if state.is_terminal() => {
                self.shared.terminate(generation, state).await;
            }
            RtcEvent::StateChange(_) => {}
            RtcEvent::ChannelClosed => {
                self.shared.terminate(generation, NegotiationState::Closed).await;
            }
        }
    }

    async fn fail_locked(&self, mut inner: tokio::sync::MutexGuard<'_, Inner>, generation: u64) {
        let session = self
            .shared
            .take_session(&mut inner, generation, NegotiationState::Failed);
        drop(inner);
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Gives up on a negotiation that is still connecting
    ///
    /// The session is failed so the next `start_offer` begins afresh. An
    /// open channel is left alone.
    pub async fn abandon(&self) {
        let generation = self.shared.inner.lock().await.generation;
        if self.shared.fail_connecting(generation).await {
            warn!("Negotiation with {} did not settle, gave up", self.host());
        }
    }

    /// Closes the current session, if any
    pub async fn close(&self) {
        let generation = self.shared.inner.lock().await.generation;
        self.shared.terminate(generation, NegotiationState::Closed).await;
    }

    /// Waits until the state leaves `connecting`, bounded by `timeout`
    pub async fn wait_settled(&self, timeout: Duration) -> NegotiationState {
        let mut rx = self.shared.state.subscribe();
        let settled = rx.wait_for(|state| *state != NegotiationState::Connecting);
        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        }
    }
}
