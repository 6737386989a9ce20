//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! One peer-connection handshake, offerer or answerer, driven to
//! `Connected` or `Failed` on its own actor.
//!
//! State diagram:
//!
//!     Idle -> CreatingOffer -> WaitingForAnswer -> ExchangingIce -> Connected -> Closed
//!     Idle -> Answering                         -> ExchangingIce -> Connected -> Closed
//!        * -> Failed (terminal)
//!
//! The offerer creates its default data channel before the offer so it
//! is announced in the SDP; the answerer installs its observer before
//! applying the remote description so an early `datachannel` event
//! cannot be dropped. Local candidates trickle out as they appear;
//! remote candidates are polled with a monotonic watermark,
//! deduplicated by candidate string, and queued until the remote
//! description is installed. Answer polling is the offer pool's job:
//! it feeds `handle_answer` into the right connection.

use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    common::{
        actor::{Actor, Stopper},
        ConnectionId, OfferId, Result, Role, ServerTimestamp,
    },
    core::sync::NamedMutex,
    error::ClientError,
    lite::signaling::{
        AnswerRecord, IceCandidateUpload, OfferRecord, OfferSpec, SignalingClient,
    },
    webrtc::{
        data_channel::{DataChannel, DataChannelInit, DataChannelObserver, DataChannelState},
        ice_candidate::IceCandidate,
        peer_connection::{ConnectionState, PeerConnection, SessionDescription},
        peer_connection_factory::{PeerConnectionFactory, RtcConfig},
        peer_connection_observer::PeerConnectionObserver,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    CreatingOffer,
    WaitingForAnswer,
    Answering,
    ExchangingIce,
    Connected,
    /// Terminal for this peer-connection instance.
    Failed,
    Closed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub rtc_config: RtcConfig,
    pub polling_interval: Duration,
    pub answer_timeout: Duration,
    pub ice_connect_timeout: Duration,
    /// How long ICE polling keeps running after `Connected`, to pick up
    /// late relay candidates.
    pub ice_poll_grace: Duration,
    /// Label of the data channel the offerer creates before the offer.
    /// `None` advertises a bare connection.
    pub default_channel_label: Option<String>,
    pub channel_init: DataChannelInit,
    pub offer_ttl: Option<Duration>,
    pub topics: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            rtc_config: RtcConfig::default(),
            polling_interval: Duration::from_millis(2000),
            answer_timeout: Duration::from_millis(30_000),
            ice_connect_timeout: Duration::from_millis(30_000),
            ice_poll_grace: Duration::from_millis(5000),
            default_channel_label: Some("data".to_string()),
            channel_init: DataChannelInit::default(),
            offer_ttl: None,
            topics: Vec::new(),
        }
    }
}

/// What a connected handshake hands over. The receiver owns both from
/// here on.
pub struct ConnectedTransport {
    pub peer_connection: Arc<dyn PeerConnection>,
    pub data_channel: Option<Arc<dyn DataChannel>>,
}

pub trait ConnectionObserver: Send + Sync {
    fn handle_state_changed(&self, connection_id: ConnectionId, state: HandshakeState) {
        let _ = (connection_id, state);
    }
    /// The offer is on the server; the pool keys its map by the id in
    /// this record.
    fn handle_offer_published(&self, connection_id: ConnectionId, offer: OfferRecord) {
        let _ = (connection_id, offer);
    }
    /// Every inbound data channel announced by the remote side.
    fn handle_incoming_channel(&self, connection_id: ConnectionId, data_channel: Arc<dyn DataChannel>) {
        let _ = (connection_id, data_channel);
    }
    fn handle_connected(&self, connection_id: ConnectionId, transport: ConnectedTransport);
    /// Terminal failure: handshake error, phase timeout, or transport
    /// loss after `Connected`.
    fn handle_failed(&self, connection_id: ConnectionId, error: anyhow::Error);
}

#[derive(Clone)]
pub struct Connection {
    connection_id: ConnectionId,
    role: Role,
    actor: Actor<State>,
    shared: Arc<NamedMutex<Shared>>,
}

struct Shared {
    state: HandshakeState,
    offer_id: Option<OfferId>,
}

struct State {
    connection_id: ConnectionId,
    role: Role,
    config: ConnectionConfig,
    signaling: SignalingClient,
    observer: Arc<dyn ConnectionObserver>,
    shared: Arc<NamedMutex<Shared>>,
    state: HandshakeState,

    peer_connection: Option<Arc<dyn PeerConnection>>,
    data_channel: Option<Arc<dyn DataChannel>>,
    offer_id: Option<OfferId>,

    ice_watermark: ServerTimestamp,
    seen_remote_candidates: HashSet<String>,
    pending_remote_candidates: Vec<IceCandidate>,
    /// Gathered before the offer id exists; posted once it does.
    pending_local_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    ice_polling: bool,

    peer_connected: bool,
    channel_open: bool,
    connected_at: Option<Instant>,

    /// Bumped on fail/close; timers and late completions compare
    /// against it before acting.
    epoch: u64,

    actor: Actor<State>,
}

impl Connection {
    /// Offerer path: publishes one offer and waits for the pool to feed
    /// in the matching answer.
    pub fn start_offerer(
        connection_id: ConnectionId,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: SignalingClient,
        config: ConnectionConfig,
        observer: Box<dyn ConnectionObserver>,
    ) -> Result<Self> {
        let connection = Self::start(connection_id, Role::Offerer, factory, signaling, config, observer)?;
        connection.actor.send(State::begin_offer);
        Ok(connection)
    }

    /// Answerer path: consumes a discovered offer.
    pub fn start_answerer(
        connection_id: ConnectionId,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: SignalingClient,
        config: ConnectionConfig,
        offer: OfferRecord,
        observer: Box<dyn ConnectionObserver>,
    ) -> Result<Self> {
        let connection = Self::start(connection_id, Role::Answerer, factory, signaling, config, observer)?;
        connection
            .actor
            .send(move |state| State::begin_answer(state, offer));
        Ok(connection)
    }

    fn start(
        connection_id: ConnectionId,
        role: Role,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: SignalingClient,
        config: ConnectionConfig,
        observer: Box<dyn ConnectionObserver>,
    ) -> Result<Self> {
        debug!("connection {}: starting as {}", connection_id, role);
        let observer: Arc<dyn ConnectionObserver> = observer.into();
        let shared = Arc::new(NamedMutex::new(
            Shared {
                state: HandshakeState::Idle,
                offer_id: None,
            },
            "Connection::shared",
        ));
        let shared_for_actor = shared.clone();
        let actor = Actor::start("Connection", Stopper::new(), move |actor| {
            let peer_connection_observer = PcObserver {
                actor: actor.clone(),
                epoch: 0,
            };
            let peer_connection = factory
                .create_peer_connection(&config.rtc_config, Box::new(peer_connection_observer))?;

            // Offerer-side default channel, created before the offer so
            // the SDP announces it.
            let data_channel = match (role, &config.default_channel_label) {
                (Role::Offerer, Some(label)) => Some(
                    peer_connection.create_data_channel(label, config.channel_init.clone())?,
                ),
                _ => None,
            };

            Ok(State {
                connection_id,
                role,
                config,
                signaling,
                observer,
                shared: shared_for_actor,
                state: HandshakeState::Idle,
                peer_connection: Some(peer_connection),
                data_channel,
                offer_id: None,
                ice_watermark: 0,
                seen_remote_candidates: HashSet::new(),
                pending_remote_candidates: Vec::new(),
                pending_local_candidates: Vec::new(),
                remote_description_set: false,
                ice_polling: false,
                peer_connected: false,
                channel_open: false,
                connected_at: None,
                epoch: 0,
                actor,
            })
        })?;
        Ok(Self {
            connection_id,
            role,
            actor,
            shared,
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.shared
            .lock()
            .map(|shared| shared.state)
            .unwrap_or(HandshakeState::Closed)
    }

    pub fn offer_id(&self) -> Option<OfferId> {
        self.shared.lock().ok().and_then(|shared| shared.offer_id.clone())
    }

    /// Feeds in an answer found by the pool's batch poll. Legal only
    /// while waiting for one; a second answer for the same offer is
    /// ignored (first one wins).
    pub fn handle_answer(&self, answer: AnswerRecord) -> Result<()> {
        match self.state() {
            HandshakeState::WaitingForAnswer => {
                self.actor
                    .send(move |state| State::on_answer(state, answer));
                Ok(())
            }
            HandshakeState::ExchangingIce | HandshakeState::Connected => {
                debug!(
                    "connection {}: ignoring duplicate answer for {}",
                    self.connection_id, answer.offer_id
                );
                Ok(())
            }
            other => Err(ClientError::InvalidState {
                operation: "handle_answer",
                state: other.to_string(),
            }
            .into()),
        }
    }

    pub fn close(&self) {
        self.actor.send(State::close_inner);
    }

    /// Flushes the actor queue; test support.
    pub fn synchronize(&self) {
        self.actor.synchronize();
    }
}

impl State {
    fn set_state(state: &mut State, new: HandshakeState) {
        if state.state == new {
            return;
        }
        debug!(
            "connection {}: {} -> {}",
            state.connection_id, state.state, new
        );
        state.state = new;
        if let Ok(mut shared) = state.shared.lock() {
            shared.state = new;
        }
        state.observer.handle_state_changed(state.connection_id, new);
    }

    // ---- offerer path ----

    fn begin_offer(state: &mut State) {
        if state.state != HandshakeState::Idle {
            return;
        }
        Self::set_state(state, HandshakeState::CreatingOffer);
        if let Some(data_channel) = &state.data_channel {
            Self::watch_channel(state, data_channel.clone());
        }
        let peer_connection = match &state.peer_connection {
            Some(peer_connection) => peer_connection.clone(),
            None => return,
        };
        let actor = state.actor.clone();
        let epoch = state.epoch;
        peer_connection.create_offer(Box::new(move |result| {
            actor.send(move |state| Self::on_offer_created(state, epoch, result));
        }));
    }

    fn on_offer_created(state: &mut State, epoch: u64, result: Result<SessionDescription>) {
        if state.epoch != epoch || state.state != HandshakeState::CreatingOffer {
            return;
        }
        let description = match result {
            Ok(description) => description,
            Err(err) => return Self::fail(state, err),
        };
        let peer_connection = match &state.peer_connection {
            Some(peer_connection) => peer_connection.clone(),
            None => return,
        };
        let actor = state.actor.clone();
        let sdp = description.sdp.clone();
        peer_connection.set_local_description(
            description,
            Box::new(move |result| {
                actor.send(move |state| Self::on_offer_local_set(state, epoch, sdp, result));
            }),
        );
    }

    fn on_offer_local_set(state: &mut State, epoch: u64, sdp: String, result: Result<()>) {
        if state.epoch != epoch || state.state != HandshakeState::CreatingOffer {
            return;
        }
        if let Err(err) = result {
            return Self::fail(state, err);
        }
        let actor = state.actor.clone();
        let spec = OfferSpec {
            sdp,
            topics: if state.config.topics.is_empty() {
                None
            } else {
                Some(state.config.topics.clone())
            },
            ttl_millis: state.config.offer_ttl.map(|ttl| ttl.as_millis() as u64),
        };
        state.signaling.create_offers(
            vec![spec],
            Box::new(move |result| {
                actor.send(move |state| Self::on_offer_posted(state, epoch, result));
            }),
        );
    }

    fn on_offer_posted(state: &mut State, epoch: u64, result: Result<Vec<OfferRecord>>) {
        if state.epoch != epoch || state.state != HandshakeState::CreatingOffer {
            return;
        }
        let record = match result {
            Ok(mut records) if !records.is_empty() => records.remove(0),
            Ok(_) => {
                return Self::fail(
                    state,
                    ClientError::Network("server accepted no offers".to_string()).into(),
                )
            }
            Err(err) => return Self::fail(state, err),
        };
        info!(
            "connection {}: offer {} published",
            state.connection_id, record.id
        );
        state.offer_id = Some(record.id.clone());
        if let Ok(mut shared) = state.shared.lock() {
            shared.offer_id = Some(record.id.clone());
        }
        Self::flush_pending_local_candidates(state);
        Self::set_state(state, HandshakeState::WaitingForAnswer);
        state
            .observer
            .handle_offer_published(state.connection_id, record);
        Self::arm_phase_timeout(
            state,
            "waiting for answer",
            state.config.answer_timeout,
            HandshakeState::WaitingForAnswer,
        );
        Self::start_ice_polling(state);
    }

    fn on_answer(state: &mut State, answer: AnswerRecord) {
        if state.state != HandshakeState::WaitingForAnswer {
            debug!(
                "connection {}: answer arrived in {}, ignoring",
                state.connection_id, state.state
            );
            return;
        }
        let peer_connection = match &state.peer_connection {
            Some(peer_connection) => peer_connection.clone(),
            None => return,
        };
        let actor = state.actor.clone();
        let epoch = state.epoch;
        peer_connection.set_remote_description(
            SessionDescription::answer(answer.sdp),
            Box::new(move |result| {
                actor.send(move |state| Self::on_offer_remote_set(state, epoch, result));
            }),
        );
    }

    fn on_offer_remote_set(state: &mut State, epoch: u64, result: Result<()>) {
        if state.epoch != epoch || state.state != HandshakeState::WaitingForAnswer {
            return;
        }
        if let Err(err) = result {
            return Self::fail(state, err);
        }
        state.remote_description_set = true;
        Self::apply_pending_remote_candidates(state);
        Self::set_state(state, HandshakeState::ExchangingIce);
        Self::arm_phase_timeout(
            state,
            "ice connection",
            state.config.ice_connect_timeout,
            HandshakeState::ExchangingIce,
        );
        Self::maybe_connected(state);
    }

    // ---- answerer path ----

    fn begin_answer(state: &mut State, offer: OfferRecord) {
        if state.state != HandshakeState::Idle {
            return;
        }
        state.offer_id = Some(offer.id.clone());
        if let Ok(mut shared) = state.shared.lock() {
            shared.offer_id = Some(offer.id.clone());
        }
        Self::set_state(state, HandshakeState::Answering);
        let peer_connection = match &state.peer_connection {
            Some(peer_connection) => peer_connection.clone(),
            None => return,
        };
        let actor = state.actor.clone();
        let epoch = state.epoch;
        // The datachannel handler is already installed (it was wired at
        // peer-connection construction), so applying the remote offer
        // now cannot lose an early channel announcement.
        peer_connection.set_remote_description(
            SessionDescription::offer(offer.sdp),
            Box::new(move |result| {
                actor.send(move |state| Self::on_answer_remote_set(state, epoch, result));
            }),
        );
        Self::arm_phase_timeout(
            state,
            "creating answer",
            state.config.answer_timeout,
            HandshakeState::Answering,
        );
        Self::start_ice_polling(state);
    }

    fn on_answer_remote_set(state: &mut State, epoch: u64, result: Result<()>) {
        if state.epoch != epoch || state.state != HandshakeState::Answering {
            return;
        }
        if let Err(err) = result {
            return Self::fail(state, err);
        }
        state.remote_description_set = true;
        Self::apply_pending_remote_candidates(state);
        let peer_connection = match &state.peer_connection {
            Some(peer_connection) => peer_connection.clone(),
            None => return,
        };
        let actor = state.actor.clone();
        peer_connection.create_answer(Box::new(move |result| {
            actor.send(move |state| Self::on_answer_created(state, epoch, result));
        }));
    }

    fn on_answer_created(state: &mut State, epoch: u64, result: Result<SessionDescription>) {
        if state.epoch != epoch || state.state != HandshakeState::Answering {
            return;
        }
        let description = match result {
            Ok(description) => description,
            Err(err) => return Self::fail(state, err),
        };
        let peer_connection = match &state.peer_connection {
            Some(peer_connection) => peer_connection.clone(),
            None => return,
        };
        let actor = state.actor.clone();
        let sdp = description.sdp.clone();
        peer_connection.set_local_description(
            description,
            Box::new(move |result| {
                actor.send(move |state| Self::on_answer_local_set(state, epoch, sdp, result));
            }),
        );
    }

    fn on_answer_local_set(state: &mut State, epoch: u64, sdp: String, result: Result<()>) {
        if state.epoch != epoch || state.state != HandshakeState::Answering {
            return;
        }
        if let Err(err) = result {
            return Self::fail(state, err);
        }
        let offer_id = match &state.offer_id {
            Some(offer_id) => offer_id.clone(),
            None => return,
        };
        let actor = state.actor.clone();
        state.signaling.answer_offer(
            &offer_id,
            &sdp,
            Box::new(move |result| {
                actor.send(move |state| Self::on_answer_posted(state, epoch, result));
            }),
        );
    }

    fn on_answer_posted(state: &mut State, epoch: u64, result: Result<OfferId>) {
        if state.epoch != epoch || state.state != HandshakeState::Answering {
            return;
        }
        if let Err(err) = result {
            return Self::fail(state, err);
        }
        Self::set_state(state, HandshakeState::ExchangingIce);
        Self::arm_phase_timeout(
            state,
            "ice connection",
            state.config.ice_connect_timeout,
            HandshakeState::ExchangingIce,
        );
        Self::maybe_connected(state);
    }

    // ---- ICE exchange ----

    fn on_local_candidate(state: &mut State, epoch: u64, candidate: IceCandidate) {
        if state.epoch != epoch {
            return;
        }
        match state.state {
            HandshakeState::Failed | HandshakeState::Closed => return,
            _ => {}
        }
        debug!(
            "connection {}: local candidate {}",
            state.connection_id, candidate
        );
        match state.offer_id.clone() {
            Some(offer_id) => Self::post_local_candidates(state, &offer_id, vec![candidate]),
            None => state.pending_local_candidates.push(candidate),
        }
    }

    fn flush_pending_local_candidates(state: &mut State) {
        if state.pending_local_candidates.is_empty() {
            return;
        }
        if let Some(offer_id) = state.offer_id.clone() {
            let pending = std::mem::take(&mut state.pending_local_candidates);
            Self::post_local_candidates(state, &offer_id, pending);
        }
    }

    fn post_local_candidates(state: &mut State, offer_id: &str, candidates: Vec<IceCandidate>) {
        let uploads = candidates
            .into_iter()
            .map(|candidate| IceCandidateUpload {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                role: state.role,
            })
            .collect();
        let connection_id = state.connection_id;
        state.signaling.add_ice_candidates(
            offer_id,
            uploads,
            Box::new(move |result| {
                if let Err(err) = result {
                    warn!(
                        "connection {}: failed to post candidates: {}",
                        connection_id, err
                    );
                }
            }),
        );
    }

    fn start_ice_polling(state: &mut State) {
        if state.ice_polling {
            return;
        }
        state.ice_polling = true;
        Self::ice_poll_tick(state);
    }

    fn ice_poll_tick(state: &mut State) {
        match state.state {
            HandshakeState::Failed | HandshakeState::Closed => {
                state.ice_polling = false;
                return;
            }
            HandshakeState::Connected => {
                // Keep polling through a short grace period for late
                // relay candidates, then stop.
                let expired = state
                    .connected_at
                    .map(|at| at.elapsed() >= state.config.ice_poll_grace)
                    .unwrap_or(true);
                if expired {
                    state.ice_polling = false;
                    return;
                }
            }
            _ => {}
        }
        let epoch = state.epoch;
        if let Some(offer_id) = state.offer_id.clone() {
            let actor = state.actor.clone();
            let since = state.ice_watermark;
            state.signaling.get_ice_candidates(
                &offer_id,
                since,
                Box::new(move |result| {
                    actor.send(move |state| Self::on_remote_candidates(state, epoch, result));
                }),
            );
        }
        state
            .actor
            .send_delayed(state.config.polling_interval, move |state| {
                if state.epoch == epoch && state.ice_polling {
                    Self::ice_poll_tick(state);
                }
            });
    }

    fn on_remote_candidates(
        state: &mut State,
        epoch: u64,
        result: Result<Vec<crate::lite::signaling::IceCandidateRecord>>,
    ) {
        if state.epoch != epoch {
            return;
        }
        let records = match result {
            Ok(records) => records,
            Err(err) => {
                // One bad tick never kills the exchange.
                warn!(
                    "connection {}: candidate poll failed: {}",
                    state.connection_id, err
                );
                return;
            }
        };
        for record in records {
            state.ice_watermark = state.ice_watermark.max(record.created_at);
            if record.role != state.role.opposite() {
                continue;
            }
            if !state.seen_remote_candidates.insert(record.candidate.clone()) {
                continue;
            }
            let candidate =
                IceCandidate::new(record.candidate, record.sdp_mid, record.sdp_mline_index);
            if state.remote_description_set {
                Self::apply_remote_candidate(state, candidate);
            } else {
                state.pending_remote_candidates.push(candidate);
            }
        }
    }

    fn apply_pending_remote_candidates(state: &mut State) {
        let pending = std::mem::take(&mut state.pending_remote_candidates);
        for candidate in pending {
            Self::apply_remote_candidate(state, candidate);
        }
    }

    fn apply_remote_candidate(state: &mut State, candidate: IceCandidate) {
        let peer_connection = match &state.peer_connection {
            Some(peer_connection) => peer_connection.clone(),
            None => return,
        };
        let connection_id = state.connection_id;
        peer_connection.add_ice_candidate(
            candidate,
            Box::new(move |result| {
                if let Err(err) = result {
                    warn!(
                        "connection {}: add_ice_candidate failed: {}",
                        connection_id, err
                    );
                }
            }),
        );
    }

    // ---- connectivity ----

    fn on_peer_connection_state(state: &mut State, epoch: u64, new: ConnectionState) {
        if state.epoch != epoch {
            return;
        }
        debug!(
            "connection {}: peer connection is {}",
            state.connection_id, new
        );
        match new {
            ConnectionState::Connected => {
                state.peer_connected = true;
                Self::maybe_connected(state);
            }
            ConnectionState::Failed => Self::fail(
                state,
                ClientError::TransportLost("peer connection failed".to_string()).into(),
            ),
            ConnectionState::Disconnected => {
                if state.state == HandshakeState::Connected {
                    Self::fail(
                        state,
                        ClientError::TransportLost("peer connection disconnected".to_string())
                            .into(),
                    );
                }
            }
            _ => {}
        }
    }

    fn on_incoming_channel(state: &mut State, epoch: u64, data_channel: Arc<dyn DataChannel>) {
        if state.epoch != epoch {
            return;
        }
        debug!(
            "connection {}: incoming channel {:?}",
            state.connection_id,
            data_channel.label()
        );
        state
            .observer
            .handle_incoming_channel(state.connection_id, data_channel.clone());
        if state.data_channel.is_none() {
            Self::watch_channel(state, data_channel.clone());
            if data_channel.ready_state() == DataChannelState::Open {
                state.channel_open = true;
            }
            state.data_channel = Some(data_channel);
            Self::maybe_connected(state);
        }
    }

    fn watch_channel(state: &mut State, data_channel: Arc<dyn DataChannel>) {
        data_channel.set_observer(Box::new(ChannelOpenWatcher {
            actor: state.actor.clone(),
            epoch: state.epoch,
        }));
    }

    fn on_channel_open(state: &mut State, epoch: u64) {
        if state.epoch != epoch {
            return;
        }
        state.channel_open = true;
        Self::maybe_connected(state);
    }

    /// Connected = peer connection connected and the primary data
    /// channel (when one is expected) open.
    fn maybe_connected(state: &mut State) {
        if state.state == HandshakeState::Connected
            || state.state == HandshakeState::Failed
            || state.state == HandshakeState::Closed
        {
            return;
        }
        if !state.peer_connected {
            return;
        }
        let channel_ready = match &state.data_channel {
            Some(data_channel) => {
                state.channel_open || data_channel.ready_state() == DataChannelState::Open
            }
            // An offerer configured without a default channel has
            // nothing to wait for; an answerer always waits for the
            // announced channel.
            None => state.role == Role::Offerer && state.config.default_channel_label.is_none(),
        };
        if !channel_ready {
            return;
        }
        state.connected_at = Some(Instant::now());
        Self::set_state(state, HandshakeState::Connected);
        info!("connection {}: connected", state.connection_id);
        let transport = ConnectedTransport {
            peer_connection: match &state.peer_connection {
                Some(peer_connection) => peer_connection.clone(),
                None => return,
            },
            data_channel: state.data_channel.clone(),
        };
        state.observer.handle_connected(state.connection_id, transport);
    }

    // ---- teardown ----

    fn arm_phase_timeout(
        state: &mut State,
        phase: &'static str,
        timeout: Duration,
        expected: HandshakeState,
    ) {
        let epoch = state.epoch;
        state.actor.send_delayed(timeout, move |state| {
            if state.epoch == epoch && state.state == expected {
                Self::fail(state, ClientError::Timeout(phase, timeout).into());
            }
        });
    }

    fn fail(state: &mut State, error: anyhow::Error) {
        if state.state == HandshakeState::Failed || state.state == HandshakeState::Closed {
            return;
        }
        warn!("connection {}: failed: {}", state.connection_id, error);
        state.epoch += 1;
        state.ice_polling = false;
        if let Some(peer_connection) = state.peer_connection.take() {
            peer_connection.close();
        }
        state.data_channel = None;
        Self::set_state(state, HandshakeState::Failed);
        state.observer.handle_failed(state.connection_id, error);
    }

    fn close_inner(state: &mut State) {
        if state.state != HandshakeState::Closed {
            state.epoch += 1;
            state.ice_polling = false;
            if let Some(peer_connection) = state.peer_connection.take() {
                peer_connection.close();
            }
            state.data_channel = None;
            Self::set_state(state, HandshakeState::Closed);
        }
        // The connection is transient; its actor goes away with it.
        state.actor.stopper().stop_all_without_joining();
    }
}

/// Forwards peer-connection events onto the actor. The epoch it was
/// created under (always the first) stops events from a closed peer
/// connection after fail/close bump the state epoch.
struct PcObserver {
    actor: Actor<State>,
    epoch: u64,
}

impl PeerConnectionObserver for PcObserver {
    fn handle_ice_candidate(&self, candidate: IceCandidate) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| State::on_local_candidate(state, epoch, candidate));
    }

    fn handle_connection_state_changed(&self, new: ConnectionState) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| State::on_peer_connection_state(state, epoch, new));
    }

    fn handle_data_channel(&self, data_channel: Arc<dyn DataChannel>) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| State::on_incoming_channel(state, epoch, data_channel));
    }
}

struct ChannelOpenWatcher {
    actor: Actor<State>,
    epoch: u64,
}

impl DataChannelObserver for ChannelOpenWatcher {
    fn handle_open(&self) {
        let epoch = self.epoch;
        self.actor.send(move |state| State::on_channel_open(state, epoch));
    }

    fn handle_message(&self, _data: bytes::Bytes) {
        // Nothing listens before the durable layer attaches.
    }

    fn handle_error(&self, description: String) {
        warn!("handshake channel error: {}", description);
    }

    fn handle_close(&self) {}
}
