//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! One logical peer session that outlives the peer connections under
//! it.
//!
//! State diagram:
//!
//!     Disconnected
//!          |  connect()
//!          V
//!      Connecting -----------------> Connected
//!          |        attempt ok           |
//!          |  attempt failed             |  transport lost
//!          V                             V
//!       Failed <---- budget spent -- Reconnecting  (backoff timer)
//!          |                             |
//!          +------- close() ------------>+--> Closed
//!
//! On a drop, every durable channel is detached (its queue survives),
//! the dead peer connection is discarded, and the backoff scheduler
//! drives fresh connect attempts. On success the channels re-attach to
//! new underlying data channels by label: locally created channels are
//! re-created on the new peer connection, remotely created ones are
//! matched from `datachannel` announcements, and unknown labels are
//! auto-created and surfaced to the observer.

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::Duration,
};

use crate::{
    common::{
        actor::{Actor, Stopper},
        ConnectionId, Result,
    },
    core::{
        backoff::RetryScheduler,
        channel::{ChannelConfig, DurableChannel},
        connection::{ConnectedTransport, Connection, ConnectionConfig, ConnectionObserver},
        sync::NamedMutex,
    },
    error::ClientError,
    lite::signaling::{OfferRecord, ServiceRecord, SignalingClient},
    webrtc::{
        data_channel::DataChannel,
        peer_connection::PeerConnection,
        peer_connection_factory::{PeerConnectionFactory, RtcConfig},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Never connected, or connect() not yet called.
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect budget spent. connect() may be called again.
    Failed,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How the remote service is addressed: directly by uuid, or by
/// username + FQN which the server resolves to a uuid.
#[derive(Clone, Debug)]
pub enum ServiceAddress {
    Uuid(String),
    Username {
        username: String,
        service_fqn: String,
    },
}

#[derive(Clone)]
pub struct DurableConnectionConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_base: Duration,
    pub reconnect_backoff_max: Duration,
    pub reconnect_jitter: f64,
    /// Budget for one whole connect attempt (resolve, answer, ICE).
    pub connection_timeout: Duration,
    pub polling_interval: Duration,
    /// Defaults for channels created on this session.
    pub channel: ChannelConfig,
    pub rtc_config: RtcConfig,
}

impl Default for DurableConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            reconnect_backoff_base: Duration::from_millis(1000),
            reconnect_backoff_max: Duration::from_millis(30_000),
            reconnect_jitter: 0.2,
            connection_timeout: Duration::from_millis(30_000),
            polling_interval: Duration::from_millis(2000),
            channel: ChannelConfig::default(),
            rtc_config: RtcConfig::default(),
        }
    }
}

pub trait DurableConnectionObserver: Send + Sync {
    fn handle_state_changed(&self, state: SessionState) {
        let _ = state;
    }
    fn handle_connected(&self) {}
    /// The remote side announced a channel label the application had
    /// not declared; it was auto-created and is now tracked.
    fn handle_channel_added(&self, channel: DurableChannel) {
        let _ = channel;
    }
    /// `permanent` is true exactly once, when the reconnect budget is
    /// spent. Transient attempt failures report `permanent = false`.
    fn handle_failed(&self, error: anyhow::Error, permanent: bool) {
        let _ = (error, permanent);
    }
}

#[derive(Clone)]
pub struct DurableConnection {
    actor: Actor<State>,
    shared: Arc<NamedMutex<SessionShared>>,
    channel_defaults: ChannelConfig,
}

struct SessionShared {
    state: SessionState,
    channels: HashMap<String, DurableChannel>,
}

struct ChannelEntry {
    channel: DurableChannel,
    /// Locally created channels are re-created on each new peer
    /// connection; remote ones are re-matched from announcements.
    locally_created: bool,
}

struct ActiveSession {
    connection: Connection,
    peer_connection: Option<Arc<dyn PeerConnection>>,
}

struct State {
    address: ServiceAddress,
    config: DurableConnectionConfig,
    signaling: SignalingClient,
    factory: Arc<dyn PeerConnectionFactory>,
    observer: Arc<dyn DurableConnectionObserver>,
    shared: Arc<NamedMutex<SessionShared>>,
    state: SessionState,

    channels: HashMap<String, ChannelEntry>,
    active: Option<ActiveSession>,
    retry: RetryScheduler,
    next_connection_id: ConnectionId,

    /// Bumped at the start of every connect attempt and on close;
    /// events from earlier handshakes are dropped.
    epoch: u64,

    actor: Actor<State>,
}

impl DurableConnection {
    pub fn new(
        address: ServiceAddress,
        signaling: SignalingClient,
        factory: Arc<dyn PeerConnectionFactory>,
        config: DurableConnectionConfig,
        observer: Box<dyn DurableConnectionObserver>,
    ) -> Result<Self> {
        let observer: Arc<dyn DurableConnectionObserver> = observer.into();
        let channel_defaults = config.channel.clone();
        let shared = Arc::new(NamedMutex::new(
            SessionShared {
                state: SessionState::Disconnected,
                channels: HashMap::new(),
            },
            "DurableConnection::shared",
        ));
        let shared_for_actor = shared.clone();
        let retry = RetryScheduler::new(
            config.reconnect_backoff_base,
            config.reconnect_backoff_max,
            config.reconnect_jitter,
            config.max_reconnect_attempts,
        );
        let actor = Actor::start("DurableConnection", Stopper::new(), move |actor| {
            Ok(State {
                address,
                config,
                signaling,
                factory,
                observer,
                shared: shared_for_actor,
                state: SessionState::Disconnected,
                channels: HashMap::new(),
                active: None,
                retry,
                next_connection_id: 1,
                epoch: 0,
                actor,
            })
        })?;
        Ok(Self {
            actor,
            shared,
            channel_defaults,
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared
            .lock()
            .map(|shared| shared.state)
            .unwrap_or(SessionState::Closed)
    }

    /// Starts connecting. Legal from `Disconnected` and from `Failed`
    /// (which also restores the reconnect budget).
    pub fn connect(&self) {
        self.actor.send(|state| {
            match state.state {
                SessionState::Disconnected | SessionState::Failed => {
                    state.retry.reset();
                    State::connect_attempt(state);
                }
                other => warn!("durable connection: connect() in {}, ignoring", other),
            }
        });
    }

    /// Declares a channel on this session. If currently connected the
    /// underlying data channel is created right away; otherwise it is
    /// attached on the next `Connected` transition.
    pub fn create_channel(
        &self,
        label: &str,
        config: Option<ChannelConfig>,
    ) -> Result<DurableChannel> {
        let channel = {
            let mut shared = self.shared.lock()?;
            if shared.state == SessionState::Closed {
                return Err(ClientError::InvalidState {
                    operation: "create_channel",
                    state: shared.state.to_string(),
                }
                .into());
            }
            if shared.channels.contains_key(label) {
                return Err(ClientError::DuplicateChannel(label.to_string()).into());
            }
            let channel =
                DurableChannel::new(label, config.unwrap_or_else(|| self.channel_defaults.clone()));
            shared.channels.insert(label.to_string(), channel.clone());
            channel
        };
        let label = label.to_string();
        let channel_for_actor = channel.clone();
        self.actor.send(move |state| {
            State::register_channel(state, label, channel_for_actor, true);
        });
        Ok(channel)
    }

    pub fn channel(&self, label: &str) -> Option<DurableChannel> {
        self.shared
            .lock()
            .ok()
            .and_then(|shared| shared.channels.get(label).cloned())
    }

    /// Cancels any pending reconnection, closes every channel and the
    /// current peer connection. Terminal.
    pub fn close(&self) {
        self.actor.send(State::close_inner);
    }

    /// Flushes the actor queue; test support.
    pub fn synchronize(&self) {
        self.actor.synchronize();
    }
}

impl State {
    fn set_state(state: &mut State, new: SessionState) {
        if state.state == new {
            return;
        }
        debug!("durable connection: {} -> {}", state.state, new);
        state.state = new;
        if let Ok(mut shared) = state.shared.lock() {
            shared.state = new;
        }
        state.observer.handle_state_changed(new);
    }

    // ---- connecting ----

    fn connect_attempt(state: &mut State) {
        state.epoch += 1;
        let epoch = state.epoch;
        if state.state != SessionState::Reconnecting {
            Self::set_state(state, SessionState::Connecting);
        }
        info!(
            "durable connection: attempt {} to {:?}",
            state.retry.attempt(),
            state.address
        );

        let actor = state.actor.clone();
        let done: crate::lite::signaling::ResponseHandler<Option<ServiceRecord>> =
            Box::new(move |result| {
                actor.send(move |state| Self::on_service_resolved(state, epoch, result));
            });
        match &state.address {
            ServiceAddress::Uuid(uuid) => state.signaling.get_service(uuid, done),
            ServiceAddress::Username {
                username,
                service_fqn,
            } => state.signaling.lookup_service(username, service_fqn, done),
        }

        let timeout = state.config.connection_timeout;
        state.actor.send_delayed(timeout, move |state| {
            let still_connecting = matches!(
                state.state,
                SessionState::Connecting | SessionState::Reconnecting
            );
            if state.epoch == epoch && still_connecting {
                Self::attempt_failed(
                    state,
                    ClientError::Timeout("connection", timeout).into(),
                );
            }
        });
    }

    fn on_service_resolved(
        state: &mut State,
        epoch: u64,
        result: Result<Option<ServiceRecord>>,
    ) {
        if state.epoch != epoch {
            return;
        }
        let service = match result {
            Ok(Some(service)) => service,
            Ok(None) => {
                return Self::attempt_failed(
                    state,
                    ClientError::NotFound(format!("service {:?}", state.address)).into(),
                )
            }
            Err(err) => return Self::attempt_failed(state, err),
        };
        let offer_id = match service.offer_id {
            Some(offer_id) => offer_id,
            None => {
                return Self::attempt_failed(
                    state,
                    ClientError::NotFound(format!(
                        "service {} has no outstanding offer",
                        service.uuid
                    ))
                    .into(),
                )
            }
        };
        let actor = state.actor.clone();
        state.signaling.get_offer(
            &offer_id,
            Box::new(move |result| {
                actor.send(move |state| Self::on_offer_fetched(state, epoch, result));
            }),
        );
    }

    fn on_offer_fetched(state: &mut State, epoch: u64, result: Result<Option<OfferRecord>>) {
        if state.epoch != epoch {
            return;
        }
        let offer = match result {
            Ok(Some(offer)) => offer,
            Ok(None) => {
                return Self::attempt_failed(
                    state,
                    ClientError::NotFound("advertised offer is gone".to_string()).into(),
                )
            }
            Err(err) => return Self::attempt_failed(state, err),
        };

        let connection_id = state.next_connection_id;
        state.next_connection_id += 1;
        let connection_config = ConnectionConfig {
            rtc_config: state.config.rtc_config.clone(),
            polling_interval: state.config.polling_interval,
            answer_timeout: state.config.connection_timeout,
            ice_connect_timeout: state.config.connection_timeout,
            default_channel_label: None,
            ..ConnectionConfig::default()
        };
        let observer = SessionConnectionObserver {
            actor: state.actor.clone(),
            epoch,
        };
        match Connection::start_answerer(
            connection_id,
            state.factory.clone(),
            state.signaling.clone(),
            connection_config,
            offer,
            Box::new(observer),
        ) {
            Ok(connection) => {
                state.active = Some(ActiveSession {
                    connection,
                    peer_connection: None,
                });
            }
            Err(err) => Self::attempt_failed(state, err),
        }
    }

    fn on_handshake_connected(state: &mut State, epoch: u64, transport: ConnectedTransport) {
        if state.epoch != epoch {
            return;
        }
        if let Some(active) = &mut state.active {
            active.peer_connection = Some(transport.peer_connection.clone());
        }
        state.retry.reset();
        Self::set_state(state, SessionState::Connected);
        info!("durable connection: connected");
        state.observer.handle_connected();

        // Re-create the locally declared channels on the new peer
        // connection. Remote ones re-attach from announcements as they
        // arrive.
        let locally_created: Vec<(String, DurableChannel)> = state
            .channels
            .iter()
            .filter(|(_, entry)| entry.locally_created)
            .map(|(label, entry)| (label.clone(), entry.channel.clone()))
            .collect();
        for (label, channel) in locally_created {
            Self::open_underlying_channel(state, &label, &channel);
        }
    }

    fn open_underlying_channel(state: &mut State, label: &str, channel: &DurableChannel) {
        let peer_connection = match state
            .active
            .as_ref()
            .and_then(|active| active.peer_connection.clone())
        {
            Some(peer_connection) => peer_connection,
            None => return,
        };
        match peer_connection.create_data_channel(label, channel.config().data_channel_init()) {
            Ok(underlying) => channel.attach(underlying),
            Err(err) => warn!(
                "durable connection: unable to open channel {:?}: {}",
                label, err
            ),
        }
    }

    fn on_incoming_channel(state: &mut State, epoch: u64, underlying: Arc<dyn DataChannel>) {
        if state.epoch != epoch {
            return;
        }
        let label = underlying.label();
        match state.channels.get(&label) {
            Some(entry) => entry.channel.attach(underlying),
            None => {
                debug!("durable connection: auto-creating channel {:?}", label);
                let channel = DurableChannel::new(&label, state.config.channel.clone());
                Self::register_channel(state, label, channel.clone(), false);
                // Announce before attaching, so the application's
                // observer is installed before the first inbound
                // message can be delivered.
                state.observer.handle_channel_added(channel.clone());
                channel.attach(underlying);
            }
        }
    }

    fn register_channel(
        state: &mut State,
        label: String,
        channel: DurableChannel,
        locally_created: bool,
    ) {
        if let Ok(mut shared) = state.shared.lock() {
            shared
                .channels
                .entry(label.clone())
                .or_insert_with(|| channel.clone());
        }
        let entry = ChannelEntry {
            channel: channel.clone(),
            locally_created,
        };
        state.channels.insert(label.clone(), entry);
        if locally_created && state.state == SessionState::Connected {
            Self::open_underlying_channel(state, &label, &channel);
        }
    }

    fn on_handshake_failed(state: &mut State, epoch: u64, error: anyhow::Error) {
        if state.epoch != epoch {
            return;
        }
        Self::attempt_failed(state, error);
    }

    // ---- reconnection ----

    fn attempt_failed(state: &mut State, error: anyhow::Error) {
        if state.state == SessionState::Closed || state.state == SessionState::Failed {
            return;
        }
        warn!("durable connection: attempt failed: {}", error);

        // Channels keep their queues; the dead peer connection goes.
        for entry in state.channels.values() {
            entry.channel.detach();
        }
        if let Some(active) = state.active.take() {
            active.connection.close();
        }
        state.observer.handle_failed(error, false);

        match state.retry.next_delay() {
            Some((delay, generation)) => {
                debug!("durable connection: reconnecting in {:?}", delay);
                Self::set_state(state, SessionState::Reconnecting);
                state.actor.send_delayed(delay, move |state| {
                    if state.retry.is_current(generation)
                        && state.state == SessionState::Reconnecting
                    {
                        Self::connect_attempt(state);
                    }
                });
            }
            None => {
                let attempts = state.config.max_reconnect_attempts;
                Self::set_state(state, SessionState::Failed);
                state
                    .observer
                    .handle_failed(ClientError::ReconnectExhausted(attempts).into(), true);
            }
        }
    }

    fn close_inner(state: &mut State) {
        if state.state != SessionState::Closed {
            state.epoch += 1;
            state.retry.cancel();
            if let Some(active) = state.active.take() {
                active.connection.close();
            }
            for (_, entry) in state.channels.drain() {
                entry.channel.close();
            }
            if let Ok(mut shared) = state.shared.lock() {
                shared.channels.clear();
            }
            Self::set_state(state, SessionState::Closed);
        }
        state.actor.stopper().stop_all_without_joining();
    }
}

/// Routes handshake events into the session actor, tagged with the
/// attempt epoch that created the handshake.
struct SessionConnectionObserver {
    actor: Actor<State>,
    epoch: u64,
}

impl ConnectionObserver for SessionConnectionObserver {
    fn handle_incoming_channel(
        &self,
        _connection_id: ConnectionId,
        data_channel: Arc<dyn DataChannel>,
    ) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| State::on_incoming_channel(state, epoch, data_channel));
    }

    fn handle_connected(&self, _connection_id: ConnectionId, transport: ConnectedTransport) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| State::on_handshake_connected(state, epoch, transport));
    }

    fn handle_failed(&self, _connection_id: ConnectionId, error: anyhow::Error) {
        let epoch = self.epoch;
        self.actor
            .send(move |state| State::on_handshake_failed(state, epoch, error));
    }
}
