//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The offerer-side service: signed publication, an offer pool sized
//! to taste, TTL-driven republication, and one durable channel per
//! accepted connection.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use crate::{
    common::{
        actor::{Actor, Stopper},
        unix_millis_now, ConnectionId, Result,
    },
    core::{
        channel::{ChannelConfig, DurableChannel},
        connection::{ConnectedTransport, Connection, ConnectionConfig},
        offer_pool::{AnsweredOffer, OfferPool, OfferPoolConfig, OfferPoolObserver},
        sync::NamedMutex,
    },
    error::ClientError,
    lite::{
        fqn::{validate_username, Fqn},
        identity::{publish_message, Identity, Keypair},
        signaling::{PublishServiceRequest, ServiceRecord, SignalingClient},
    },
    webrtc::peer_connection_factory::{PeerConnectionFactory, RtcConfig},
};

#[derive(Clone)]
pub struct DurableServiceConfig {
    pub username: String,
    pub service_fqn: String,
    /// Signs the publication message. Publication requires one.
    pub keypair: Option<Keypair>,
    pub is_public: bool,
    pub metadata: Option<serde_json::Value>,
    pub ttl: Duration,
    /// Republish when this fraction of the TTL remains.
    pub ttl_refresh_margin: f64,
    pub pool_size: usize,
    pub polling_interval: Duration,
    pub topics: Vec<String>,
    /// Label of the channel offered to every connecting peer.
    pub channel_label: String,
    pub channel: ChannelConfig,
    pub rtc_config: RtcConfig,
}

impl Default for DurableServiceConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            service_fqn: String::new(),
            keypair: None,
            is_public: false,
            metadata: None,
            ttl: Duration::from_millis(300_000),
            ttl_refresh_margin: 0.2,
            pool_size: 1,
            polling_interval: Duration::from_millis(2000),
            topics: Vec::new(),
            channel_label: "data".to_string(),
            channel: ChannelConfig::default(),
            rtc_config: RtcConfig::default(),
        }
    }
}

pub trait DurableServiceObserver: Send + Sync {
    fn handle_started(&self, service: ServiceRecord) {
        let _ = service;
    }
    /// A peer connected; its default channel is handed over. Install
    /// an observer before returning: the transport attaches right
    /// after this callback and messages start flowing.
    fn handle_connection(&self, connection_id: ConnectionId, channel: DurableChannel);
    /// The peer announced an additional channel on an existing
    /// connection.
    fn handle_channel_added(&self, connection_id: ConnectionId, channel: DurableChannel) {
        let _ = (connection_id, channel);
    }
    fn handle_connection_closed(&self, connection_id: ConnectionId) {
        let _ = connection_id;
    }
    fn handle_error(&self, error: anyhow::Error, context: &'static str) {
        let _ = (error, context);
    }
    fn handle_stopped(&self) {}
}

#[derive(Clone)]
pub struct DurableService {
    actor: Actor<State>,
    shared: Arc<NamedMutex<ServiceShared>>,
}

struct ServiceShared {
    running: bool,
    service: Option<ServiceRecord>,
}

struct ServiceConnection {
    connection: Connection,
    channels: Vec<DurableChannel>,
}

struct State {
    config: DurableServiceConfig,
    signaling: SignalingClient,
    factory: Arc<dyn PeerConnectionFactory>,
    identity: Arc<dyn Identity>,
    observer: Arc<dyn DurableServiceObserver>,
    shared: Arc<NamedMutex<ServiceShared>>,

    pool: Option<OfferPool>,
    connections: HashMap<ConnectionId, ServiceConnection>,
    running: bool,
    /// Guards the TTL refresh timer across stop/republish cycles.
    epoch: u64,

    actor: Actor<State>,
}

impl DurableService {
    pub fn new(
        signaling: SignalingClient,
        factory: Arc<dyn PeerConnectionFactory>,
        identity: Arc<dyn Identity>,
        config: DurableServiceConfig,
        observer: Box<dyn DurableServiceObserver>,
    ) -> Result<Self> {
        Fqn::parse(&config.service_fqn)?;
        validate_username(&config.username)?;
        if config.keypair.is_none() {
            return Err(ClientError::Validation(
                "service publication requires a keypair".to_string(),
            )
            .into());
        }

        let observer: Arc<dyn DurableServiceObserver> = observer.into();
        let shared = Arc::new(NamedMutex::new(
            ServiceShared {
                running: false,
                service: None,
            },
            "DurableService::shared",
        ));
        let shared_for_actor = shared.clone();
        let actor = Actor::start("DurableService", Stopper::new(), move |actor| {
            Ok(State {
                config,
                signaling,
                factory,
                identity,
                observer,
                shared: shared_for_actor,
                pool: None,
                connections: HashMap::new(),
                running: false,
                epoch: 0,
                actor,
            })
        })?;
        Ok(Self { actor, shared })
    }

    /// Publishes the service and starts accepting connections.
    pub fn start(&self) {
        self.actor.send(|state| {
            if state.running {
                return;
            }
            state.running = true;
            if let Ok(mut shared) = state.shared.lock() {
                shared.running = true;
            }
            State::publish(state);
        });
    }

    pub fn stop(&self) {
        self.actor.send(State::stop_inner);
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .lock()
            .map(|shared| shared.running)
            .unwrap_or(false)
    }

    /// The most recent publication record (uuid and friends).
    pub fn service(&self) -> Option<ServiceRecord> {
        self.shared.lock().ok().and_then(|shared| shared.service.clone())
    }

    /// Flushes the actor queue; test support.
    pub fn synchronize(&self) {
        self.actor.synchronize();
    }
}

impl State {
    fn publish(state: &mut State) {
        let keypair = match &state.config.keypair {
            Some(keypair) => keypair.clone(),
            None => return,
        };
        let now = unix_millis_now();
        let message = publish_message(&state.config.username, &state.config.service_fqn, now);
        let signature = match state.identity.sign(&keypair.private_key, &message) {
            Ok(signature) => signature,
            Err(err) => {
                state.observer.handle_error(err, "publish");
                return Self::stop_inner(state);
            }
        };
        let request = PublishServiceRequest {
            fqn: state.config.service_fqn.clone(),
            metadata: state.config.metadata.clone(),
            is_public: state.config.is_public,
            ttl_millis: Some(state.config.ttl.as_millis() as u64),
            public_key: keypair.public_key,
            signature,
            message,
        };
        let epoch = state.epoch;
        let actor = state.actor.clone();
        info!(
            "durable service: publishing {} as {}",
            state.config.service_fqn, state.config.username
        );
        state.signaling.publish_service(
            &state.config.username,
            request,
            Box::new(move |result| {
                actor.send(move |state| Self::on_published(state, epoch, result));
            }),
        );
    }

    fn on_published(state: &mut State, epoch: u64, result: Result<ServiceRecord>) {
        if state.epoch != epoch || !state.running {
            return;
        }
        let service = match result {
            Ok(service) => service,
            Err(err) => {
                state.observer.handle_error(err, "publish");
                return Self::stop_inner(state);
            }
        };
        info!("durable service: published as {}", service.uuid);
        if let Ok(mut shared) = state.shared.lock() {
            shared.service = Some(service.clone());
        }
        state.observer.handle_started(service);

        let pool_config = OfferPoolConfig {
            pool_size: state.config.pool_size,
            polling_interval: state.config.polling_interval,
            offer_ttl: state.config.ttl,
            ttl_refresh_margin: state.config.ttl_refresh_margin,
            connection: ConnectionConfig {
                rtc_config: state.config.rtc_config.clone(),
                polling_interval: state.config.polling_interval,
                default_channel_label: Some(state.config.channel_label.clone()),
                channel_init: state.config.channel.data_channel_init(),
                topics: state.config.topics.clone(),
                ..ConnectionConfig::default()
            },
        };
        let pool_observer = ServicePoolObserver {
            actor: state.actor.clone(),
            observer: state.observer.clone(),
        };
        match OfferPool::new(
            state.signaling.clone(),
            state.factory.clone(),
            pool_config,
            Box::new(pool_observer),
        ) {
            Ok(pool) => {
                pool.start();
                state.pool = Some(pool);
            }
            Err(err) => {
                state.observer.handle_error(err, "pool");
                return Self::stop_inner(state);
            }
        }

        Self::arm_refresh_timer(state);
    }

    fn arm_refresh_timer(state: &mut State) {
        let refresh_after = Duration::from_millis(
            (state.config.ttl.as_millis() as f64 * (1.0 - state.config.ttl_refresh_margin)) as u64,
        );
        let epoch = state.epoch;
        state.actor.send_delayed(refresh_after, move |state| {
            if state.epoch == epoch && state.running {
                Self::refresh_publication(state);
            }
        });
    }

    /// Republishes by tearing the pool down and building a new one.
    /// Known limitation: an answer that lands between the delete and
    /// the re-create is lost; that answerer sees its normal answer
    /// timeout and retries.
    fn refresh_publication(state: &mut State) {
        info!("durable service: republishing before TTL expiry");
        state.epoch += 1;
        if let Some(pool) = state.pool.take() {
            pool.stop();
        }
        Self::publish(state);
    }

    fn on_answered(state: &mut State, answered: AnsweredOffer) {
        if !state.running {
            answered.connection.close();
            return;
        }
        debug!(
            "durable service: offer {} answered by {}",
            answered.offer_id, answered.answerer_peer_id
        );
        state.connections.insert(
            answered.connection.connection_id(),
            ServiceConnection {
                connection: answered.connection,
                channels: Vec::new(),
            },
        );
    }

    fn on_peer_connected(
        state: &mut State,
        connection_id: ConnectionId,
        transport: ConnectedTransport,
    ) {
        if !state.running {
            return;
        }
        let underlying = match transport.data_channel {
            Some(underlying) => underlying,
            None => {
                warn!(
                    "durable service: connection {} arrived without a channel",
                    connection_id
                );
                return;
            }
        };
        let channel = DurableChannel::new(&underlying.label(), state.config.channel.clone());
        if let Some(entry) = state.connections.get_mut(&connection_id) {
            entry.channels.push(channel.clone());
        }
        info!("durable service: connection {} is up", connection_id);
        // Announce before attaching, so the application's observer is
        // installed before the first inbound message can be delivered.
        state.observer.handle_connection(connection_id, channel.clone());
        channel.attach(underlying);
    }

    /// The connecting peer announced an extra channel beyond the
    /// default one; wrap it like any other.
    fn on_incoming_channel(
        state: &mut State,
        connection_id: ConnectionId,
        underlying: Arc<dyn crate::webrtc::data_channel::DataChannel>,
    ) {
        if !state.running {
            return;
        }
        let entry = match state.connections.get_mut(&connection_id) {
            Some(entry) => entry,
            None => return,
        };
        let label = underlying.label();
        if entry.channels.iter().any(|channel| channel.label() == label) {
            return;
        }
        let channel = DurableChannel::new(&label, state.config.channel.clone());
        entry.channels.push(channel.clone());
        state
            .observer
            .handle_channel_added(connection_id, channel.clone());
        channel.attach(underlying);
    }

    fn on_peer_failed(state: &mut State, connection_id: ConnectionId, error: anyhow::Error) {
        if let Some(entry) = state.connections.remove(&connection_id) {
            debug!(
                "durable service: connection {} lost: {}",
                connection_id, error
            );
            entry.connection.close();
            for channel in entry.channels {
                channel.close();
            }
            state.observer.handle_connection_closed(connection_id);
        }
    }

    fn stop_inner(state: &mut State) {
        if state.running {
            info!("durable service: stopping");
            state.running = false;
            state.epoch += 1;
            if let Some(pool) = state.pool.take() {
                pool.stop();
            }
            for (_, entry) in state.connections.drain() {
                entry.connection.close();
                for channel in entry.channels {
                    channel.close();
                }
            }
            if let Ok(mut shared) = state.shared.lock() {
                shared.running = false;
                shared.service = None;
            }
            state.observer.handle_stopped();
        }
        state.actor.stopper().stop_all_without_joining();
    }
}

/// Bridges pool events into the service actor.
struct ServicePoolObserver {
    actor: Actor<State>,
    observer: Arc<dyn DurableServiceObserver>,
}

impl OfferPoolObserver for ServicePoolObserver {
    fn handle_answered(&self, answered: AnsweredOffer) {
        self.actor.send(move |state| State::on_answered(state, answered));
    }

    fn handle_connected(&self, connection_id: ConnectionId, transport: ConnectedTransport) {
        self.actor
            .send(move |state| State::on_peer_connected(state, connection_id, transport));
    }

    fn handle_incoming_channel(
        &self,
        connection_id: ConnectionId,
        data_channel: Arc<dyn crate::webrtc::data_channel::DataChannel>,
    ) {
        self.actor
            .send(move |state| State::on_incoming_channel(state, connection_id, data_channel));
    }

    fn handle_connection_failed(&self, connection_id: ConnectionId, error: anyhow::Error) {
        self.actor
            .send(move |state| State::on_peer_failed(state, connection_id, error));
    }

    fn handle_error(&self, error: anyhow::Error, context: &'static str) {
        self.observer.handle_error(error, context);
    }
}
