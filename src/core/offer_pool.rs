//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Maintains a target number of outstanding offers, polls the server
//! for answers in one batch, dispatches answered offers, and refills
//! the consumed slots.
//!
//! At-most-once dispatch: the pool entry is removed from the map
//! before `handle_answered` runs, so a concurrent poll tick can never
//! observe a half-consumed entry. Refill failures are reported through
//! `handle_error` and leave the pool running.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    common::{
        actor::{Actor, Stopper},
        ConnectionId, OfferId, PeerId, Result, ServerTimestamp,
    },
    core::{
        connection::{
            ConnectedTransport, Connection, ConnectionConfig, ConnectionObserver,
        },
        sync::NamedMutex,
    },
    lite::signaling::{AnswerRecord, OfferRecord, SignalingClient},
    webrtc::peer_connection_factory::PeerConnectionFactory,
};

#[derive(Clone)]
pub struct OfferPoolConfig {
    /// Target number of concurrently outstanding offers.
    pub pool_size: usize,
    pub polling_interval: Duration,
    pub offer_ttl: Duration,
    /// Heartbeat when an offer has consumed this fraction short of its
    /// TTL (0.2 means refresh at 80% of the TTL).
    pub ttl_refresh_margin: f64,
    pub connection: ConnectionConfig,
}

impl Default for OfferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            polling_interval: Duration::from_millis(2000),
            offer_ttl: Duration::from_millis(300_000),
            ttl_refresh_margin: 0.2,
            connection: ConnectionConfig::default(),
        }
    }
}

/// An offer consumed by an answerer. Ownership of the still-running
/// handshake transfers to the observer with this value.
pub struct AnsweredOffer {
    pub offer_id: OfferId,
    pub answerer_peer_id: PeerId,
    pub answered_at: ServerTimestamp,
    pub connection: Connection,
}

pub trait OfferPoolObserver: Send + Sync {
    /// Invoked at most once per offer id, after the entry left the pool.
    fn handle_answered(&self, answered: AnsweredOffer);
    /// The handshake behind an answered offer reached `Connected`.
    fn handle_connected(&self, connection_id: ConnectionId, transport: ConnectedTransport) {
        let _ = (connection_id, transport);
    }
    /// The remote peer announced an additional data channel on an
    /// answered connection.
    fn handle_incoming_channel(
        &self,
        connection_id: ConnectionId,
        data_channel: Arc<dyn crate::webrtc::data_channel::DataChannel>,
    ) {
        let _ = (connection_id, data_channel);
    }
    /// The handshake behind an already-answered offer died (transport
    /// loss, timeout). The pool no longer tracks it; the owner decides
    /// what to do with the session.
    fn handle_connection_failed(&self, connection_id: ConnectionId, error: anyhow::Error) {
        let _ = (connection_id, error);
    }
    /// Poll and refill problems. The pool keeps running.
    fn handle_error(&self, error: anyhow::Error, context: &'static str) {
        let _ = (error, context);
    }
}

#[derive(Clone)]
pub struct OfferPool {
    actor: Actor<State>,
    shared: Arc<NamedMutex<PoolShared>>,
}

struct PoolShared {
    offer_ids: Vec<OfferId>,
    running: bool,
}

struct PoolEntry {
    connection: Connection,
    /// When the current server-side TTL started counting.
    refreshed_at: Instant,
}

struct State {
    config: OfferPoolConfig,
    signaling: SignalingClient,
    factory: Arc<dyn PeerConnectionFactory>,
    observer: Arc<dyn OfferPoolObserver>,
    shared: Arc<NamedMutex<PoolShared>>,

    /// Published, unanswered offers.
    entries: HashMap<OfferId, PoolEntry>,
    /// Slots whose offer is still being created/posted.
    pending: HashMap<ConnectionId, Connection>,

    answer_watermark: ServerTimestamp,
    running: bool,
    epoch: u64,

    actor: Actor<State>,
}

impl OfferPool {
    pub fn new(
        signaling: SignalingClient,
        factory: Arc<dyn PeerConnectionFactory>,
        config: OfferPoolConfig,
        observer: Box<dyn OfferPoolObserver>,
    ) -> Result<Self> {
        let observer: Arc<dyn OfferPoolObserver> = observer.into();
        let shared = Arc::new(NamedMutex::new(
            PoolShared {
                offer_ids: Vec::new(),
                running: false,
            },
            "OfferPool::shared",
        ));
        let shared_for_actor = shared.clone();
        let actor = Actor::start("OfferPool", Stopper::new(), move |actor| {
            Ok(State {
                config,
                signaling,
                factory,
                observer,
                shared: shared_for_actor,
                entries: HashMap::new(),
                pending: HashMap::new(),
                answer_watermark: 0,
                running: false,
                epoch: 0,
                actor,
            })
        })?;
        Ok(Self { actor, shared })
    }

    pub fn start(&self) {
        self.actor.send(|state| {
            if state.running {
                return;
            }
            info!("offer pool: starting (target {})", state.config.pool_size);
            state.running = true;
            if let Ok(mut shared) = state.shared.lock() {
                shared.running = true;
            }
            State::tick(state);
        });
    }

    /// Cancels polling, closes the remaining handshakes, and
    /// best-effort deletes the outstanding offers from the server.
    pub fn stop(&self) {
        self.actor.send(State::stop_inner);
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .lock()
            .map(|shared| shared.running)
            .unwrap_or(false)
    }

    /// Ids of the currently outstanding offers.
    pub fn offer_ids(&self) -> Vec<OfferId> {
        self.shared
            .lock()
            .map(|shared| shared.offer_ids.clone())
            .unwrap_or_default()
    }

    pub fn active_offers(&self) -> usize {
        self.offer_ids().len()
    }

    /// Flushes the actor queue; test support.
    pub fn synchronize(&self) {
        self.actor.synchronize();
    }
}

impl State {
    fn publish_shared(state: &mut State) {
        if let Ok(mut shared) = state.shared.lock() {
            shared.offer_ids = state.entries.keys().cloned().collect();
            shared.running = state.running;
        }
    }

    fn tick(state: &mut State) {
        if !state.running {
            return;
        }
        let epoch = state.epoch;
        let actor = state.actor.clone();
        let since = state.answer_watermark;
        state.signaling.get_answers(
            since,
            Box::new(move |result| {
                actor.send(move |state| Self::on_answers(state, epoch, result));
            }),
        );

        Self::heartbeat_aging_offers(state);
        Self::refill(state);

        state
            .actor
            .send_delayed(state.config.polling_interval, move |state| {
                if state.epoch == epoch && state.running {
                    Self::tick(state);
                }
            });
    }

    fn on_answers(state: &mut State, epoch: u64, result: Result<Vec<AnswerRecord>>) {
        if state.epoch != epoch || !state.running {
            return;
        }
        let records = match result {
            Ok(records) => records,
            Err(err) => {
                state.observer.handle_error(err, "answer poll");
                return;
            }
        };
        for record in records {
            state.answer_watermark = state.answer_watermark.max(record.answered_at);
            // Remove before dispatch; a second answer for the same id
            // finds nothing and is ignored.
            let entry = match state.entries.remove(&record.offer_id) {
                Some(entry) => entry,
                None => {
                    debug!("offer pool: answer for unknown offer {}", record.offer_id);
                    continue;
                }
            };
            info!(
                "offer pool: offer {} answered by {}",
                record.offer_id, record.answerer_peer_id
            );
            let answered = AnsweredOffer {
                offer_id: record.offer_id.clone(),
                answerer_peer_id: record.answerer_peer_id.clone(),
                answered_at: record.answered_at,
                connection: entry.connection.clone(),
            };
            if let Err(err) = entry.connection.handle_answer(record) {
                state.observer.handle_error(err, "answer dispatch");
            }
            state.observer.handle_answered(answered);
        }
        Self::publish_shared(state);
        Self::refill(state);
    }

    /// Brings pending + published slots back up to the target. Each
    /// slot is created independently; one failure doesn't stop the rest.
    fn refill(state: &mut State) {
        if !state.running {
            return;
        }
        let active = state.entries.len() + state.pending.len();
        for _ in active..state.config.pool_size {
            Self::create_offer_slot(state);
        }
        Self::publish_shared(state);
    }

    fn create_offer_slot(state: &mut State) {
        let connection_id = crate::common::next_connection_id();
        let mut connection_config = state.config.connection.clone();
        connection_config.offer_ttl = Some(state.config.offer_ttl);
        let observer = PoolConnectionObserver {
            actor: state.actor.clone(),
            pool_observer: state.observer.clone(),
        };
        match Connection::start_offerer(
            connection_id,
            state.factory.clone(),
            state.signaling.clone(),
            connection_config,
            Box::new(observer),
        ) {
            Ok(connection) => {
                state.pending.insert(connection_id, connection);
            }
            Err(err) => state.observer.handle_error(err, "refill"),
        }
    }

    fn on_offer_published(state: &mut State, connection_id: ConnectionId, offer: OfferRecord) {
        let connection = match state.pending.remove(&connection_id) {
            Some(connection) => connection,
            None => return,
        };
        if !state.running {
            connection.close();
            return;
        }
        state.entries.insert(
            offer.id.clone(),
            PoolEntry {
                connection,
                refreshed_at: Instant::now(),
            },
        );
        Self::publish_shared(state);
    }

    fn on_connection_failed(
        state: &mut State,
        connection_id: ConnectionId,
        error: anyhow::Error,
    ) {
        let pending = state.pending.remove(&connection_id);
        let failed_offer = state
            .entries
            .iter()
            .find(|(_, entry)| entry.connection.connection_id() == connection_id)
            .map(|(offer_id, _)| offer_id.clone());
        match failed_offer {
            Some(offer_id) => {
                if let Some(entry) = state.entries.remove(&offer_id) {
                    entry.connection.close();
                }
                state.signaling.delete_offer(&offer_id, Box::new(|_| {}));
                state.observer.handle_error(error, "offer");
            }
            None => match pending {
                Some(connection) => {
                    connection.close();
                    state.observer.handle_error(error, "refill");
                }
                // Not ours anymore: an answered offer's handshake died.
                None => state
                    .observer
                    .handle_connection_failed(connection_id, error),
            },
        }
        // The empty slot is refilled on the next poll tick.
        Self::publish_shared(state);
    }

    /// Extends the server-side TTL of offers that have burned through
    /// `1 - ttl_refresh_margin` of it.
    fn heartbeat_aging_offers(state: &mut State) {
        let refresh_after = Duration::from_millis(
            (state.config.offer_ttl.as_millis() as f64 * (1.0 - state.config.ttl_refresh_margin))
                as u64,
        );
        let epoch = state.epoch;
        let due: Vec<OfferId> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.refreshed_at.elapsed() >= refresh_after)
            .map(|(offer_id, _)| offer_id.clone())
            .collect();
        for offer_id in due {
            if let Some(entry) = state.entries.get_mut(&offer_id) {
                entry.refreshed_at = Instant::now();
            }
            let actor = state.actor.clone();
            let offer_id_for_result = offer_id.clone();
            debug!("offer pool: heartbeat for offer {}", offer_id);
            state.signaling.heartbeat_offer(
                &offer_id,
                Box::new(move |result| {
                    if let Err(err) = result {
                        actor.send(move |state| {
                            if state.epoch == epoch {
                                warn!(
                                    "offer pool: heartbeat for {} failed",
                                    offer_id_for_result
                                );
                                state.observer.handle_error(err, "heartbeat");
                            }
                        });
                    }
                }),
            );
        }
    }

    fn stop_inner(state: &mut State) {
        if !state.running {
            state.actor.stopper().stop_all_without_joining();
            return;
        }
        info!("offer pool: stopping");
        state.running = false;
        state.epoch += 1;
        for (offer_id, entry) in state.entries.drain() {
            entry.connection.close();
            state.signaling.delete_offer(&offer_id, Box::new(|_| {}));
        }
        for (_, connection) in state.pending.drain() {
            connection.close();
        }
        Self::publish_shared(state);
        state.actor.stopper().stop_all_without_joining();
    }
}

/// Routes handshake events into the pool actor and through to the
/// pool's observer.
struct PoolConnectionObserver {
    actor: Actor<State>,
    pool_observer: Arc<dyn OfferPoolObserver>,
}

impl ConnectionObserver for PoolConnectionObserver {
    fn handle_offer_published(&self, connection_id: ConnectionId, offer: OfferRecord) {
        self.actor
            .send(move |state| State::on_offer_published(state, connection_id, offer));
    }

    fn handle_connected(&self, connection_id: ConnectionId, transport: ConnectedTransport) {
        self.pool_observer.handle_connected(connection_id, transport);
    }

    fn handle_incoming_channel(
        &self,
        connection_id: ConnectionId,
        data_channel: Arc<dyn crate::webrtc::data_channel::DataChannel>,
    ) {
        self.pool_observer
            .handle_incoming_channel(connection_id, data_channel);
    }

    fn handle_failed(&self, connection_id: ConnectionId, error: anyhow::Error) {
        self.actor
            .send(move |state| State::on_connection_failed(state, connection_id, error));
    }
}
