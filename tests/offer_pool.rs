//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Offer pool behavior: at-most-once answer dispatch and transparent
//! refill of consumed slots.

mod common;

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use rendezvous_rtc::{
    common::next_connection_id,
    core::{
        connection::{ConnectedTransport, Connection, ConnectionConfig, ConnectionObserver},
        offer_pool::{AnsweredOffer, OfferPool, OfferPoolConfig, OfferPoolObserver},
    },
    webrtc::{
        peer_connection_factory::PeerConnectionFactory,
        sim::peer_connection::SimPeerConnectionFactory,
    },
};

use common::{prng, register, test_init, wait_for, wait_until, RendezvousServer};

#[derive(Clone, Default)]
struct PoolEvents {
    inner: Arc<PoolEventsInner>,
}

#[derive(Default)]
struct PoolEventsInner {
    answered: Mutex<Vec<AnsweredOffer>>,
}

impl PoolEvents {
    fn answered_ids(&self) -> Vec<String> {
        self.inner
            .answered
            .lock()
            .unwrap()
            .iter()
            .map(|answered| answered.offer_id.clone())
            .collect()
    }
}

impl OfferPoolObserver for PoolEvents {
    fn handle_answered(&self, answered: AnsweredOffer) {
        self.inner.answered.lock().unwrap().push(answered);
    }
}

#[derive(Clone, Default)]
struct QuietConnection;

impl ConnectionObserver for QuietConnection {
    fn handle_connected(&self, _connection_id: u64, _transport: ConnectedTransport) {}
    fn handle_failed(&self, _connection_id: u64, _error: anyhow::Error) {}
}

#[test]
fn consumed_slot_is_removed_then_refilled() {
    test_init();
    let server = RendezvousServer::new();
    let factory: Arc<dyn PeerConnectionFactory> = Arc::new(SimPeerConnectionFactory::new());

    let offerer_client = server.client();
    register(&offerer_client);
    let pool_events = PoolEvents::default();
    let pool = OfferPool::new(
        offerer_client.clone(),
        factory.clone(),
        OfferPoolConfig {
            pool_size: 3,
            polling_interval: Duration::from_millis(25),
            connection: ConnectionConfig {
                polling_interval: Duration::from_millis(25),
                topics: vec![format!("pool-{}", prng().gen::<u16>())],
                ..ConnectionConfig::default()
            },
            ..OfferPoolConfig::default()
        },
        Box::new(pool_events.clone()),
    )
    .unwrap();
    pool.start();

    assert!(wait_until(Duration::from_secs(5), || {
        server.unanswered_offer_ids().len() == 3
    }));
    let initial: HashSet<String> = server.unanswered_offer_ids().into_iter().collect();

    // One answerer consumes one offer.
    let answerer_client = server.client();
    register(&answerer_client);
    let target = initial.iter().next().unwrap().clone();
    let offer = wait_for(|done| answerer_client.get_offer(&target, done))
        .unwrap()
        .expect("target offer");
    let answerer = Connection::start_answerer(
        next_connection_id(),
        factory,
        answerer_client,
        ConnectionConfig {
            polling_interval: Duration::from_millis(25),
            ..ConnectionConfig::default()
        },
        offer,
        Box::new(QuietConnection),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        pool_events.answered_ids().len() == 1
    }));
    assert_eq!(pool_events.answered_ids(), vec![target.clone()]);

    // The pool refills to its target; the consumed id is gone and the
    // in-flight count never exceeds the target while it does.
    assert!(wait_until(Duration::from_secs(5), || {
        assert!(pool.active_offers() <= 3);
        let current = server.unanswered_offer_ids();
        current.len() == 3 && !current.contains(&target)
    }));

    // At most once: nothing further arrives for the same offer.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(pool_events.answered_ids().len(), 1);

    // stop() deletes the outstanding offers from the server.
    pool.stop();
    assert!(wait_until(Duration::from_secs(2), || {
        server.unanswered_offer_ids().is_empty()
    }));
    answerer.close();
}

#[test]
fn refill_errors_leave_the_pool_running() {
    test_init();
    let server = RendezvousServer::new();
    let factory: Arc<dyn PeerConnectionFactory> = Arc::new(SimPeerConnectionFactory::new());

    let offerer_client = server.client();
    register(&offerer_client);
    let errors: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    #[derive(Clone)]
    struct ErrorTracking {
        errors: Arc<Mutex<Vec<&'static str>>>,
    }
    impl OfferPoolObserver for ErrorTracking {
        fn handle_answered(&self, _answered: AnsweredOffer) {}
        fn handle_error(&self, _error: anyhow::Error, context: &'static str) {
            self.errors.lock().unwrap().push(context);
        }
    }

    let pool = OfferPool::new(
        offerer_client.clone(),
        factory,
        OfferPoolConfig {
            pool_size: 2,
            polling_interval: Duration::from_millis(25),
            connection: ConnectionConfig {
                polling_interval: Duration::from_millis(25),
                answer_timeout: Duration::from_millis(500),
                ..ConnectionConfig::default()
            },
            ..OfferPoolConfig::default()
        },
        Box::new(ErrorTracking {
            errors: errors.clone(),
        }),
    )
    .unwrap();

    // All HTTP down: offer creation fails, the pool reports and keeps
    // polling rather than crashing.
    server.set_fail_transport(true);
    pool.start();
    assert!(wait_until(Duration::from_secs(2), || {
        !errors.lock().unwrap().is_empty()
    }));
    assert!(pool.is_running());

    // Transport restored: the pool fills up on its own.
    server.set_fail_transport(false);
    assert!(wait_until(Duration::from_secs(5), || {
        server.unanswered_offer_ids().len() == 2
    }));
    pool.stop();
}
