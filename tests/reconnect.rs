//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Durable connection reconnection: surviving a transport loss,
//! exhausting the backoff budget, and cancelling on close.

mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;

use rendezvous_rtc::{
    common::ConnectionId,
    core::{
        channel::{ChannelObserver, ChannelState, DurableChannel},
        durable_connection::{
            DurableConnection, DurableConnectionConfig, DurableConnectionObserver,
            ServiceAddress, SessionState,
        },
        durable_service::{DurableService, DurableServiceConfig, DurableServiceObserver},
    },
    lite::{
        identity::{claim_message, Ed25519Identity, Identity},
        signaling::SignalingClient,
    },
    webrtc::{
        peer_connection_factory::PeerConnectionFactory,
        sim::peer_connection::SimPeerConnectionFactory,
    },
};

use common::{register, test_init, wait_for, wait_until, RendezvousServer};

const FQN: &str = "com.example.echo@1.0.0";

#[derive(Clone, Default)]
struct LabeledLog {
    inner: Arc<Mutex<Vec<(String, Bytes)>>>,
}

impl LabeledLog {
    fn contains(&self, label: &str, payload: &[u8]) -> bool {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .any(|(seen_label, data)| seen_label == label && data.as_ref() == payload)
    }
}

impl ChannelObserver for LabeledLog {
    fn handle_message(&self, label: &str, data: Bytes) {
        self.inner.lock().unwrap().push((label.to_string(), data));
    }
}

#[derive(Clone, Default)]
struct ServiceEvents {
    inner: Arc<ServiceEventsInner>,
}

#[derive(Default)]
struct ServiceEventsInner {
    received: LabeledLog,
    connections: Mutex<Vec<ConnectionId>>,
    errors: Mutex<Vec<String>>,
}

impl ServiceEvents {
    fn received(&self) -> &LabeledLog {
        &self.inner.received
    }

    fn connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }
}

impl DurableServiceObserver for ServiceEvents {
    fn handle_connection(&self, connection_id: ConnectionId, channel: DurableChannel) {
        channel.set_observer(Box::new(self.inner.received.clone()));
        self.inner.connections.lock().unwrap().push(connection_id);
    }

    fn handle_channel_added(&self, _connection_id: ConnectionId, channel: DurableChannel) {
        channel.set_observer(Box::new(self.inner.received.clone()));
    }

    fn handle_error(&self, error: anyhow::Error, context: &'static str) {
        self.inner
            .errors
            .lock()
            .unwrap()
            .push(format!("{}: {}", context, error));
    }
}

#[derive(Clone, Default)]
struct SessionEvents {
    inner: Arc<SessionEventsInner>,
}

#[derive(Default)]
struct SessionEventsInner {
    states: Mutex<Vec<SessionState>>,
    transient_failures: Mutex<Vec<String>>,
    permanent_failures: Mutex<Vec<String>>,
}

impl SessionEvents {
    fn states(&self) -> Vec<SessionState> {
        self.inner.states.lock().unwrap().clone()
    }

    fn transient_count(&self) -> usize {
        self.inner.transient_failures.lock().unwrap().len()
    }

    fn permanent_count(&self) -> usize {
        self.inner.permanent_failures.lock().unwrap().len()
    }
}

impl DurableConnectionObserver for SessionEvents {
    fn handle_state_changed(&self, state: SessionState) {
        self.inner.states.lock().unwrap().push(state);
    }

    fn handle_failed(&self, error: anyhow::Error, permanent: bool) {
        let log = if permanent {
            &self.inner.permanent_failures
        } else {
            &self.inner.transient_failures
        };
        log.lock().unwrap().push(error.to_string());
    }
}

fn claim_alice(client: &SignalingClient) -> rendezvous_rtc::lite::identity::Keypair {
    let identity = Ed25519Identity;
    let keypair = identity.generate_keypair().unwrap();
    let message = claim_message("alice", rendezvous_rtc::common::unix_millis_now());
    let signature = identity.sign(&keypair.private_key, &message).unwrap();
    wait_for(|done| {
        client.claim_username("alice", &keypair.public_key, &signature, &message, done)
    })
    .unwrap();
    keypair
}

fn start_echo_service(
    server: &RendezvousServer,
    factory: Arc<dyn PeerConnectionFactory>,
) -> (DurableService, ServiceEvents) {
    let service_client = server.client();
    register(&service_client);
    let keypair = claim_alice(&service_client);

    let service_events = ServiceEvents::default();
    let service = DurableService::new(
        service_client,
        factory,
        Arc::new(Ed25519Identity),
        DurableServiceConfig {
            username: "alice".to_string(),
            service_fqn: FQN.to_string(),
            keypair: Some(keypair),
            polling_interval: Duration::from_millis(25),
            ttl: Duration::from_secs(300),
            ..DurableServiceConfig::default()
        },
        Box::new(service_events.clone()),
    )
    .unwrap();
    service.start();
    assert!(wait_until(Duration::from_secs(5), || {
        service.service().is_some() && !server.unanswered_offer_ids().is_empty()
    }));
    (service, service_events)
}

#[test]
fn session_survives_transport_loss() {
    test_init();
    let server = RendezvousServer::new();
    let sim = SimPeerConnectionFactory::new();
    let factory: Arc<dyn PeerConnectionFactory> = Arc::new(sim.clone());

    let (service, service_events) = start_echo_service(&server, factory.clone());

    let peer_client = server.client();
    register(&peer_client);
    let session_events = SessionEvents::default();
    let session = DurableConnection::new(
        ServiceAddress::Username {
            username: "alice".to_string(),
            service_fqn: FQN.to_string(),
        },
        peer_client,
        factory,
        DurableConnectionConfig {
            polling_interval: Duration::from_millis(25),
            reconnect_backoff_base: Duration::from_millis(25),
            reconnect_backoff_max: Duration::from_millis(50),
            reconnect_jitter: 0.0,
            connection_timeout: Duration::from_secs(3),
            ..DurableConnectionConfig::default()
        },
        Box::new(session_events.clone()),
    )
    .unwrap();

    // Declared before connect: attaches on the Connected transition.
    let chat = session.create_channel("chat", None).unwrap();
    chat.send(Bytes::from_static(b"hello-1")).unwrap();
    session.connect();

    assert!(wait_until(Duration::from_secs(5), || {
        session.state() == SessionState::Connected && chat.state() == ChannelState::Open
    }));
    assert_eq!(service_events.connection_count(), 1);
    assert!(wait_until(Duration::from_secs(5), || {
        service_events.received().contains("chat", b"hello-1")
    }));

    // Transport loss: the session reconnects, the channel queue
    // carries the message sent while down.
    sim.router().sever_all();
    assert!(wait_until(Duration::from_secs(5), || {
        session_events.states().contains(&SessionState::Reconnecting)
    }));
    chat.send(Bytes::from_static(b"hello-2")).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        session.state() == SessionState::Connected && service_events.connection_count() == 2
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        service_events.received().contains("chat", b"hello-2")
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        chat.state() == ChannelState::Open
    }));
    assert_eq!(session_events.permanent_count(), 0);

    let states = session_events.states();
    let connected_count = states
        .iter()
        .filter(|state| **state == SessionState::Connected)
        .count();
    assert_eq!(connected_count, 2);

    session.close();
    assert!(wait_until(Duration::from_secs(2), || {
        session.state() == SessionState::Closed
    }));
    service.stop();
}

#[test]
fn reconnect_budget_exhaustion_is_a_single_permanent_failure() {
    test_init();
    let server = RendezvousServer::new();
    let factory: Arc<dyn PeerConnectionFactory> = Arc::new(SimPeerConnectionFactory::new());

    let peer_client = server.client();
    register(&peer_client);
    let session_events = SessionEvents::default();
    // Nobody ever publishes this service; every attempt fails fast.
    let session = DurableConnection::new(
        ServiceAddress::Username {
            username: "nobody".to_string(),
            service_fqn: "com.example.ghost@1.0.0".to_string(),
        },
        peer_client,
        factory,
        DurableConnectionConfig {
            max_reconnect_attempts: 3,
            reconnect_backoff_base: Duration::from_millis(10),
            reconnect_backoff_max: Duration::from_millis(20),
            reconnect_jitter: 0.0,
            polling_interval: Duration::from_millis(25),
            connection_timeout: Duration::from_secs(1),
            ..DurableConnectionConfig::default()
        },
        Box::new(session_events.clone()),
    )
    .unwrap();
    session.connect();

    assert!(wait_until(Duration::from_secs(5), || {
        session.state() == SessionState::Failed
    }));
    assert_eq!(session_events.permanent_count(), 1);
    // The initial attempt plus exactly three reconnect attempts.
    assert_eq!(session_events.transient_count(), 4);

    // Exhausted means stopped: nothing further fires.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(session_events.permanent_count(), 1);
    assert_eq!(session_events.transient_count(), 4);
}

#[test]
fn close_during_reconnect_cancels_the_pending_attempt() {
    test_init();
    let server = RendezvousServer::new();
    let factory: Arc<dyn PeerConnectionFactory> = Arc::new(SimPeerConnectionFactory::new());

    let peer_client = server.client();
    register(&peer_client);
    let session_events = SessionEvents::default();
    let session = DurableConnection::new(
        ServiceAddress::Uuid("svc-missing".to_string()),
        peer_client,
        factory,
        DurableConnectionConfig {
            reconnect_backoff_base: Duration::from_millis(200),
            reconnect_backoff_max: Duration::from_millis(200),
            reconnect_jitter: 0.0,
            polling_interval: Duration::from_millis(25),
            connection_timeout: Duration::from_secs(1),
            ..DurableConnectionConfig::default()
        },
        Box::new(session_events.clone()),
    )
    .unwrap();
    session.connect();

    // First attempt fails; a backoff timer is now pending.
    assert!(wait_until(Duration::from_secs(2), || {
        session_events.transient_count() == 1
            && session.state() == SessionState::Reconnecting
    }));
    session.close();
    assert!(wait_until(Duration::from_secs(2), || {
        session.state() == SessionState::Closed
    }));

    // Well past the backoff delay: no further attempts fired.
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(session_events.transient_count(), 1);
    assert_eq!(session_events.permanent_count(), 0);
}
