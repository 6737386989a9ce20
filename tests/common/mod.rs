//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common test utilities: an in-memory rendezvous server implementing
//! the HTTP capability, plus blocking helpers for the callback APIs.
//!
//! Requires the 'sim' feature.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{mpsc, Arc, Mutex, OnceLock},
    time::{Duration, Instant},
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde_json::{json, Value};

use rendezvous_rtc::{
    common::Result,
    lite::{
        http,
        identity::{Ed25519Identity, Identity},
        signaling::{Credential, SignalingClient},
    },
};

pub const BASE_URL: &str = "http://rendezvous.test";

pub fn test_init() {
    let filter = if std::env::var("DEBUG_TESTS").is_ok() {
        "debug"
    } else {
        "error"
    };
    let _ = env_logger::Builder::new()
        .parse_filters(filter)
        .is_test(true)
        .try_init();
}

/// Deterministic randomness for test payloads and names. Set
/// RANDOM_SEED to reproduce a run.
pub struct Prng {
    rng: Mutex<ChaCha20Rng>,
}

impl Prng {
    fn from_env() -> Self {
        let seed = std::env::var("RANDOM_SEED")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        println!("*** Using random seed: {}", seed);
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }

    pub fn gen<T>(&self) -> T
    where
        rand::distributions::Standard: rand::distributions::Distribution<T>,
    {
        self.rng.lock().unwrap().gen()
    }
}

pub fn prng() -> &'static Prng {
    static PRNG: OnceLock<Prng> = OnceLock::new();
    PRNG.get_or_init(Prng::from_env)
}

/// Spins until `condition` holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Turns one callback-completed operation into a blocking call.
pub fn wait_for<T: Send + 'static>(
    run: impl FnOnce(Box<dyn FnOnce(Result<T>) + Send>),
) -> Result<T> {
    let (sender, receiver) = mpsc::channel();
    run(Box::new(move |result| {
        let _ = sender.send(result);
    }));
    match receiver.recv_timeout(Duration::from_secs(5)) {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("no completion within 5s")),
    }
}

pub fn register(client: &SignalingClient) -> Credential {
    wait_for(|done| client.register(done)).expect("register")
}

struct ServerOffer {
    id: String,
    owner_peer: String,
    sdp: String,
    topics: Vec<String>,
    created_at: u64,
    expires_at: u64,
    answered: Option<AnsweredBy>,
}

struct AnsweredBy {
    answerer_peer: String,
    sdp: String,
    answered_at: u64,
}

struct ServerCandidate {
    candidate: String,
    sdp_mid: Option<String>,
    sdp_mline_index: Option<u16>,
    role: String,
    peer_id: String,
    created_at: u64,
}

struct ServerService {
    uuid: String,
    username: String,
    fqn: String,
    owner_peer: String,
    is_public: bool,
    metadata: Value,
    created_at: u64,
}

#[derive(Default)]
struct ServerState {
    clock: u64,
    next_peer: u32,
    next_offer: u32,
    next_service: u32,
    credentials: HashMap<String, String>,
    offers: Vec<ServerOffer>,
    candidates: HashMap<String, Vec<ServerCandidate>>,
    usernames: HashMap<String, String>,
    services: Vec<ServerService>,
    fail_transport: bool,
}

impl ServerState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn current_offer_for_peer(&self, owner_peer: &str) -> Option<&ServerOffer> {
        self.offers
            .iter()
            .filter(|offer| offer.owner_peer == owner_peer && offer.answered.is_none())
            .min_by_key(|offer| offer.created_at)
    }
}

/// The rendezvous server's semantics behind the `http::Client`
/// capability; requests complete synchronously on the caller's thread.
#[derive(Clone)]
pub struct RendezvousServer {
    state: Arc<Mutex<ServerState>>,
    identity: Ed25519Identity,
}

impl RendezvousServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::default())),
            identity: Ed25519Identity,
        }
    }

    pub fn client(&self) -> SignalingClient {
        SignalingClient::new(Arc::new(self.clone()), BASE_URL)
    }

    pub fn set_fail_transport(&self, fail: bool) {
        self.state.lock().unwrap().fail_transport = fail;
    }

    pub fn unanswered_offer_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .offers
            .iter()
            .filter(|offer| offer.answered.is_none())
            .map(|offer| offer.id.clone())
            .collect()
    }

    pub fn answered_offer_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .offers
            .iter()
            .filter(|offer| offer.answered.is_some())
            .map(|offer| offer.id.clone())
            .collect()
    }

    pub fn delete_all_offers(&self) {
        self.state.lock().unwrap().offers.clear();
    }

    fn authenticate(state: &ServerState, headers: &HashMap<String, String>) -> Option<String> {
        let value = headers.get("Authorization")?;
        let token = value.strip_prefix("Bearer ")?;
        let (peer_id, secret) = token.split_once(':')?;
        match state.credentials.get(peer_id) {
            Some(expected) if expected == secret => Some(peer_id.to_string()),
            _ => None,
        }
    }

    fn handle(&self, request: &http::Request) -> (u16, Value) {
        let path_and_query = match request.url.strip_prefix(BASE_URL) {
            Some(rest) => rest,
            None => return (404, json!({"error": "unknown host"})),
        };
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, query),
            None => (path_and_query, ""),
        };
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let query: HashMap<String, String> = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        let body: Value = request
            .body
            .as_deref()
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
            .unwrap_or(Value::Null);

        let mut state = self.state.lock().unwrap();
        let auth = Self::authenticate(&state, &request.headers);

        use http::Method::*;
        match (request.method, segments.as_slice()) {
            (Post, ["register"]) => {
                state.next_peer += 1;
                let peer_id = format!("peer-{}", state.next_peer);
                let secret = format!("secret-{}", state.next_peer);
                state.credentials.insert(peer_id.clone(), secret.clone());
                (200, json!({"peerId": peer_id, "secret": secret}))
            }

            (Post, ["offers"]) => {
                let Some(peer) = auth else {
                    return (401, json!({"error": "credentials required"}));
                };
                let Some(specs) = body.get("offers").and_then(Value::as_array) else {
                    return (400, json!({"error": "offers array required"}));
                };
                let mut created = Vec::new();
                for spec in specs {
                    let Some(sdp) = spec.get("sdp").and_then(Value::as_str) else {
                        return (400, json!({"error": "sdp required"}));
                    };
                    let ttl = spec.get("ttl").and_then(Value::as_u64).unwrap_or(300_000);
                    let topics: Vec<String> = spec
                        .get("topics")
                        .and_then(Value::as_array)
                        .map(|topics| {
                            topics
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    state.next_offer += 1;
                    let created_at = state.tick();
                    let offer = ServerOffer {
                        id: format!("offer-{}", state.next_offer),
                        owner_peer: peer.clone(),
                        sdp: sdp.to_string(),
                        topics,
                        created_at,
                        expires_at: created_at + ttl,
                        answered: None,
                    };
                    created.push(offer_json(&offer));
                    state.offers.push(offer);
                }
                (200, json!({"offers": created}))
            }

            (Get, ["offers", "answers"]) => {
                let Some(peer) = auth else {
                    return (401, json!({"error": "credentials required"}));
                };
                let since: u64 = query.get("since").and_then(|v| v.parse().ok()).unwrap_or(0);
                let answers: Vec<Value> = state
                    .offers
                    .iter()
                    .filter(|offer| offer.owner_peer == peer)
                    .filter_map(|offer| {
                        offer.answered.as_ref().and_then(|answered| {
                            (answered.answered_at > since).then(|| {
                                json!({
                                    "offerId": offer.id,
                                    "answererPeerId": answered.answerer_peer,
                                    "sdp": answered.sdp,
                                    "answeredAt": answered.answered_at,
                                })
                            })
                        })
                    })
                    .collect();
                (200, json!({"answers": answers}))
            }

            (Get, ["offers", "mine"]) => {
                let Some(peer) = auth else {
                    return (401, json!({"error": "credentials required"}));
                };
                let offers: Vec<Value> = state
                    .offers
                    .iter()
                    .filter(|offer| offer.owner_peer == peer)
                    .map(offer_json)
                    .collect();
                (200, json!({"offers": offers}))
            }

            (Get, ["offers", "by-topic", topic]) => {
                let limit: usize = query
                    .get("limit")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10);
                let offers: Vec<Value> = state
                    .offers
                    .iter()
                    .filter(|offer| {
                        offer.answered.is_none() && offer.topics.iter().any(|t| t == topic)
                    })
                    .take(limit)
                    .map(offer_json)
                    .collect();
                (200, json!({"offers": offers}))
            }

            (Get, ["offers", id]) => {
                if auth.is_none() {
                    return (401, json!({"error": "credentials required"}));
                }
                match state.offers.iter().find(|offer| offer.id == *id) {
                    Some(offer) => (200, offer_json(offer)),
                    None => (404, json!({"error": "no such offer"})),
                }
            }

            (Delete, ["offers", id]) => {
                let Some(peer) = auth else {
                    return (401, json!({"error": "credentials required"}));
                };
                let before = state.offers.len();
                state
                    .offers
                    .retain(|offer| !(offer.id == *id && offer.owner_peer == peer));
                if state.offers.len() < before {
                    (200, json!({}))
                } else {
                    (404, json!({"error": "no such offer"}))
                }
            }

            (Put, ["offers", id, "heartbeat"]) => {
                let Some(peer) = auth else {
                    return (401, json!({"error": "credentials required"}));
                };
                let now = state.tick();
                match state
                    .offers
                    .iter_mut()
                    .find(|offer| offer.id == *id && offer.owner_peer == peer)
                {
                    Some(offer) => {
                        offer.expires_at = now + 300_000;
                        (200, json!({}))
                    }
                    None => (404, json!({"error": "no such offer"})),
                }
            }

            (Post, ["offers", id, "answer"]) => {
                let Some(peer) = auth else {
                    return (401, json!({"error": "credentials required"}));
                };
                let Some(sdp) = body.get("sdp").and_then(Value::as_str) else {
                    return (400, json!({"error": "sdp required"}));
                };
                let answered_at = state.tick();
                match state.offers.iter_mut().find(|offer| offer.id == *id) {
                    Some(offer) => {
                        if offer.answered.is_some() {
                            // First answer wins.
                            return (409, json!({"error": "already answered"}));
                        }
                        offer.answered = Some(AnsweredBy {
                            answerer_peer: peer,
                            sdp: sdp.to_string(),
                            answered_at,
                        });
                        (200, json!({"offerId": id}))
                    }
                    None => (404, json!({"error": "no such offer"})),
                }
            }

            (Post, ["offers", id, "ice-candidates"]) => {
                let Some(peer) = auth else {
                    return (401, json!({"error": "credentials required"}));
                };
                if !state.offers.iter().any(|offer| offer.id == *id) {
                    return (404, json!({"error": "no such offer"}));
                }
                let Some(candidates) = body.get("candidates").and_then(Value::as_array) else {
                    return (400, json!({"error": "candidates array required"}));
                };
                let mut new_records = Vec::new();
                for candidate in candidates {
                    let Some(payload) = candidate.get("candidate").and_then(Value::as_str) else {
                        return (400, json!({"error": "candidate required"}));
                    };
                    let created_at = state.tick();
                    new_records.push(ServerCandidate {
                        candidate: payload.to_string(),
                        sdp_mid: candidate
                            .get("sdpMid")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        sdp_mline_index: candidate
                            .get("sdpMLineIndex")
                            .and_then(Value::as_u64)
                            .map(|v| v as u16),
                        role: candidate
                            .get("role")
                            .and_then(Value::as_str)
                            .unwrap_or("offerer")
                            .to_string(),
                        peer_id: peer.clone(),
                        created_at,
                    });
                }
                state
                    .candidates
                    .entry(id.to_string())
                    .or_default()
                    .extend(new_records);
                (200, json!({}))
            }

            (Get, ["offers", id, "ice-candidates"]) => {
                if auth.is_none() {
                    return (401, json!({"error": "credentials required"}));
                }
                let since: u64 = query.get("since").and_then(|v| v.parse().ok()).unwrap_or(0);
                let candidates: Vec<Value> = state
                    .candidates
                    .get(*id)
                    .map(|records| {
                        records
                            .iter()
                            .filter(|record| record.created_at > since)
                            .map(|record| {
                                json!({
                                    "candidate": record.candidate,
                                    "sdpMid": record.sdp_mid,
                                    "sdpMLineIndex": record.sdp_mline_index,
                                    "role": record.role,
                                    "peerId": record.peer_id,
                                    "createdAt": record.created_at,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                (200, json!({"candidates": candidates}))
            }

            (Post, ["users", username]) => {
                if auth.is_none() {
                    return (401, json!({"error": "credentials required"}));
                }
                let (Some(public_key), Some(signature), Some(message)) = (
                    body.get("publicKey").and_then(Value::as_str),
                    body.get("signature").and_then(Value::as_str),
                    body.get("message").and_then(Value::as_str),
                ) else {
                    return (400, json!({"error": "publicKey, signature, message required"}));
                };
                if !message.starts_with(&format!("claim:{}:", username)) {
                    return (400, json!({"error": "bad claim message"}));
                }
                if !matches!(self.identity.verify(public_key, message, signature), Ok(true)) {
                    return (403, json!({"error": "bad signature"}));
                }
                if state.usernames.contains_key(*username) {
                    return (409, json!({"error": "username taken"}));
                }
                state
                    .usernames
                    .insert(username.to_string(), public_key.to_string());
                (200, json!({}))
            }

            (Get, ["users", username]) => match state.usernames.get(*username) {
                Some(public_key) => {
                    (200, json!({"available": false, "publicKey": public_key}))
                }
                None => (200, json!({"available": true})),
            },

            (Post, ["users", username, "services"]) => {
                let Some(peer) = auth else {
                    return (401, json!({"error": "credentials required"}));
                };
                let (Some(fqn), Some(public_key), Some(signature), Some(message)) = (
                    body.get("fqn").and_then(Value::as_str),
                    body.get("publicKey").and_then(Value::as_str),
                    body.get("signature").and_then(Value::as_str),
                    body.get("message").and_then(Value::as_str),
                ) else {
                    return (400, json!({"error": "fqn, publicKey, signature, message required"}));
                };
                match state.usernames.get(*username) {
                    Some(claimed_key) if claimed_key == public_key => {}
                    Some(_) => return (403, json!({"error": "key does not own username"})),
                    None => return (404, json!({"error": "username not claimed"})),
                }
                if !message.starts_with(&format!("publish:{}:{}:", username, fqn)) {
                    return (400, json!({"error": "bad publish message"}));
                }
                if !matches!(self.identity.verify(public_key, message, signature), Ok(true)) {
                    return (403, json!({"error": "bad signature"}));
                }
                state.next_service += 1;
                let created_at = state.tick();
                let service = ServerService {
                    uuid: format!("svc-{}", state.next_service),
                    username: username.to_string(),
                    fqn: fqn.to_string(),
                    owner_peer: peer,
                    is_public: body
                        .get("isPublic")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    metadata: body.get("metadata").cloned().unwrap_or(Value::Null),
                    created_at,
                };
                // Republication under the same name supersedes.
                let (username, fqn) = (service.username.clone(), service.fqn.clone());
                state
                    .services
                    .retain(|existing| !(existing.username == username && existing.fqn == fqn));
                let response = service_json(&state, &service);
                state.services.push(service);
                (200, response)
            }

            (Get, ["users", username, "services", fqn]) => {
                if auth.is_none() {
                    return (401, json!({"error": "credentials required"}));
                }
                match state
                    .services
                    .iter()
                    .find(|service| service.username == *username && service.fqn == *fqn)
                {
                    Some(service) => (200, service_json(&state, service)),
                    None => (404, json!({"error": "no such service"})),
                }
            }

            (Get, ["services", uuid]) => {
                if auth.is_none() {
                    return (401, json!({"error": "credentials required"}));
                }
                match state.services.iter().find(|service| service.uuid == *uuid) {
                    Some(service) => (200, service_json(&state, service)),
                    None => (404, json!({"error": "no such service"})),
                }
            }

            (Get, ["services"]) => {
                let limit: usize = query
                    .get("limit")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20);
                let offset: usize = query
                    .get("offset")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let services: Vec<Value> = state
                    .services
                    .iter()
                    .filter(|service| service.is_public)
                    .skip(offset)
                    .take(limit)
                    .map(|service| service_json(&state, service))
                    .collect();
                (200, json!({"services": services}))
            }

            _ => (404, json!({"error": format!("no route for {}", path)})),
        }
    }
}

impl Default for RendezvousServer {
    fn default() -> Self {
        Self::new()
    }
}

impl http::Client for RendezvousServer {
    fn send_request(&self, request: http::Request, callback: http::ResponseCallback) {
        if self.state.lock().unwrap().fail_transport {
            callback(None);
            return;
        }
        let (status_code, body) = self.handle(&request);
        callback(Some(http::Response {
            status_code,
            body: body.to_string().into_bytes(),
        }));
    }
}

fn offer_json(offer: &ServerOffer) -> Value {
    json!({
        "id": offer.id,
        "sdp": offer.sdp,
        "topics": offer.topics,
        "createdAt": offer.created_at,
        "expiresAt": offer.expires_at,
        "answererPeerId": offer.answered.as_ref().map(|a| a.answerer_peer.clone()),
        "answerSdp": offer.answered.as_ref().map(|a| a.sdp.clone()),
        "answeredAt": offer.answered.as_ref().map(|a| a.answered_at),
    })
}

fn service_json(state: &ServerState, service: &ServerService) -> Value {
    json!({
        "uuid": service.uuid,
        "username": service.username,
        "fqn": service.fqn,
        "metadata": service.metadata,
        "isPublic": service.is_public,
        "offerId": state
            .current_offer_for_peer(&service.owner_peer)
            .map(|offer| offer.id.clone()),
        "createdAt": service.created_at,
    })
}
