//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The simulation switchboard.
//!
//! All simulated endpoints and data channels live in one router. An
//! endpoint embeds its id in the SDP it produces, so when the opposite
//! side applies that SDP as a remote description the router can link
//! the pair. Once both sides hold a local and remote description and
//! at least one applied remote candidate, the pair is promoted to
//! `Connected`: channels are mirrored by label, the receiving side
//! gets `handle_data_channel`, and bytes route in order between linked
//! channels.
//!
//! Observer callbacks are always invoked after the router lock is
//! released, so a handler may call straight back into the router
//! (e.g. replying to a message from inside `handle_message`).

use std::{
    collections::HashMap,
    sync::Arc,
};

use bytes::Bytes;

use crate::{
    common::Result,
    core::sync::NamedMutex,
    error::ClientError,
    webrtc::{
        data_channel::{DataChannel, DataChannelInit, DataChannelObserver, DataChannelState},
        ice_candidate::IceCandidate,
        peer_connection::{ConnectionState, SdpType, SessionDescription},
        peer_connection_observer::PeerConnectionObserver,
        sim::data_channel::SimDataChannel,
    },
};

pub type EndpointId = u64;
pub type ChannelId = u64;

#[derive(Clone)]
pub struct Router {
    shared: Arc<NamedMutex<RouterState>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

struct RouterState {
    next_id: u64,
    endpoints: HashMap<EndpointId, Endpoint>,
    channels: HashMap<ChannelId, ChannelEntry>,
}

struct Endpoint {
    observer: Arc<dyn PeerConnectionObserver>,
    state: ConnectionState,
    local_description: Option<SessionDescription>,
    remote_endpoint: Option<EndpointId>,
    remote_candidates: Vec<String>,
    channels: Vec<ChannelId>,
    closed: bool,
}

struct ChannelEntry {
    endpoint_id: EndpointId,
    label: String,
    init: DataChannelInit,
    state: DataChannelState,
    observer: Option<Arc<dyn DataChannelObserver>>,
    peer_channel: Option<ChannelId>,
    /// Delivered bytes held until an observer is installed, the way a
    /// browser's task queue holds messages for a handler registered in
    /// the same turn.
    pending_inbound: Vec<Bytes>,
}

/// Deferred observer callbacks, dispatched with the lock released.
enum Event {
    ConnectionState(Arc<dyn PeerConnectionObserver>, ConnectionState),
    IceCandidate(Arc<dyn PeerConnectionObserver>, IceCandidate),
    IncomingChannel(Arc<dyn PeerConnectionObserver>, Arc<dyn DataChannel>),
    ChannelOpen(Arc<dyn DataChannelObserver>),
    ChannelMessage(Arc<dyn DataChannelObserver>, Bytes),
    ChannelClose(Arc<dyn DataChannelObserver>),
}

fn dispatch(events: Vec<Event>) {
    for event in events {
        match event {
            Event::ConnectionState(observer, state) => {
                observer.handle_connection_state_changed(state)
            }
            Event::IceCandidate(observer, candidate) => observer.handle_ice_candidate(candidate),
            Event::IncomingChannel(observer, channel) => observer.handle_data_channel(channel),
            Event::ChannelOpen(observer) => observer.handle_open(),
            Event::ChannelMessage(observer, data) => observer.handle_message(data),
            Event::ChannelClose(observer) => observer.handle_close(),
        }
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(NamedMutex::new(
                RouterState {
                    next_id: 1,
                    endpoints: HashMap::new(),
                    channels: HashMap::new(),
                },
                "sim::Router",
            )),
        }
    }

    pub(super) fn register_endpoint(
        &self,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> Result<EndpointId> {
        let mut state = self.shared.lock()?;
        let id = state.next_id;
        state.next_id += 1;
        state.endpoints.insert(
            id,
            Endpoint {
                observer,
                state: ConnectionState::New,
                local_description: None,
                remote_endpoint: None,
                remote_candidates: Vec::new(),
                channels: Vec::new(),
                closed: false,
            },
        );
        debug!("sim::Router: registered endpoint {}", id);
        Ok(id)
    }

    pub(super) fn describe_local(&self, id: EndpointId, sdp_type: SdpType) -> SessionDescription {
        let sdp = format!("v=0 sim {} endpoint:{}", sdp_type, id);
        SessionDescription {
            sdp_type,
            sdp,
        }
    }

    pub(super) fn set_local_description(
        &self,
        id: EndpointId,
        description: SessionDescription,
    ) -> Result<()> {
        let events = {
            let mut state = self.shared.lock()?;
            let endpoint = state
                .endpoints
                .get_mut(&id)
                .ok_or_else(|| ClientError::InvalidState {
                    operation: "set_local_description",
                    state: "closed".to_string(),
                })?;
            endpoint.local_description = Some(description);
            if endpoint.state == ConnectionState::New {
                endpoint.state = ConnectionState::Connecting;
            }
            let observer = endpoint.observer.clone();

            // Local gathering yields two host candidates immediately.
            let mut events = Vec::new();
            for n in 0..2u16 {
                let candidate = IceCandidate::new(
                    format!(
                        "candidate:sim-{}-{} 1 udp 2122260223 203.0.113.{} {} typ host",
                        id,
                        n,
                        id % 200 + 1,
                        40000 + n
                    ),
                    Some("0".to_string()),
                    Some(0),
                );
                events.push(Event::IceCandidate(observer.clone(), candidate));
            }
            events.extend(Self::maybe_connect(&mut state, id, self));
            events
        };
        dispatch(events);
        Ok(())
    }

    pub(super) fn set_remote_description(
        &self,
        id: EndpointId,
        description: &SessionDescription,
    ) -> Result<()> {
        let remote_id = parse_endpoint_id(&description.sdp).ok_or_else(|| {
            ClientError::Validation(format!("unintelligible sim sdp: {:?}", description.sdp))
        })?;
        let events = {
            let mut state = self.shared.lock()?;
            if !state.endpoints.contains_key(&remote_id) {
                return Err(ClientError::NotFound(format!(
                    "sim endpoint {} is gone",
                    remote_id
                ))
                .into());
            }
            let endpoint = state
                .endpoints
                .get_mut(&id)
                .ok_or_else(|| ClientError::InvalidState {
                    operation: "set_remote_description",
                    state: "closed".to_string(),
                })?;
            endpoint.remote_endpoint = Some(remote_id);
            if endpoint.state == ConnectionState::New {
                endpoint.state = ConnectionState::Connecting;
            }
            Self::maybe_connect(&mut state, id, self)
        };
        dispatch(events);
        Ok(())
    }

    pub(super) fn add_remote_candidate(&self, id: EndpointId, candidate: &str) -> Result<()> {
        let events = {
            let mut state = self.shared.lock()?;
            let endpoint = state
                .endpoints
                .get_mut(&id)
                .ok_or_else(|| ClientError::InvalidState {
                    operation: "add_ice_candidate",
                    state: "closed".to_string(),
                })?;
            endpoint.remote_candidates.push(candidate.to_string());
            Self::maybe_connect(&mut state, id, self)
        };
        dispatch(events);
        Ok(())
    }

    pub(super) fn create_channel(
        &self,
        endpoint_id: EndpointId,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>> {
        let (channel, events) = {
            let mut state = self.shared.lock()?;
            if !state.endpoints.contains_key(&endpoint_id) {
                return Err(ClientError::InvalidState {
                    operation: "create_data_channel",
                    state: "closed".to_string(),
                }
                .into());
            }
            let channel_id = state.next_id;
            state.next_id += 1;
            state.channels.insert(
                channel_id,
                ChannelEntry {
                    endpoint_id,
                    label: label.to_string(),
                    init,
                    state: DataChannelState::Connecting,
                    observer: None,
                    peer_channel: None,
                    pending_inbound: Vec::new(),
                },
            );
            if let Some(endpoint) = state.endpoints.get_mut(&endpoint_id) {
                endpoint.channels.push(channel_id);
            }
            let channel: Arc<dyn DataChannel> =
                Arc::new(SimDataChannel::new(self.clone(), channel_id));

            // Created on an already-connected pair: mirror right away.
            let events = match Self::connected_peer(&state, endpoint_id) {
                Some(peer_id) => Self::mirror_channels(&mut state, endpoint_id, peer_id, self),
                None => Vec::new(),
            };
            (channel, events)
        };
        dispatch(events);
        Ok(channel)
    }

    pub(super) fn endpoint_state(&self, id: EndpointId) -> ConnectionState {
        self.shared
            .lock()
            .ok()
            .and_then(|state| state.endpoints.get(&id).map(|e| e.state))
            .unwrap_or(ConnectionState::Closed)
    }

    pub(super) fn local_description(&self, id: EndpointId) -> Option<SessionDescription> {
        self.shared
            .lock()
            .ok()
            .and_then(|state| state.endpoints.get(&id).and_then(|e| e.local_description.clone()))
    }

    pub(super) fn close_endpoint(&self, id: EndpointId) {
        let events = {
            let mut state = match self.shared.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            let mut events = Vec::new();
            let peer_id = Self::connected_peer(&state, id);
            if let Some(endpoint) = state.endpoints.get_mut(&id) {
                endpoint.closed = true;
                endpoint.state = ConnectionState::Closed;
            }
            let own_channels: Vec<ChannelId> = state
                .endpoints
                .get(&id)
                .map(|e| e.channels.clone())
                .unwrap_or_default();
            for channel_id in own_channels {
                events.extend(Self::close_channel_entry(&mut state, channel_id, false));
            }
            // The surviving side of the pair observes a failure.
            if let Some(peer_id) = peer_id {
                events.extend(Self::fail_endpoint(&mut state, peer_id));
            }
            events
        };
        dispatch(events);
    }

    /// Test helper: severs every currently connected pair. Each side
    /// observes `Failed` and all channels close.
    pub fn sever_all(&self) {
        let connected: Vec<EndpointId> = match self.shared.lock() {
            Ok(state) => state
                .endpoints
                .iter()
                .filter(|(_, endpoint)| endpoint.state == ConnectionState::Connected)
                .map(|(id, _)| *id)
                .collect(),
            Err(_) => return,
        };
        for id in connected {
            self.sever(id);
        }
    }

    /// Test helper: severs the connected pair this endpoint belongs to,
    /// as a transport loss would. Both sides observe `Failed` and all
    /// their channels close.
    pub fn sever(&self, id: EndpointId) {
        let events = {
            let mut state = match self.shared.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            let mut events = Vec::new();
            let peer_id = Self::connected_peer(&state, id);
            events.extend(Self::fail_endpoint(&mut state, id));
            if let Some(peer_id) = peer_id {
                events.extend(Self::fail_endpoint(&mut state, peer_id));
            }
            events
        };
        dispatch(events);
    }

    pub(super) fn channel_label(&self, channel_id: ChannelId) -> String {
        self.shared
            .lock()
            .ok()
            .and_then(|state| state.channels.get(&channel_id).map(|c| c.label.clone()))
            .unwrap_or_default()
    }

    pub(super) fn channel_state(&self, channel_id: ChannelId) -> DataChannelState {
        self.shared
            .lock()
            .ok()
            .and_then(|state| state.channels.get(&channel_id).map(|c| c.state))
            .unwrap_or(DataChannelState::Closed)
    }

    pub(super) fn set_channel_observer(
        &self,
        channel_id: ChannelId,
        observer: Option<Arc<dyn DataChannelObserver>>,
    ) {
        let events = {
            let mut state = match self.shared.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            let mut events = Vec::new();
            if let Some(entry) = state.channels.get_mut(&channel_id) {
                entry.observer = observer;
                if let Some(observer) = entry.observer.clone() {
                    for data in entry.pending_inbound.drain(..) {
                        events.push(Event::ChannelMessage(observer.clone(), data));
                    }
                }
            }
            events
        };
        dispatch(events);
    }

    pub(super) fn send(&self, channel_id: ChannelId, data: &Bytes) -> Result<()> {
        let observer = {
            let mut state = self.shared.lock()?;
            let entry = state
                .channels
                .get(&channel_id)
                .ok_or(ClientError::ChannelClosed)?;
            if entry.state != DataChannelState::Open {
                return Err(
                    ClientError::DataChannelSend(format!("channel is {}", entry.state)).into(),
                );
            }
            let peer_id = entry
                .peer_channel
                .ok_or_else(|| ClientError::DataChannelSend("no linked peer".to_string()))?;
            let peer = state
                .channels
                .get_mut(&peer_id)
                .ok_or_else(|| ClientError::DataChannelSend("peer channel gone".to_string()))?;
            match peer.observer.clone() {
                Some(observer) => Some(observer),
                None => {
                    peer.pending_inbound.push(data.clone());
                    None
                }
            }
        };
        if let Some(observer) = observer {
            observer.handle_message(data.clone());
        }
        Ok(())
    }

    pub(super) fn close_channel(&self, channel_id: ChannelId) {
        let events = {
            let mut state = match self.shared.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            Self::close_channel_entry(&mut state, channel_id, true)
        };
        dispatch(events);
    }

    fn connected_peer(state: &RouterState, id: EndpointId) -> Option<EndpointId> {
        let endpoint = state.endpoints.get(&id)?;
        if endpoint.state != ConnectionState::Connected {
            return None;
        }
        endpoint.remote_endpoint
    }

    fn maybe_connect(state: &mut RouterState, id: EndpointId, router: &Router) -> Vec<Event> {
        let peer_id = match state.endpoints.get(&id).and_then(|e| e.remote_endpoint) {
            Some(peer_id) => peer_id,
            None => return Vec::new(),
        };
        let ready = |endpoint: Option<&Endpoint>, expected_peer: EndpointId| {
            endpoint.is_some_and(|e| {
                !e.closed
                    && e.state != ConnectionState::Connected
                    && e.local_description.is_some()
                    && e.remote_endpoint == Some(expected_peer)
                    && !e.remote_candidates.is_empty()
            })
        };
        if !ready(state.endpoints.get(&id), peer_id) || !ready(state.endpoints.get(&peer_id), id) {
            return Vec::new();
        }

        let mut events = Vec::new();
        for endpoint_id in [id, peer_id] {
            if let Some(endpoint) = state.endpoints.get_mut(&endpoint_id) {
                endpoint.state = ConnectionState::Connected;
                events.push(Event::ConnectionState(
                    endpoint.observer.clone(),
                    ConnectionState::Connected,
                ));
            }
        }
        events.extend(Self::mirror_channels(state, id, peer_id, router));
        events.extend(Self::mirror_channels(state, peer_id, id, router));
        events
    }

    /// Gives every unlinked channel on `from` a peer channel on `to`,
    /// announces it to `to`, and opens both ends.
    fn mirror_channels(
        state: &mut RouterState,
        from: EndpointId,
        to: EndpointId,
        router: &Router,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        let unlinked: Vec<ChannelId> = state
            .endpoints
            .get(&from)
            .map(|e| {
                e.channels
                    .iter()
                    .copied()
                    .filter(|channel_id| {
                        state
                            .channels
                            .get(channel_id)
                            .is_some_and(|c| c.peer_channel.is_none() && c.state == DataChannelState::Connecting)
                    })
                    .collect()
            })
            .unwrap_or_default();

        for channel_id in unlinked {
            let (label, init) = match state.channels.get(&channel_id) {
                Some(entry) => (entry.label.clone(), entry.init.clone()),
                None => continue,
            };
            let mirror_id = state.next_id;
            state.next_id += 1;
            state.channels.insert(
                mirror_id,
                ChannelEntry {
                    endpoint_id: to,
                    label,
                    init,
                    state: DataChannelState::Open,
                    observer: None,
                    peer_channel: Some(channel_id),
                    pending_inbound: Vec::new(),
                },
            );
            if let Some(entry) = state.channels.get_mut(&channel_id) {
                entry.peer_channel = Some(mirror_id);
                entry.state = DataChannelState::Open;
                if let Some(observer) = entry.observer.clone() {
                    events.push(Event::ChannelOpen(observer));
                }
            }
            if let Some(endpoint) = state.endpoints.get_mut(&to) {
                endpoint.channels.push(mirror_id);
                let mirror: Arc<dyn DataChannel> =
                    Arc::new(SimDataChannel::new(router.clone(), mirror_id));
                events.push(Event::IncomingChannel(endpoint.observer.clone(), mirror));
            }
        }
        events
    }

    fn fail_endpoint(state: &mut RouterState, id: EndpointId) -> Vec<Event> {
        let mut events = Vec::new();
        let channels: Vec<ChannelId> = match state.endpoints.get_mut(&id) {
            Some(endpoint) if !endpoint.closed && endpoint.state != ConnectionState::Failed => {
                endpoint.state = ConnectionState::Failed;
                events.push(Event::ConnectionState(
                    endpoint.observer.clone(),
                    ConnectionState::Failed,
                ));
                endpoint.channels.clone()
            }
            _ => return events,
        };
        for channel_id in channels {
            // A real transport failure closes the channel on both ends.
            events.extend(Self::close_channel_entry(state, channel_id, true));
        }
        events
    }

    fn close_channel_entry(
        state: &mut RouterState,
        channel_id: ChannelId,
        notify_self: bool,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        let peer_id = match state.channels.get_mut(&channel_id) {
            Some(entry) if entry.state != DataChannelState::Closed => {
                entry.state = DataChannelState::Closed;
                if notify_self {
                    if let Some(observer) = entry.observer.clone() {
                        events.push(Event::ChannelClose(observer));
                    }
                }
                entry.peer_channel.take()
            }
            _ => return events,
        };
        if let Some(peer_id) = peer_id {
            if let Some(peer) = state.channels.get_mut(&peer_id) {
                if peer.state != DataChannelState::Closed {
                    peer.state = DataChannelState::Closed;
                    peer.peer_channel = None;
                    if let Some(observer) = peer.observer.clone() {
                        events.push(Event::ChannelClose(observer));
                    }
                }
            }
        }
        events
    }
}

fn parse_endpoint_id(sdp: &str) -> Option<EndpointId> {
    let marker = "endpoint:";
    let start = sdp.find(marker)? + marker.len();
    sdp[start..]
        .split_whitespace()
        .next()?
        .parse::<EndpointId>()
        .ok()
}
