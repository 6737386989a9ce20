//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulation peer connection and factory.
//!
//! Completion handlers run inline; the router promotes a pair to
//! `Connected` as soon as both sides have exchanged descriptions and
//! at least one candidate each.

use std::sync::Arc;

use crate::{
    common::Result,
    webrtc::{
        data_channel::{DataChannel, DataChannelInit},
        ice_candidate::IceCandidate,
        peer_connection::{
            BoxedCompletionHandler, BoxedDescriptionHandler, ConnectionState, PeerConnection,
            SdpType, SessionDescription,
        },
        peer_connection_factory::{PeerConnectionFactory, RtcConfig},
        peer_connection_observer::PeerConnectionObserver,
        sim::router::{EndpointId, Router},
    },
};

pub struct SimPeerConnection {
    router: Router,
    endpoint_id: EndpointId,
}

impl SimPeerConnection {
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }
}

impl PeerConnection for SimPeerConnection {
    fn create_offer(&self, done: BoxedDescriptionHandler) {
        done(Ok(self.router.describe_local(self.endpoint_id, SdpType::Offer)));
    }

    fn create_answer(&self, done: BoxedDescriptionHandler) {
        done(Ok(self.router.describe_local(self.endpoint_id, SdpType::Answer)));
    }

    fn set_local_description(&self, description: SessionDescription, done: BoxedCompletionHandler) {
        done(self.router.set_local_description(self.endpoint_id, description));
    }

    fn set_remote_description(
        &self,
        description: SessionDescription,
        done: BoxedCompletionHandler,
    ) {
        done(self.router.set_remote_description(self.endpoint_id, &description));
    }

    fn add_ice_candidate(&self, candidate: IceCandidate, done: BoxedCompletionHandler) {
        done(self
            .router
            .add_remote_candidate(self.endpoint_id, &candidate.candidate));
    }

    fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>> {
        self.router.create_channel(self.endpoint_id, label, init)
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.router.local_description(self.endpoint_id)
    }

    fn connection_state(&self) -> ConnectionState {
        self.router.endpoint_state(self.endpoint_id)
    }

    fn close(&self) {
        self.router.close_endpoint(self.endpoint_id);
    }
}

#[derive(Clone, Default)]
pub struct SimPeerConnectionFactory {
    router: Router,
}

impl SimPeerConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The switchboard, for tests that need to sever pairs.
    pub fn router(&self) -> &Router {
        &self.router
    }
}

impl PeerConnectionFactory for SimPeerConnectionFactory {
    fn create_peer_connection(
        &self,
        _config: &RtcConfig,
        observer: Box<dyn PeerConnectionObserver>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let endpoint_id = self.router.register_endpoint(observer.into())?;
        Ok(Arc::new(SimPeerConnection {
            router: self.router.clone(),
            endpoint_id,
        }))
    }
}
