//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Factory for peer connections, plus the RTC configuration handed to
//! it. Two implementations exist: `webrtc::native` over the `webrtc`
//! crate and `webrtc::sim` for tests; one is selected at construction
//! of the durable layers.

use std::sync::Arc;

use crate::{
    common::Result,
    webrtc::{peer_connection::PeerConnection, peer_connection_observer::PeerConnectionObserver},
};

#[derive(Clone, Debug, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create_peer_connection(
        &self,
        config: &RtcConfig,
        observer: Box<dyn PeerConnectionObserver>,
    ) -> Result<Arc<dyn PeerConnection>>;
}
