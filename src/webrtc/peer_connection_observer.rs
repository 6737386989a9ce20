//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Events surfaced by a peer connection.
//!
//! The observer must be installed at construction time, before any
//! description is applied; that guarantees the ICE candidate listener
//! exists before gathering starts and the data-channel handler exists
//! before the remote description can announce one.

use std::sync::Arc;

use crate::webrtc::{
    data_channel::DataChannel, ice_candidate::IceCandidate, peer_connection::ConnectionState,
};

pub trait PeerConnectionObserver: Send + Sync {
    /// A locally gathered candidate ready to trickle to the peer.
    /// End-of-gathering is not reported.
    fn handle_ice_candidate(&self, candidate: IceCandidate);

    fn handle_connection_state_changed(&self, state: ConnectionState);

    /// An inbound data channel announced by the remote description.
    fn handle_data_channel(&self, data_channel: Arc<dyn DataChannel>);
}
