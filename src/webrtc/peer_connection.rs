//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The peer-connection surface this library needs from a WebRTC
//! implementation.
//!
//! Async operations (offer/answer creation, description application)
//! complete via boxed handlers so the capability stays free of any
//! particular executor; the `native` implementation bridges these onto
//! the `webrtc` crate, the `sim` implementation completes them inline.

use std::{fmt, sync::Arc};

use crate::{
    common::Result,
    webrtc::{
        data_channel::{DataChannel, DataChannelInit},
        ice_candidate::IceCandidate,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp,
        }
    }
}

/// Connection states of the underlying peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type BoxedDescriptionHandler = Box<dyn FnOnce(Result<SessionDescription>) + Send>;
pub type BoxedCompletionHandler = Box<dyn FnOnce(Result<()>) + Send>;

pub trait PeerConnection: Send + Sync {
    fn create_offer(&self, done: BoxedDescriptionHandler);
    fn create_answer(&self, done: BoxedDescriptionHandler);
    fn set_local_description(&self, description: SessionDescription, done: BoxedCompletionHandler);
    fn set_remote_description(&self, description: SessionDescription, done: BoxedCompletionHandler);
    fn add_ice_candidate(&self, candidate: IceCandidate, done: BoxedCompletionHandler);
    fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>>;
    fn local_description(&self) -> Option<SessionDescription>;
    fn connection_state(&self) -> ConnectionState;
    fn close(&self);
}
