//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! # Rendezvous RTC -- durable peer-to-peer data channels
//!
//! A client library for rendezvous-style WebRTC signaling: an offerer
//! advertises a service through an HTTP-polled rendezvous server, an
//! answerer discovers and answers it, and both ends keep a durable
//! logical channel alive across transport drops by re-signaling fresh
//! peer connections underneath it.
//!
//! The crate is capability-driven: HTTP ([`lite::http::Client`]),
//! crypto ([`lite::identity::Identity`]) and WebRTC
//! ([`webrtc::peer_connection_factory::PeerConnectionFactory`]) are
//! injected at construction. The `native` feature provides a WebRTC
//! implementation over the `webrtc` crate, `sim` an in-memory one for
//! tests, and `ureq` a default blocking HTTP client.

#[macro_use]
extern crate log;

pub mod common;

pub mod error;

/// Core, platform independent functionality.
pub mod core {
    pub mod backoff;
    pub mod buffer;
    pub mod channel;
    pub mod connection;
    pub mod durable_connection;
    pub mod durable_service;
    pub mod offer_pool;
    pub mod sync;
    pub mod util;
}

/// Boundary surfaces: the HTTP capability, the typed signaling client,
/// name grammar and the identity capability.
pub mod lite {
    pub mod fqn;
    pub mod http;
    pub mod identity;
    pub mod signaling;
}

/// The WebRTC capability consumed by the core, with one implementation
/// per feature.
pub mod webrtc {
    pub mod data_channel;
    pub mod ice_candidate;
    pub mod peer_connection;
    pub mod peer_connection_factory;
    pub mod peer_connection_observer;
    #[cfg(feature = "native")]
    pub mod native {
        pub mod data_channel;
        pub mod peer_connection;
        pub mod peer_connection_factory;
    }
    #[cfg(feature = "sim")]
    pub mod sim {
        pub mod data_channel;
        pub mod peer_connection;
        pub mod router;
    }
}
