//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common error conditions.
//!
//! Everything fallible returns `common::Result`, which carries
//! `anyhow::Error`; callers that need to classify a failure downcast to
//! [`ClientError`]. Poll loops never crash on a single tick: network
//! errors are reported through observers and swallowed.

use std::time::Duration;

/// Library-wide error conditions.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    /// A caller-supplied argument violates a schema. Never retried.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// Missing or rejected credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// A targeted fetch named something the server doesn't have.
    /// Optional getters map a 404 to `Ok(None)` instead.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport failure or server 5xx. Recoverable; poll loops report
    /// it and continue.
    #[error("network failure: {0}")]
    Network(String),

    /// A phase timer fired before the phase completed.
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    /// An operation was invoked in a state that doesn't permit it.
    /// A programming error, surfaced synchronously.
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Send on a closed channel.
    #[error("channel is closed")]
    ChannelClosed,

    /// `create_channel` with a label that already exists.
    #[error("duplicate channel label: {0}")]
    DuplicateChannel(String),

    /// The underlying transport refused a data channel send.
    #[error("unable to send on data channel: {0}")]
    DataChannelSend(String),

    /// The reconnection budget is spent.
    #[error("reconnect attempts exhausted after {0}")]
    ReconnectExhausted(u32),

    /// The peer connection reported a terminal transport failure.
    #[error("peer connection lost: {0}")]
    TransportLost(String),

    #[error("mutex poisoned: {0}")]
    Poisoned(&'static str),
}
