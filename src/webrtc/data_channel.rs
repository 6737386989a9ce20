//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The data-channel surface this library needs from a WebRTC
//! implementation.

use std::fmt;

use bytes::Bytes;

use crate::common::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for DataChannelState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Reliability options for channel creation. `ordered` defaults to
/// true; `max_retransmits` opts into partial reliability.
#[derive(Clone, Debug)]
pub struct DataChannelInit {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }
}

pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn ready_state(&self) -> DataChannelState;
    fn send(&self, data: &Bytes) -> Result<()>;
    /// Bytes accepted by `send` but not yet handed to the transport.
    fn buffered_amount(&self) -> usize;
    /// Replaces the observer. Events that raced the swap may still be
    /// delivered to the previous observer.
    fn set_observer(&self, observer: Box<dyn DataChannelObserver>);
    fn clear_observer(&self);
    fn close(&self);
}

pub trait DataChannelObserver: Send + Sync {
    fn handle_open(&self);
    fn handle_message(&self, data: Bytes);
    fn handle_buffered_amount_low(&self) {}
    fn handle_error(&self, description: String);
    fn handle_close(&self);
}
