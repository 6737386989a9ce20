//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulation data channel: a thin handle onto the router.

use bytes::Bytes;

use crate::{
    common::Result,
    webrtc::{
        data_channel::{DataChannel, DataChannelObserver, DataChannelState},
        sim::router::{ChannelId, Router},
    },
};

pub struct SimDataChannel {
    router: Router,
    channel_id: ChannelId,
}

impl SimDataChannel {
    pub(super) fn new(router: Router, channel_id: ChannelId) -> Self {
        Self { router, channel_id }
    }

    pub fn id(&self) -> ChannelId {
        self.channel_id
    }
}

impl DataChannel for SimDataChannel {
    fn label(&self) -> String {
        self.router.channel_label(self.channel_id)
    }

    fn ready_state(&self) -> DataChannelState {
        self.router.channel_state(self.channel_id)
    }

    fn send(&self, data: &Bytes) -> Result<()> {
        self.router.send(self.channel_id, data)
    }

    fn buffered_amount(&self) -> usize {
        // The simulated transport delivers synchronously.
        0
    }

    fn set_observer(&self, observer: Box<dyn DataChannelObserver>) {
        self.router
            .set_channel_observer(self.channel_id, Some(observer.into()));
    }

    fn clear_observer(&self) {
        self.router.set_channel_observer(self.channel_id, None);
    }

    fn close(&self) {
        self.router.close_channel(self.channel_id);
    }
}
