//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Data channel adapter over `webrtc::RTCDataChannel`.

use std::sync::{mpsc, Arc};

use bytes::Bytes;
use webrtc::data_channel::{
    data_channel_message::DataChannelMessage, data_channel_state::RTCDataChannelState,
    RTCDataChannel,
};

use crate::{
    common::Result,
    error::ClientError,
    webrtc::data_channel::{DataChannel, DataChannelObserver, DataChannelState},
};

/// Buffered-amount watermark at which the adapter asks to be woken.
const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 256 * 1024;

pub struct NativeDataChannel {
    data_channel: Arc<RTCDataChannel>,
    runtime: tokio::runtime::Handle,
}

impl NativeDataChannel {
    pub(super) fn new(data_channel: Arc<RTCDataChannel>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            data_channel,
            runtime,
        }
    }
}

impl DataChannel for NativeDataChannel {
    fn label(&self) -> String {
        self.data_channel.label().to_string()
    }

    fn ready_state(&self) -> DataChannelState {
        match self.data_channel.ready_state() {
            RTCDataChannelState::Connecting => DataChannelState::Connecting,
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            RTCDataChannelState::Unspecified => DataChannelState::Connecting,
        }
    }

    fn send(&self, data: &Bytes) -> Result<()> {
        // The crate's send is async; bridge to the sync capability by
        // waiting on a completion channel rather than block_on, so this
        // stays callable from a runtime worker (e.g. inside an
        // on_message handler).
        let data_channel = self.data_channel.clone();
        let data = data.clone();
        let (done_sender, done_receiver) = mpsc::channel();
        self.runtime.spawn(async move {
            let result = data_channel.send(&data).await;
            let _ = done_sender.send(result);
        });
        match done_receiver.recv() {
            Ok(Ok(_bytes_sent)) => Ok(()),
            Ok(Err(err)) => Err(ClientError::DataChannelSend(err.to_string()).into()),
            Err(_) => Err(ClientError::DataChannelSend("send task died".to_string()).into()),
        }
    }

    fn buffered_amount(&self) -> usize {
        let data_channel = self.data_channel.clone();
        let (done_sender, done_receiver) = mpsc::channel();
        self.runtime.spawn(async move {
            let amount = data_channel.buffered_amount().await;
            let _ = done_sender.send(amount);
        });
        done_receiver.recv().unwrap_or(0)
    }

    fn set_observer(&self, observer: Box<dyn DataChannelObserver>) {
        let observer: Arc<dyn DataChannelObserver> = observer.into();

        let observer_for_open = observer.clone();
        self.data_channel.on_open(Box::new(move || {
            observer_for_open.handle_open();
            Box::pin(async {})
        }));

        let observer_for_messages = observer.clone();
        self.data_channel
            .on_message(Box::new(move |message: DataChannelMessage| {
                observer_for_messages.handle_message(message.data);
                Box::pin(async {})
            }));

        let observer_for_errors = observer.clone();
        self.data_channel.on_error(Box::new(move |err| {
            observer_for_errors.handle_error(err.to_string());
            Box::pin(async {})
        }));

        let observer_for_close = observer.clone();
        self.data_channel.on_close(Box::new(move || {
            observer_for_close.handle_close();
            Box::pin(async {})
        }));

        self.data_channel
            .set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD);
        let data_channel = self.data_channel.clone();
        let observer_for_backpressure = observer;
        self.runtime.spawn(async move {
            data_channel
                .on_buffered_amount_low(Box::new(move || {
                    let observer = observer_for_backpressure.clone();
                    Box::pin(async move {
                        observer.handle_buffered_amount_low();
                    })
                }))
                .await;
        });
    }

    fn clear_observer(&self) {
        self.data_channel.on_open(Box::new(|| Box::pin(async {})));
        self.data_channel
            .on_message(Box::new(|_| Box::pin(async {})));
        self.data_channel.on_error(Box::new(|_| Box::pin(async {})));
        self.data_channel.on_close(Box::new(|| Box::pin(async {})));
    }

    fn close(&self) {
        let data_channel = self.data_channel.clone();
        self.runtime.spawn(async move {
            if let Err(err) = data_channel.close().await {
                warn!("native: data channel close failed: {}", err);
            }
        });
    }
}
