//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A label-scoped logical channel that survives replacement of the
//! underlying data channel.
//!
//! While no transport is attached the channel queues sends (bounded by
//! size and age); on attach it flushes in enqueue order. The underlying
//! channel is owned by the peer connection: detaching never closes it,
//! it only drops the reference and listeners.

use std::{
    fmt,
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;

use crate::{
    common::Result,
    core::{
        buffer::MessageQueue,
        sync::NamedMutex,
    },
    error::ClientError,
    webrtc::data_channel::{
        DataChannel, DataChannelInit, DataChannelObserver, DataChannelState,
    },
};

/// Stop flushing when the underlying buffer exceeds this; resume on
/// the buffered-amount-low signal (or the next send/attach).
const HIGH_WATER_MARK: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// No usable transport; sends are queued.
    Connecting,
    Open,
    Closing,
    /// Terminal. Never regressed out of.
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub max_queue_size: usize,
    pub max_message_age: std::time::Duration,
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_message_age: std::time::Duration::from_millis(60_000),
            ordered: true,
            max_retransmits: None,
        }
    }
}

impl ChannelConfig {
    pub fn data_channel_init(&self) -> DataChannelInit {
        DataChannelInit {
            ordered: self.ordered,
            max_retransmits: self.max_retransmits,
        }
    }
}

/// Channel events. Handlers run after the state they announce is
/// already visible through the getters.
pub trait ChannelObserver: Send + Sync {
    fn handle_open(&self, label: &str) {
        let _ = label;
    }
    fn handle_message(&self, label: &str, data: Bytes);
    fn handle_state_changed(&self, label: &str, state: ChannelState) {
        let _ = (label, state);
    }
    /// Reports how many queued messages were dropped. Not an error.
    fn handle_queue_overflow(&self, label: &str, dropped: usize) {
        let _ = (label, dropped);
    }
    fn handle_error(&self, label: &str, description: &str) {
        let _ = (label, description);
    }
    fn handle_closed(&self, label: &str) {
        let _ = label;
    }
}

#[derive(Clone)]
pub struct DurableChannel {
    inner: Arc<Inner>,
}

struct Inner {
    label: String,
    config: ChannelConfig,
    shared: NamedMutex<Shared>,
}

struct Shared {
    state: ChannelState,
    queue: MessageQueue,
    underlying: Option<Arc<dyn DataChannel>>,
    /// Bumped on every attach/detach; events carrying a stale epoch are
    /// from a previous underlying channel and are ignored.
    attach_epoch: u64,
    /// Single-flight guard for flush.
    flushing: bool,
    observer: Option<Arc<dyn ChannelObserver>>,
}

enum Notification {
    StateChanged(ChannelState),
    Open,
    QueueOverflow(usize),
    Error(String),
    Closed,
}

impl DurableChannel {
    pub fn new(label: &str, config: ChannelConfig) -> Self {
        let queue = MessageQueue::new(config.max_queue_size, config.max_message_age);
        Self {
            inner: Arc::new(Inner {
                label: label.to_string(),
                config,
                shared: NamedMutex::new(
                    Shared {
                        state: ChannelState::Connecting,
                        queue,
                        underlying: None,
                        attach_epoch: 0,
                        flushing: false,
                        observer: None,
                    },
                    "DurableChannel::shared",
                ),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ChannelState {
        self.inner
            .shared
            .lock()
            .map(|shared| shared.state)
            .unwrap_or(ChannelState::Closed)
    }

    pub fn queued_len(&self) -> usize {
        self.inner
            .shared
            .lock()
            .map(|shared| shared.queue.len())
            .unwrap_or(0)
    }

    pub fn set_observer(&self, observer: Box<dyn ChannelObserver>) {
        if let Ok(mut shared) = self.inner.shared.lock() {
            shared.observer = Some(observer.into());
        }
    }

    /// Sends now if the transport is open and the queue is drained,
    /// queues otherwise. Fails only once the channel is closed.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let mut notifications = Vec::new();
        let mut want_flush = false;
        let direct = {
            let mut shared = self.inner.shared.lock()?;
            match shared.state {
                ChannelState::Closed | ChannelState::Closing => {
                    return Err(ClientError::ChannelClosed.into());
                }
                ChannelState::Open => {
                    let direct = shared
                        .underlying
                        .clone()
                        .filter(|_| shared.queue.is_empty() && !shared.flushing);
                    match direct {
                        Some(underlying) => {
                            // Claim the single flight so nothing can
                            // jump ahead while the lock is released for
                            // the transport call.
                            shared.flushing = true;
                            Some(underlying)
                        }
                        None => {
                            let dropped = shared.queue.push(data.clone(), Instant::now());
                            if dropped > 0 {
                                notifications.push(Notification::QueueOverflow(dropped));
                            }
                            want_flush = true;
                            None
                        }
                    }
                }
                ChannelState::Connecting => {
                    let dropped = shared.queue.push(data.clone(), Instant::now());
                    if dropped > 0 {
                        notifications.push(Notification::QueueOverflow(dropped));
                    }
                    None
                }
            }
        };
        if let Some(underlying) = direct {
            let result = underlying.send(&data);
            {
                let mut shared = self.inner.shared.lock()?;
                shared.flushing = false;
                if let Err(err) = result {
                    // Keep the message; it goes out on the next flush
                    // or transport, still ahead of anything queued in
                    // the meantime.
                    let dropped = shared.queue.requeue_front(data, Instant::now());
                    if dropped > 0 {
                        notifications.push(Notification::QueueOverflow(dropped));
                    }
                    notifications.push(Notification::Error(err.to_string()));
                } else if !shared.queue.is_empty() {
                    want_flush = true;
                }
            }
        }
        self.dispatch(notifications);
        if want_flush {
            self.flush();
        }
        Ok(())
    }

    /// Binds a fresh underlying channel. A previously attached one is
    /// detached first (listeners removed, reference dropped, channel
    /// left open for its peer connection to dispose of).
    pub fn attach(&self, underlying: Arc<dyn DataChannel>) {
        let epoch;
        {
            let mut shared = match self.inner.shared.lock() {
                Ok(shared) => shared,
                Err(_) => return,
            };
            if shared.state == ChannelState::Closed || shared.state == ChannelState::Closing {
                return;
            }
            if let Some(previous) = shared.underlying.take() {
                previous.clear_observer();
            }
            shared.attach_epoch += 1;
            epoch = shared.attach_epoch;
            shared.underlying = Some(underlying.clone());
        }
        // Install the observer with the lock released: a transport that
        // buffered inbound events may replay them synchronously here,
        // and those land right back on this channel.
        underlying.set_observer(Box::new(UnderlyingObserver {
            channel: self.clone(),
            epoch,
        }));
        // Already-open transports don't fire `open` again; synthesize it.
        if underlying.ready_state() == DataChannelState::Open {
            self.on_underlying_open(epoch);
        }
    }

    /// Drops the underlying channel but keeps the queue. The channel
    /// regresses to `Connecting` and waits for the next attach.
    pub fn detach(&self) {
        let mut notifications = Vec::new();
        {
            let mut shared = match self.inner.shared.lock() {
                Ok(shared) => shared,
                Err(_) => return,
            };
            if let Some(previous) = shared.underlying.take() {
                previous.clear_observer();
            }
            shared.attach_epoch += 1;
            if shared.state == ChannelState::Open {
                shared.state = ChannelState::Connecting;
                notifications.push(Notification::StateChanged(ChannelState::Connecting));
            }
        }
        self.dispatch(notifications);
    }

    /// Explicit close; terminal. Closes the underlying channel too,
    /// since the application is done with the label.
    pub fn close(&self) {
        let mut notifications = Vec::new();
        let underlying = {
            let mut shared = match self.inner.shared.lock() {
                Ok(shared) => shared,
                Err(_) => return,
            };
            if shared.state == ChannelState::Closed {
                return;
            }
            shared.state = ChannelState::Closing;
            notifications.push(Notification::StateChanged(ChannelState::Closing));
            shared.attach_epoch += 1;
            shared.queue.clear();
            shared.state = ChannelState::Closed;
            notifications.push(Notification::StateChanged(ChannelState::Closed));
            notifications.push(Notification::Closed);
            shared.underlying.take()
        };
        // Closing the transport can synchronously echo a close event;
        // detach its observer first and do both outside the lock.
        if let Some(underlying) = underlying {
            underlying.clear_observer();
            underlying.close();
        }
        self.dispatch(notifications);
    }

    /// Drains the queue in insertion order. Single-flight; safe to call
    /// from anywhere. Pauses on backpressure and resumes on the
    /// buffered-amount-low signal or the next send/attach. The
    /// transport call itself runs with the lock released; the
    /// `flushing` claim is what keeps ordering intact.
    fn flush(&self) {
        {
            let mut shared = match self.inner.shared.lock() {
                Ok(shared) => shared,
                Err(_) => return,
            };
            if shared.flushing
                || shared.state != ChannelState::Open
                || shared.underlying.is_none()
                || shared.queue.is_empty()
            {
                return;
            }
            shared.flushing = true;
        }
        'flight: loop {
            loop {
                let step = {
                    let mut shared = match self.inner.shared.lock() {
                        Ok(shared) => shared,
                        Err(_) => return,
                    };
                    match (shared.underlying.clone(), shared.state) {
                        (Some(underlying), ChannelState::Open)
                            if !shared.queue.is_empty()
                                && underlying.buffered_amount() <= HIGH_WATER_MARK =>
                        {
                            shared
                                .queue
                                .pop_front()
                                .map(|message| (underlying, message))
                        }
                        _ => None,
                    }
                };
                let (underlying, message) = match step {
                    Some(step) => step,
                    None => break,
                };
                if let Err(err) = underlying.send(&message.data) {
                    // Back to the head so ordering survives the retry.
                    if let Ok(mut shared) = self.inner.shared.lock() {
                        shared.queue.push_front(message);
                    }
                    self.dispatch(vec![Notification::Error(err.to_string())]);
                    break 'flight;
                }
            }
            // Release the flight, but pick up anything that raced in
            // between the last pop and here.
            let mut shared = match self.inner.shared.lock() {
                Ok(shared) => shared,
                Err(_) => return,
            };
            let more = shared.state == ChannelState::Open
                && shared.underlying.is_some()
                && !shared.queue.is_empty();
            if !more {
                shared.flushing = false;
                return;
            }
            // Backpressure pause keeps the claim off so the low-water
            // event can re-enter.
            if let Some(underlying) = shared.underlying.clone() {
                if underlying.buffered_amount() > HIGH_WATER_MARK {
                    shared.flushing = false;
                    return;
                }
            }
        }
        if let Ok(mut shared) = self.inner.shared.lock() {
            shared.flushing = false;
        }
    }

    fn on_underlying_open(&self, epoch: u64) {
        let mut notifications = Vec::new();
        {
            let mut shared = match self.inner.shared.lock() {
                Ok(shared) => shared,
                Err(_) => return,
            };
            if shared.attach_epoch != epoch || shared.underlying.is_none() {
                return;
            }
            match shared.state {
                ChannelState::Connecting => {
                    shared.state = ChannelState::Open;
                    notifications.push(Notification::StateChanged(ChannelState::Open));
                    notifications.push(Notification::Open);
                }
                // Open fires at most once per attach.
                ChannelState::Open | ChannelState::Closing | ChannelState::Closed => {}
            }
        }
        self.dispatch(notifications);
        self.flush();
    }

    fn on_underlying_message(&self, epoch: u64, data: Bytes) {
        let observer = {
            let shared = match self.inner.shared.lock() {
                Ok(shared) => shared,
                Err(_) => return,
            };
            if shared.attach_epoch != epoch {
                return;
            }
            shared.observer.clone()
        };
        if let Some(observer) = observer {
            observer.handle_message(&self.inner.label, data);
        }
    }

    fn on_underlying_close(&self, epoch: u64) {
        let mut notifications = Vec::new();
        {
            let mut shared = match self.inner.shared.lock() {
                Ok(shared) => shared,
                Err(_) => return,
            };
            if shared.attach_epoch != epoch {
                return;
            }
            match shared.state {
                ChannelState::Closing | ChannelState::Closed => {}
                ChannelState::Open | ChannelState::Connecting => {
                    if let Some(previous) = shared.underlying.take() {
                        previous.clear_observer();
                    }
                    shared.attach_epoch += 1;
                    if shared.state != ChannelState::Connecting {
                        shared.state = ChannelState::Connecting;
                        notifications.push(Notification::StateChanged(ChannelState::Connecting));
                    }
                }
            }
        }
        self.dispatch(notifications);
    }

    fn on_underlying_error(&self, epoch: u64, description: String) {
        let observer = {
            let shared = match self.inner.shared.lock() {
                Ok(shared) => shared,
                Err(_) => return,
            };
            if shared.attach_epoch != epoch {
                return;
            }
            shared.observer.clone()
        };
        if let Some(observer) = observer {
            observer.handle_error(&self.inner.label, &description);
        }
    }

    fn on_buffered_amount_low(&self, epoch: u64) {
        let current = self
            .inner
            .shared
            .lock()
            .map(|shared| shared.attach_epoch == epoch)
            .unwrap_or(false);
        if current {
            self.flush();
        }
    }

    fn dispatch(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let observer = match self.inner.shared.lock() {
            Ok(shared) => shared.observer.clone(),
            Err(_) => None,
        };
        let observer = match observer {
            Some(observer) => observer,
            None => return,
        };
        let label = &self.inner.label;
        for notification in notifications {
            match notification {
                Notification::StateChanged(state) => observer.handle_state_changed(label, state),
                Notification::Open => observer.handle_open(label),
                Notification::QueueOverflow(dropped) => {
                    observer.handle_queue_overflow(label, dropped)
                }
                Notification::Error(description) => observer.handle_error(label, &description),
                Notification::Closed => observer.handle_closed(label),
            }
        }
    }
}

struct UnderlyingObserver {
    channel: DurableChannel,
    epoch: u64,
}

impl DataChannelObserver for UnderlyingObserver {
    fn handle_open(&self) {
        self.channel.on_underlying_open(self.epoch);
    }

    fn handle_message(&self, data: Bytes) {
        self.channel.on_underlying_message(self.epoch, data);
    }

    fn handle_buffered_amount_low(&self) {
        self.channel.on_buffered_amount_low(self.epoch);
    }

    fn handle_error(&self, description: String) {
        self.channel.on_underlying_error(self.epoch, description);
    }

    fn handle_close(&self) {
        self.channel.on_underlying_close(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::Mutex,
        time::Duration,
    };

    /// Scriptable transport double: records sends, lets tests flip the
    /// ready state and inject send failures, and forwards events
    /// through whatever observer the channel installed.
    struct FakeTransport {
        sent: Mutex<Vec<Bytes>>,
        ready: Mutex<DataChannelState>,
        fail_sends: Mutex<bool>,
        observer: Mutex<Option<Arc<dyn DataChannelObserver>>>,
    }

    impl FakeTransport {
        fn new(ready: DataChannelState) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                ready: Mutex::new(ready),
                fail_sends: Mutex::new(false),
                observer: Mutex::new(None),
            })
        }

        fn sent(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }

        fn set_fail_sends(&self, fail: bool) {
            *self.fail_sends.lock().unwrap() = fail;
        }

        fn fire_open(&self) {
            *self.ready.lock().unwrap() = DataChannelState::Open;
            let observer = self.observer.lock().unwrap().clone();
            if let Some(observer) = observer {
                observer.handle_open();
            }
        }

        fn fire_close(&self) {
            *self.ready.lock().unwrap() = DataChannelState::Closed;
            let observer = self.observer.lock().unwrap().clone();
            if let Some(observer) = observer {
                observer.handle_close();
            }
        }
    }

    impl DataChannel for FakeTransport {
        fn label(&self) -> String {
            "fake".to_string()
        }

        fn ready_state(&self) -> DataChannelState {
            *self.ready.lock().unwrap()
        }

        fn send(&self, data: &Bytes) -> Result<()> {
            if *self.fail_sends.lock().unwrap() {
                return Err(ClientError::DataChannelSend("injected".to_string()).into());
            }
            self.sent.lock().unwrap().push(data.clone());
            Ok(())
        }

        fn buffered_amount(&self) -> usize {
            0
        }

        fn set_observer(&self, observer: Box<dyn DataChannelObserver>) {
            *self.observer.lock().unwrap() = Some(observer.into());
        }

        fn clear_observer(&self) {
            *self.observer.lock().unwrap() = None;
        }

        fn close(&self) {
            self.fire_close();
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        states: Mutex<Vec<ChannelState>>,
        overflows: Mutex<Vec<usize>>,
        opens: Mutex<usize>,
    }

    impl ChannelObserver for RecordingObserver {
        fn handle_message(&self, _label: &str, _data: Bytes) {}

        fn handle_open(&self, _label: &str) {
            *self.opens.lock().unwrap() += 1;
        }

        fn handle_state_changed(&self, _label: &str, state: ChannelState) {
            self.states.lock().unwrap().push(state);
        }

        fn handle_queue_overflow(&self, _label: &str, dropped: usize) {
            self.overflows.lock().unwrap().push(dropped);
        }
    }

    fn channel_with_observer(config: ChannelConfig) -> (DurableChannel, Arc<RecordingObserver>) {
        let channel = DurableChannel::new("data", config);
        let observer = Arc::new(RecordingObserver::default());
        let observer_for_channel = observer.clone();
        struct Forward(Arc<RecordingObserver>);
        impl ChannelObserver for Forward {
            fn handle_message(&self, label: &str, data: Bytes) {
                self.0.handle_message(label, data)
            }
            fn handle_open(&self, label: &str) {
                self.0.handle_open(label)
            }
            fn handle_state_changed(&self, label: &str, state: ChannelState) {
                self.0.handle_state_changed(label, state)
            }
            fn handle_queue_overflow(&self, label: &str, dropped: usize) {
                self.0.handle_queue_overflow(label, dropped)
            }
        }
        channel.set_observer(Box::new(Forward(observer_for_channel)));
        (channel, observer)
    }

    #[test]
    fn queues_until_attach_then_flushes_in_order() {
        let (channel, _observer) = channel_with_observer(ChannelConfig::default());
        channel.send(Bytes::from_static(b"a")).unwrap();
        channel.send(Bytes::from_static(b"b")).unwrap();
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert_eq!(channel.queued_len(), 2);

        let transport = FakeTransport::new(DataChannelState::Open);
        channel.attach(transport.clone());

        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.queued_len(), 0);
        assert_eq!(
            transport.sent(),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }

    #[test]
    fn attach_to_already_open_transport_synthesizes_open_once() {
        let (channel, observer) = channel_with_observer(ChannelConfig::default());
        let transport = FakeTransport::new(DataChannelState::Open);
        channel.attach(transport);
        assert_eq!(*observer.opens.lock().unwrap(), 1);
    }

    #[test]
    fn open_event_drives_connecting_transport() {
        let (channel, observer) = channel_with_observer(ChannelConfig::default());
        let transport = FakeTransport::new(DataChannelState::Connecting);
        channel.attach(transport.clone());
        assert_eq!(channel.state(), ChannelState::Connecting);

        channel.send(Bytes::from_static(b"queued")).unwrap();
        transport.fire_open();
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(transport.sent(), vec![Bytes::from_static(b"queued")]);
        assert_eq!(*observer.opens.lock().unwrap(), 1);
    }

    #[test]
    fn underlying_close_regresses_to_connecting_and_new_attach_replays() {
        let (channel, observer) = channel_with_observer(ChannelConfig::default());
        let first = FakeTransport::new(DataChannelState::Open);
        channel.attach(first.clone());
        channel.send(Bytes::from_static(b"a")).unwrap();
        channel.send(Bytes::from_static(b"b")).unwrap();

        first.fire_close();
        assert_eq!(channel.state(), ChannelState::Connecting);

        channel.send(Bytes::from_static(b"c")).unwrap();
        assert_eq!(channel.queued_len(), 1);

        let second = FakeTransport::new(DataChannelState::Open);
        channel.attach(second.clone());
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(second.sent(), vec![Bytes::from_static(b"c")]);
        assert!(observer.overflows.lock().unwrap().is_empty());
        assert_eq!(
            *observer.states.lock().unwrap(),
            vec![ChannelState::Open, ChannelState::Connecting, ChannelState::Open]
        );
    }

    #[test]
    fn overflow_keeps_most_recent_and_reports_drops() {
        let (channel, observer) = channel_with_observer(ChannelConfig {
            max_queue_size: 2,
            ..ChannelConfig::default()
        });
        for text in [b"1" as &[u8], b"2", b"3", b"4", b"5"] {
            channel.send(Bytes::copy_from_slice(text)).unwrap();
        }
        assert_eq!(channel.queued_len(), 2);
        let dropped: usize = observer.overflows.lock().unwrap().iter().sum();
        assert_eq!(dropped, 3);

        let transport = FakeTransport::new(DataChannelState::Open);
        channel.attach(transport.clone());
        assert_eq!(
            transport.sent(),
            vec![Bytes::from_static(b"4"), Bytes::from_static(b"5")]
        );
    }

    #[test]
    fn zero_capacity_queue_stays_empty() {
        let (channel, observer) = channel_with_observer(ChannelConfig {
            max_queue_size: 0,
            ..ChannelConfig::default()
        });
        channel.send(Bytes::from_static(b"x")).unwrap();
        assert_eq!(channel.queued_len(), 0);
        assert_eq!(*observer.overflows.lock().unwrap(), vec![1]);
    }

    #[test]
    fn failed_direct_send_requeues() {
        let (channel, _observer) = channel_with_observer(ChannelConfig::default());
        let transport = FakeTransport::new(DataChannelState::Open);
        channel.attach(transport.clone());

        transport.set_fail_sends(true);
        channel.send(Bytes::from_static(b"kept")).unwrap();
        assert_eq!(channel.queued_len(), 1);

        transport.set_fail_sends(false);
        channel.send(Bytes::from_static(b"later")).unwrap();
        assert_eq!(
            transport.sent(),
            vec![Bytes::from_static(b"kept"), Bytes::from_static(b"later")]
        );
    }

    #[test]
    fn send_after_close_is_an_error() {
        let (channel, _observer) = channel_with_observer(ChannelConfig::default());
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        let err = channel.send(Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::ChannelClosed)
        ));
    }

    #[test]
    fn detach_keeps_queue_and_never_closes_underlying() {
        let (channel, _observer) = channel_with_observer(ChannelConfig::default());
        let transport = FakeTransport::new(DataChannelState::Open);
        channel.attach(transport.clone());
        channel.detach();
        assert_eq!(channel.state(), ChannelState::Connecting);
        // Detach must not close the transport; the peer connection owns it.
        assert_eq!(transport.ready_state(), DataChannelState::Open);

        channel.send(Bytes::from_static(b"q")).unwrap();
        assert_eq!(channel.queued_len(), 1);
    }

    #[test]
    fn stale_events_from_a_replaced_transport_are_ignored() {
        let (channel, _observer) = channel_with_observer(ChannelConfig::default());
        let first = FakeTransport::new(DataChannelState::Open);
        channel.attach(first.clone());
        let second = FakeTransport::new(DataChannelState::Open);
        channel.attach(second.clone());

        // The first transport's observer was cleared on re-attach;
        // even a raced close event can't regress the channel.
        first.fire_close();
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[test]
    fn messages_older_than_max_age_are_pruned_on_enqueue() {
        let (channel, _observer) = channel_with_observer(ChannelConfig {
            max_message_age: Duration::from_millis(10),
            ..ChannelConfig::default()
        });
        channel.send(Bytes::from_static(b"stale")).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        channel.send(Bytes::from_static(b"fresh")).unwrap();
        assert_eq!(channel.queued_len(), 1);
    }
}
