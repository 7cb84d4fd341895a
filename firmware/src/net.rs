//! Connectivity state shared between the orchestrator and the network task.
//!
//! The [`ConnectivityManager`] is owned by the network task. The orchestrator
//! only holds a [`LinkHandle`]: requests land in atomics, the observed link
//! state and quick-connect cache are mirrored back after every service pass,
//! and session events travel through a bounded channel.

use core::cell::RefCell;

use button_core::connectivity::{
    BrokerClient, ConnectivityManager, LinkControl, LinkDriver, LinkMode, LinkParams, LinkState,
    MAX_SESSION_SUBSCRIPTIONS, NET_EVENT_DEPTH, NetEvent, SessionError,
};
use button_core::publish::{PublishQueueConsumer, Topic};
use button_core::time::Timestamp;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use heapless::Vec;
use portable_atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use crate::shared::SharedMutex;

// Pending request bits. Connect and disconnect replace each other; erase
// stays set until the worker has seen it.
const COMMAND_NONE: u8 = 0;
const COMMAND_CONNECT: u8 = 1 << 0;
const COMMAND_DISCONNECT: u8 = 1 << 1;
const COMMAND_ERASE: u8 = 1 << 2;

const PARAMS_VALID: u64 = 1 << 63;

/// Packs cached link parameters into one atomic word (0 == none).
pub(crate) fn pack_params(params: Option<LinkParams>) -> u64 {
    let Some(params) = params else {
        return 0;
    };
    let mut word = PARAMS_VALID | (u64::from(params.channel) << 48);
    for (shift, byte) in params.bssid.iter().rev().enumerate() {
        word |= u64::from(*byte) << (shift * 8);
    }
    word
}

pub(crate) fn unpack_params(word: u64) -> Option<LinkParams> {
    if word & PARAMS_VALID == 0 {
        return None;
    }
    let bytes = word.to_be_bytes();
    let mut bssid = [0u8; 6];
    bssid.copy_from_slice(&bytes[2..8]);
    Some(LinkParams {
        bssid,
        channel: bytes[1],
    })
}

pub(crate) const fn encode_state(state: LinkState) -> u8 {
    match state {
        LinkState::Disconnected => 0,
        LinkState::LinkConnecting {
            mode: LinkMode::Quick,
        } => 1,
        LinkState::LinkConnecting {
            mode: LinkMode::Normal,
        } => 2,
        LinkState::LinkUp => 3,
        LinkState::AppConnecting => 4,
        LinkState::FullyConnected => 5,
    }
}

pub(crate) const fn decode_state(raw: u8) -> LinkState {
    match raw {
        1 => LinkState::LinkConnecting {
            mode: LinkMode::Quick,
        },
        2 => LinkState::LinkConnecting {
            mode: LinkMode::Normal,
        },
        3 => LinkState::LinkUp,
        4 => LinkState::AppConnecting,
        5 => LinkState::FullyConnected,
        _ => LinkState::Disconnected,
    }
}

type FilterTable = Vec<Topic, MAX_SESSION_SUBSCRIPTIONS>;

/// Lock-free mirror of the connectivity worker.
pub struct ConnectivityHandle {
    command: AtomicU8,
    state: AtomicU8,
    disconnected: AtomicBool,
    quick_cache: AtomicU64,
    cache_seeded: AtomicBool,
    revision: AtomicU32,
    events: Channel<SharedMutex, NetEvent, NET_EVENT_DEPTH>,
    filters: Mutex<SharedMutex, RefCell<FilterTable>>,
}

impl ConnectivityHandle {
    pub const fn new() -> Self {
        Self {
            command: AtomicU8::new(COMMAND_NONE),
            state: AtomicU8::new(0),
            disconnected: AtomicBool::new(true),
            quick_cache: AtomicU64::new(0),
            cache_seeded: AtomicBool::new(false),
            revision: AtomicU32::new(0),
            events: Channel::new(),
            filters: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    /// Orchestrator-facing adapter.
    pub const fn link(&self) -> LinkHandle<'_> {
        LinkHandle { handle: self }
    }

    pub fn link_state(&self) -> LinkState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    /// Bumped whenever the mirrored link state changes.
    pub fn revision(&self) -> u32 {
        self.revision.load(Ordering::Acquire)
    }

    /// Applies pending requests to `manager`, polls it once, and mirrors the
    /// result back. Returns the new link state when it changed.
    pub fn service<I, W, B, Q>(
        &self,
        manager: &mut ConnectivityManager<I, W, B>,
        now: I,
        queue: &mut Q,
    ) -> Option<LinkState>
    where
        I: Timestamp,
        W: LinkDriver,
        B: BrokerClient,
        Q: PublishQueueConsumer,
    {
        if self.cache_seeded.swap(false, Ordering::AcqRel) {
            manager.set_quick_cache(unpack_params(self.quick_cache.load(Ordering::Acquire)));
        }

        let filters = self.filters.lock(|table| core::mem::take(&mut *table.borrow_mut()));
        for filter in &filters {
            // The table is bounded by the same limit, so this cannot overflow.
            let _ = manager.add_session_subscription(filter);
        }

        let pending = self.command.swap(COMMAND_NONE, Ordering::AcqRel);
        if pending & COMMAND_ERASE != 0 {
            manager.request_disconnect(true);
        }
        if pending & COMMAND_CONNECT != 0 {
            manager.request_connect();
        } else if pending & COMMAND_DISCONNECT != 0 {
            manager.request_disconnect(false);
        }

        manager.poll(now, queue);

        while !self.events.is_full() {
            let Some(event) = manager.next_event() else {
                break;
            };
            let _ = self.events.try_send(event);
        }

        if !self.cache_seeded.load(Ordering::Acquire) {
            self.quick_cache
                .store(pack_params(manager.quick_cache()), Ordering::Release);
        }
        self.disconnected
            .store(manager.is_disconnected(), Ordering::Release);

        let state = manager.link_state();
        let previous = self.state.swap(encode_state(state), Ordering::AcqRel);
        if previous == encode_state(state) {
            None
        } else {
            self.revision.fetch_add(1, Ordering::AcqRel);
            Some(state)
        }
    }

    fn request_connect(&self) {
        let _ = self
            .command
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some((pending & COMMAND_ERASE) | COMMAND_CONNECT)
            });
        self.disconnected.store(false, Ordering::Release);
    }

    fn request_disconnect(&self, erase: bool) {
        let erase = if erase { COMMAND_ERASE } else { COMMAND_NONE };
        let _ = self
            .command
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some((pending & COMMAND_ERASE) | erase | COMMAND_DISCONNECT)
            });
        self.disconnected.store(false, Ordering::Release);
    }
}

impl Default for ConnectivityHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// [`LinkControl`] over a [`ConnectivityHandle`].
#[derive(Copy, Clone)]
pub struct LinkHandle<'a> {
    handle: &'a ConnectivityHandle,
}

impl LinkControl for LinkHandle<'_> {
    fn request_connect(&mut self) {
        self.handle.request_connect();
    }

    fn request_disconnect(&mut self, erase: bool) {
        self.handle.request_disconnect(erase);
    }

    fn link_state(&self) -> LinkState {
        self.handle.link_state()
    }

    fn is_disconnected(&self) -> bool {
        self.handle.command.load(Ordering::Acquire) == COMMAND_NONE
            && self.handle.disconnected.load(Ordering::Acquire)
    }

    fn next_event(&mut self) -> Option<NetEvent> {
        self.handle.events.try_receive().ok()
    }

    fn quick_cache(&self) -> Option<LinkParams> {
        unpack_params(self.handle.quick_cache.load(Ordering::Acquire))
    }

    fn set_quick_cache(&mut self, params: Option<LinkParams>) {
        self.handle
            .quick_cache
            .store(pack_params(params), Ordering::Release);
        self.handle.cache_seeded.store(true, Ordering::Release);
    }

    fn subscribe_on_session(&mut self, filter: &str) -> Result<(), SessionError> {
        let mut topic = Topic::new();
        topic
            .push_str(filter)
            .map_err(|_| SessionError::TooManySubscriptions)?;
        self.handle.filters.lock(|table| {
            let mut table = table.borrow_mut();
            if table.contains(&topic) {
                return Ok(());
            }
            table
                .push(topic)
                .map_err(|_| SessionError::TooManySubscriptions)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use button_core::connectivity::{BrokerError, InboundMessage, NetTimings};
    use button_core::publish::{LocalPublishQueue, Payload, PublishItem};

    use crate::time::FirmwareInstant;

    const PARAMS: LinkParams = LinkParams {
        bssid: [0xAA, 0x01, 0x02, 0x03, 0x04, 0xFE],
        channel: 11,
    };

    #[derive(Default)]
    struct Link {
        up: bool,
        erased: bool,
    }

    impl LinkDriver for Link {
        fn begin(&mut self, _params: Option<&LinkParams>) {
            self.up = true;
        }

        fn is_up(&mut self) -> bool {
            self.up
        }

        fn current_params(&mut self) -> Option<LinkParams> {
            self.up.then_some(PARAMS)
        }

        fn disconnect(&mut self, erase: bool) {
            self.up = false;
            self.erased |= erase;
        }
    }

    #[derive(Default)]
    struct Broker {
        connected: bool,
        subscribed: Vec<Topic, 4>,
        inbound: Option<InboundMessage>,
    }

    impl BrokerClient for Broker {
        fn connect(&mut self) {
            self.connected = true;
        }

        fn is_connected(&mut self) -> bool {
            self.connected
        }

        fn publish(&mut self, _item: &PublishItem) -> Result<(), BrokerError> {
            Ok(())
        }

        fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
            let mut filter = Topic::new();
            filter.push_str(topic).map_err(|_| BrokerError::Rejected)?;
            self.subscribed
                .push(filter)
                .map_err(|_| BrokerError::Rejected)
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn poll_inbound(&mut self) -> Option<InboundMessage> {
            self.inbound.take()
        }
    }

    type Manager = ConnectivityManager<FirmwareInstant, Link, Broker>;

    fn run(
        handle: &ConnectivityHandle,
        manager: &mut Manager,
        queue: &mut LocalPublishQueue,
        from_ms: u64,
        to_ms: u64,
    ) {
        for ms in (from_ms..to_ms).step_by(10) {
            handle.service(manager, FirmwareInstant::from_millis(ms), queue);
        }
    }

    #[test]
    fn params_survive_packing() {
        assert_eq!(unpack_params(pack_params(Some(PARAMS))), Some(PARAMS));
        assert_eq!(unpack_params(pack_params(None)), None);
        let zero_channel = LinkParams {
            bssid: [0; 6],
            channel: 0,
        };
        assert_eq!(
            unpack_params(pack_params(Some(zero_channel))),
            Some(zero_channel)
        );
    }

    #[test]
    fn connect_request_reaches_the_worker_and_state_is_mirrored() {
        let handle = ConnectivityHandle::new();
        let mut manager = Manager::new(
            Link::default(),
            Broker::default(),
            NetTimings::default(),
            None,
        );
        let mut queue = LocalPublishQueue::new();
        let mut link = handle.link();

        link.subscribe_on_session("homebuttons/hall/cmd/+")
            .expect("filter fits");
        link.request_connect();
        assert!(!link.is_disconnected());

        run(&handle, &mut manager, &mut queue, 0, 3_000);
        assert_eq!(link.link_state(), LinkState::FullyConnected);
        assert_eq!(link.next_event(), Some(NetEvent::SessionEstablished));
        assert_eq!(
            manager.broker().subscribed.first().map(Topic::as_str),
            Some("homebuttons/hall/cmd/+")
        );
        assert_eq!(link.quick_cache(), Some(PARAMS));
        assert!(handle.revision() > 0);
    }

    #[test]
    fn inbound_messages_arrive_as_events() {
        let handle = ConnectivityHandle::new();
        let mut manager = Manager::new(
            Link::default(),
            Broker::default(),
            NetTimings::default(),
            None,
        );
        let mut queue = LocalPublishQueue::new();
        let mut link = handle.link();
        link.request_connect();
        run(&handle, &mut manager, &mut queue, 0, 3_000);
        assert_eq!(link.next_event(), Some(NetEvent::SessionEstablished));

        let mut topic = Topic::new();
        topic.push_str("homebuttons/hall/cmd/awake_mode").expect("fits");
        let mut payload = Payload::new();
        payload.extend_from_slice(b"ON").expect("fits");
        manager.broker_mut().inbound = Some(InboundMessage { topic, payload });
        run(&handle, &mut manager, &mut queue, 3_000, 3_050);

        match link.next_event() {
            Some(NetEvent::Message(message)) => assert_eq!(message.payload.as_slice(), b"ON"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn seeded_cache_is_handed_to_the_worker_once() {
        let handle = ConnectivityHandle::new();
        let mut manager = Manager::new(
            Link::default(),
            Broker::default(),
            NetTimings::default(),
            None,
        );
        let mut queue: LocalPublishQueue = LocalPublishQueue::new();
        let mut link = handle.link();

        link.set_quick_cache(Some(PARAMS));
        assert_eq!(link.quick_cache(), Some(PARAMS));
        handle.service(&mut manager, FirmwareInstant::from_millis(0), &mut queue);
        assert_eq!(manager.quick_cache(), Some(PARAMS));
    }

    #[test]
    fn erase_is_sticky_until_the_worker_applies_it() {
        let handle = ConnectivityHandle::new();
        let mut manager = Manager::new(
            Link::default(),
            Broker::default(),
            NetTimings::default(),
            None,
        );
        let mut queue = LocalPublishQueue::new();
        let mut link = handle.link();
        link.request_connect();
        run(&handle, &mut manager, &mut queue, 0, 3_000);

        link.request_disconnect(true);
        link.request_disconnect(false);
        assert!(!link.is_disconnected());

        run(&handle, &mut manager, &mut queue, 3_000, 6_000);
        assert!(link.is_disconnected());
        assert!(manager.link().erased);
        assert_eq!(link.link_state(), LinkState::Disconnected);
    }

    #[test]
    fn connect_after_erase_still_erases() {
        let handle = ConnectivityHandle::new();
        let mut manager = Manager::new(
            Link::default(),
            Broker::default(),
            NetTimings::default(),
            None,
        );
        let mut queue = LocalPublishQueue::new();
        let mut link = handle.link();
        link.request_connect();
        run(&handle, &mut manager, &mut queue, 0, 3_000);

        link.request_disconnect(true);
        link.request_connect();
        run(&handle, &mut manager, &mut queue, 3_000, 9_000);
        assert!(manager.link().erased);
        assert_eq!(link.link_state(), LinkState::FullyConnected);
    }
}
