//! Network connectivity state machine.
//!
//! [`ConnectivityManager`] owns the link layer ([`LinkDriver`]) and the broker
//! session ([`BrokerClient`]). It is polled from its own worker loop, takes
//! connect/disconnect requests cooperatively, drains the publish queue once
//! fully connected, and reports session establishment and inbound messages as
//! [`NetEvent`]s. The orchestrator only sees it through [`LinkControl`].

use core::{fmt, time::Duration};

use heapless::{Deque, Vec};

use crate::publish::{Payload, PublishItem, PublishQueueConsumer, Topic};
use crate::time::Timestamp;

/// Maximum number of topics subscribed on every session.
pub const MAX_SESSION_SUBSCRIPTIONS: usize = 4;
/// Depth of the inbound event buffer.
pub const NET_EVENT_DEPTH: usize = 8;
/// Publish attempts against a live session before an item is discarded.
pub const MAX_PUBLISH_ATTEMPTS: u8 = 3;
/// Inbound messages moved into the event buffer per poll.
const INBOUND_PER_POLL: usize = 4;

/// How the link layer is being established.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkMode {
    /// Reconnect from cached access-point identity and channel.
    Quick,
    /// Full negotiation.
    Normal,
}

/// Externally visible connectivity status.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkState {
    Disconnected,
    LinkConnecting { mode: LinkMode },
    LinkUp,
    AppConnecting,
    FullyConnected,
}

impl LinkState {
    /// Returns `true` when publish and subscribe are possible.
    #[must_use]
    pub const fn is_fully_connected(self) -> bool {
        matches!(self, LinkState::FullyConnected)
    }

    /// Returns `true` when nothing is established or being established.
    #[must_use]
    pub const fn is_disconnected(self) -> bool {
        matches!(self, LinkState::Disconnected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => f.write_str("disconnected"),
            LinkState::LinkConnecting {
                mode: LinkMode::Quick,
            } => f.write_str("link-connecting(quick)"),
            LinkState::LinkConnecting {
                mode: LinkMode::Normal,
            } => f.write_str("link-connecting(normal)"),
            LinkState::LinkUp => f.write_str("link-up"),
            LinkState::AppConnecting => f.write_str("app-connecting"),
            LinkState::FullyConnected => f.write_str("fully-connected"),
        }
    }
}

/// Cached negotiation parameters used by quick connect.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinkParams {
    pub bssid: [u8; 6],
    pub channel: u8,
}

/// Message received on a subscribed topic.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundMessage {
    pub topic: Topic,
    pub payload: Payload,
}

/// Events handed from the connectivity worker to the orchestrator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetEvent {
    /// A broker session was (re)established and subscriptions were applied.
    SessionEstablished,
    Message(InboundMessage),
}

/// Link-layer driver (Wi-Fi station).
pub trait LinkDriver {
    /// Starts associating; `Some` requests a quick connect with cached parameters.
    fn begin(&mut self, params: Option<&LinkParams>);

    /// Returns `true` once associated and addressed.
    fn is_up(&mut self) -> bool;

    /// Returns the parameters of the current association, if known.
    fn current_params(&mut self) -> Option<LinkParams>;

    /// Drops the association; `erase` also forgets stored credentials.
    fn disconnect(&mut self, erase: bool);
}

/// Failure reported by a [`BrokerClient`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BrokerError {
    NotConnected,
    Rejected,
    Transport,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Publish/subscribe broker session.
pub trait BrokerClient {
    /// Starts the broker handshake; completion is observed via `is_connected`.
    fn connect(&mut self);

    fn is_connected(&mut self) -> bool;

    /// Publishes one message.
    ///
    /// # Errors
    ///
    /// Fails when the session is down or the broker rejects the message.
    fn publish(&mut self, item: &PublishItem) -> Result<(), BrokerError>;

    /// Subscribes to a topic filter.
    ///
    /// # Errors
    ///
    /// Fails when the session is down or the broker rejects the filter.
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    fn disconnect(&mut self);

    /// Returns the next received message, if any.
    fn poll_inbound(&mut self) -> Option<InboundMessage>;
}

/// Timeouts and pacing for the connectivity machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NetTimings {
    pub quick_link_timeout: Duration,
    pub normal_link_timeout: Duration,
    pub normal_link_settle: Duration,
    pub app_timeout: Duration,
    pub health_check_interval: Duration,
    pub disconnect_grace: Duration,
    pub drain_timeout: Duration,
    pub retry_backoff: Duration,
    pub drain_per_poll: u8,
}

impl Default for NetTimings {
    fn default() -> Self {
        Self {
            quick_link_timeout: Duration::from_secs(5),
            normal_link_timeout: Duration::from_secs(20),
            normal_link_settle: Duration::from_millis(500),
            app_timeout: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(1),
            disconnect_grace: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(500),
            drain_per_poll: 2,
        }
    }
}

/// Internal phase of the connectivity machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectivityPhase {
    Idle,
    QuickLinkConnect,
    NormalLinkBegin,
    NormalLinkConnect,
    ConfirmQuickParams,
    LinkUp,
    AppConnect,
    FullyConnected,
    AwaitDisconnect,
}

impl ConnectivityPhase {
    /// Maps the phase onto the externally visible state.
    #[must_use]
    pub const fn link_state(self) -> LinkState {
        match self {
            ConnectivityPhase::Idle => LinkState::Disconnected,
            ConnectivityPhase::QuickLinkConnect => LinkState::LinkConnecting {
                mode: LinkMode::Quick,
            },
            ConnectivityPhase::NormalLinkBegin
            | ConnectivityPhase::NormalLinkConnect
            | ConnectivityPhase::ConfirmQuickParams => LinkState::LinkConnecting {
                mode: LinkMode::Normal,
            },
            ConnectivityPhase::LinkUp => LinkState::LinkUp,
            ConnectivityPhase::AppConnect => LinkState::AppConnecting,
            ConnectivityPhase::FullyConnected | ConnectivityPhase::AwaitDisconnect => {
                LinkState::FullyConnected
            }
        }
    }
}

/// Running totals kept for diagnostics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectivityCounters {
    pub quick_fallbacks: u32,
    pub link_timeouts: u32,
    pub app_timeouts: u32,
    pub link_losses: u32,
    pub delivered: u32,
    pub publish_failures: u32,
    pub discarded: u32,
    pub dropped_events: u32,
}

/// Failure of a direct [`ConnectivityManager::publish`] or `subscribe` call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionError {
    NotConnected,
    Broker(BrokerError),
    TooManySubscriptions,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Orchestrator-facing control surface of the connectivity worker.
pub trait LinkControl {
    /// Asks the worker to connect; observed on its next poll. A pending
    /// erase still runs first.
    fn request_connect(&mut self);

    /// Asks the worker to tear down; idempotent.
    fn request_disconnect(&mut self, erase: bool);

    fn link_state(&self) -> LinkState;

    /// Returns `true` once a requested teardown has completed.
    fn is_disconnected(&self) -> bool {
        self.link_state().is_disconnected()
    }

    /// Pops the next event produced by the worker.
    fn next_event(&mut self) -> Option<NetEvent>;

    /// Current quick-connect cache, mirrored into persisted state.
    fn quick_cache(&self) -> Option<LinkParams>;

    /// Seeds the quick-connect cache from persisted state.
    fn set_quick_cache(&mut self, params: Option<LinkParams>);

    /// Registers a topic filter subscribed on every session.
    ///
    /// # Errors
    ///
    /// Fails when the filter table is full.
    fn subscribe_on_session(&mut self, filter: &str) -> Result<(), SessionError>;
}

struct InFlight {
    item: PublishItem,
    attempts: u8,
}

/// Connectivity state machine driving one link driver and one broker client.
pub struct ConnectivityManager<I, W, B> {
    link: W,
    broker: B,
    timings: NetTimings,
    phase: ConnectivityPhase,
    phase_since: Option<I>,
    last_health_check: Option<I>,
    retry_at: Option<I>,
    drain_deadline: Option<I>,
    want_connected: bool,
    disconnect_requested: Option<bool>,
    quick_cache: Option<LinkParams>,
    candidate_params: Option<LinkParams>,
    in_flight: Option<InFlight>,
    subscriptions: Vec<Topic, MAX_SESSION_SUBSCRIPTIONS>,
    events: Deque<NetEvent, NET_EVENT_DEPTH>,
    counters: ConnectivityCounters,
}

impl<I, W, B> ConnectivityManager<I, W, B>
where
    I: Timestamp,
    W: LinkDriver,
    B: BrokerClient,
{
    /// Creates an idle manager seeded with the persisted quick-connect cache.
    pub fn new(link: W, broker: B, timings: NetTimings, quick_cache: Option<LinkParams>) -> Self {
        Self {
            link,
            broker,
            timings,
            phase: ConnectivityPhase::Idle,
            phase_since: None,
            last_health_check: None,
            retry_at: None,
            drain_deadline: None,
            want_connected: false,
            disconnect_requested: None,
            quick_cache,
            candidate_params: None,
            in_flight: None,
            subscriptions: Vec::new(),
            events: Deque::new(),
            counters: ConnectivityCounters::default(),
        }
    }

    pub const fn phase(&self) -> ConnectivityPhase {
        self.phase
    }

    pub const fn counters(&self) -> ConnectivityCounters {
        self.counters
    }

    pub const fn timings(&self) -> &NetTimings {
        &self.timings
    }

    pub fn link(&self) -> &W {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut W {
        &mut self.link
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    /// Returns `true` while a publish is waiting for the next session.
    pub const fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Registers a topic filter applied on every session establishment.
    ///
    /// # Errors
    ///
    /// Fails when the subscription table is full.
    pub fn add_session_subscription(&mut self, topic: &str) -> Result<(), SessionError> {
        let mut filter = Topic::new();
        filter
            .push_str(topic)
            .map_err(|_| SessionError::TooManySubscriptions)?;
        if self.subscriptions.iter().any(|existing| *existing == filter) {
            return Ok(());
        }
        self.subscriptions
            .push(filter)
            .map_err(|_| SessionError::TooManySubscriptions)?;
        if self.phase == ConnectivityPhase::FullyConnected {
            self.subscribe(topic)?;
        }
        Ok(())
    }

    /// Subscribes immediately; only valid while fully connected.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] outside `FullyConnected`.
    pub fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        if self.phase != ConnectivityPhase::FullyConnected {
            return Err(SessionError::NotConnected);
        }
        self.broker.subscribe(topic).map_err(SessionError::Broker)
    }

    /// Publishes from the worker's own context, bypassing the queue.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] outside `FullyConnected`.
    pub fn publish(&mut self, item: &PublishItem) -> Result<(), SessionError> {
        if self.phase != ConnectivityPhase::FullyConnected {
            return Err(SessionError::NotConnected);
        }
        self.broker.publish(item).map_err(SessionError::Broker)?;
        self.counters.delivered = self.counters.delivered.saturating_add(1);
        Ok(())
    }

    /// Advances the machine by one step.
    pub fn poll<Q: PublishQueueConsumer>(&mut self, now: I, queue: &mut Q) {
        self.pump_inbound();

        match self.phase {
            ConnectivityPhase::Idle => self.poll_idle(now, queue),
            ConnectivityPhase::QuickLinkConnect => {
                if self.disconnect_requested.is_some() {
                    self.abort(queue);
                } else if self.link.is_up() {
                    self.enter(ConnectivityPhase::LinkUp, now);
                } else if self.elapsed(now, self.timings.quick_link_timeout) {
                    self.counters.quick_fallbacks = self.counters.quick_fallbacks.saturating_add(1);
                    self.quick_cache = None;
                    self.link.disconnect(false);
                    self.enter(ConnectivityPhase::NormalLinkBegin, now);
                }
            }
            ConnectivityPhase::NormalLinkBegin => {
                if self.disconnect_requested.is_some() {
                    self.abort(queue);
                } else if self.elapsed(now, self.timings.normal_link_settle) {
                    self.link.begin(None);
                    self.enter(ConnectivityPhase::NormalLinkConnect, now);
                }
            }
            ConnectivityPhase::NormalLinkConnect => {
                if self.disconnect_requested.is_some() {
                    self.abort(queue);
                } else if self.link.is_up() {
                    if let Some(params) = self.link.current_params() {
                        self.candidate_params = Some(params);
                        self.link.disconnect(false);
                        self.link.begin(Some(&params));
                        self.enter(ConnectivityPhase::ConfirmQuickParams, now);
                    } else {
                        self.enter(ConnectivityPhase::LinkUp, now);
                    }
                } else if self.elapsed(now, self.timings.normal_link_timeout) {
                    self.counters.link_timeouts = self.counters.link_timeouts.saturating_add(1);
                    self.disconnect_and_retry(now);
                }
            }
            ConnectivityPhase::ConfirmQuickParams => {
                if self.disconnect_requested.is_some() {
                    self.abort(queue);
                } else if self.link.is_up() {
                    self.quick_cache = self.candidate_params.take();
                    self.enter(ConnectivityPhase::LinkUp, now);
                } else if self.elapsed(now, self.timings.normal_link_timeout) {
                    self.counters.link_timeouts = self.counters.link_timeouts.saturating_add(1);
                    self.candidate_params = None;
                    self.quick_cache = None;
                    self.link.disconnect(false);
                    self.enter(ConnectivityPhase::NormalLinkBegin, now);
                }
            }
            ConnectivityPhase::LinkUp => {
                if self.disconnect_requested.is_some() {
                    self.abort(queue);
                } else {
                    self.broker.connect();
                    self.enter(ConnectivityPhase::AppConnect, now);
                }
            }
            ConnectivityPhase::AppConnect => {
                if self.disconnect_requested.is_some() {
                    self.abort(queue);
                } else if self.broker.is_connected() {
                    self.establish_session(now);
                } else if self.elapsed(now, self.timings.app_timeout) {
                    self.counters.app_timeouts = self.counters.app_timeouts.saturating_add(1);
                    if self.link.is_up() {
                        self.broker.connect();
                        self.enter(ConnectivityPhase::AppConnect, now);
                    } else {
                        self.disconnect_and_retry(now);
                    }
                }
            }
            ConnectivityPhase::FullyConnected => self.poll_connected(now, queue),
            ConnectivityPhase::AwaitDisconnect => {
                // Late publishes (command echoes) still go out during the grace.
                self.drain(queue);
                if self.elapsed(now, self.timings.disconnect_grace) {
                    let erase = self.disconnect_requested.take().unwrap_or(false);
                    self.broker.disconnect();
                    self.link.disconnect(erase);
                    if erase {
                        self.erase(queue);
                    }
                    self.drain_deadline = None;
                    self.enter(ConnectivityPhase::Idle, now);
                }
            }
        }
    }

    fn poll_idle<Q: PublishQueueConsumer>(&mut self, now: I, queue: &mut Q) {
        if let Some(erase) = self.disconnect_requested.take() {
            self.link.disconnect(erase);
            if erase {
                self.erase(queue);
            }
            self.retry_at = None;
            return;
        }
        if !self.want_connected {
            return;
        }
        if self.retry_at.is_some_and(|at| now < at) {
            return;
        }
        self.retry_at = None;
        if let Some(params) = self.quick_cache {
            self.link.begin(Some(&params));
            self.enter(ConnectivityPhase::QuickLinkConnect, now);
        } else {
            self.enter(ConnectivityPhase::NormalLinkBegin, now);
        }
    }

    fn poll_connected<Q: PublishQueueConsumer>(&mut self, now: I, queue: &mut Q) {
        if self.disconnect_requested.is_some() {
            let deadline = *self
                .drain_deadline
                .get_or_insert(now + self.timings.drain_timeout);
            self.drain(queue);
            let drained = self.in_flight.is_none() && queue.is_drained();
            if drained || now >= deadline {
                self.enter(ConnectivityPhase::AwaitDisconnect, now);
            }
            return;
        }

        let check_due = self
            .last_health_check
            .is_none_or(|last| now.has_elapsed(last, self.timings.health_check_interval));
        if check_due {
            self.last_health_check = Some(now);
            if !self.link.is_up() {
                self.counters.link_losses = self.counters.link_losses.saturating_add(1);
                self.disconnect_and_retry(now);
                return;
            }
            if !self.broker.is_connected() {
                self.broker.connect();
                self.enter(ConnectivityPhase::AppConnect, now);
                return;
            }
        }

        self.drain(queue);
    }

    fn drain<Q: PublishQueueConsumer>(&mut self, queue: &mut Q) {
        for _ in 0..self.timings.drain_per_poll {
            let mut next = match self.in_flight.take() {
                Some(pending) => pending,
                None => match queue.try_dequeue() {
                    Ok(Some(item)) => InFlight { item, attempts: 0 },
                    Ok(None) | Err(_) => return,
                },
            };

            match self.broker.publish(&next.item) {
                Ok(()) => {
                    self.counters.delivered = self.counters.delivered.saturating_add(1);
                }
                Err(BrokerError::NotConnected | BrokerError::Transport) => {
                    self.counters.publish_failures =
                        self.counters.publish_failures.saturating_add(1);
                    self.in_flight = Some(next);
                    return;
                }
                Err(BrokerError::Rejected) => {
                    self.counters.publish_failures =
                        self.counters.publish_failures.saturating_add(1);
                    next.attempts = next.attempts.saturating_add(1);
                    if next.attempts >= MAX_PUBLISH_ATTEMPTS {
                        self.counters.discarded = self.counters.discarded.saturating_add(1);
                    } else {
                        self.in_flight = Some(next);
                    }
                    return;
                }
            }
        }
    }

    fn establish_session(&mut self, now: I) {
        self.enter(ConnectivityPhase::FullyConnected, now);
        self.last_health_check = Some(now);
        for topic in &self.subscriptions {
            if self.broker.subscribe(topic.as_str()).is_err() {
                self.counters.publish_failures = self.counters.publish_failures.saturating_add(1);
            }
        }
        self.push_event(NetEvent::SessionEstablished);
    }

    fn pump_inbound(&mut self) {
        if !matches!(
            self.phase,
            ConnectivityPhase::FullyConnected | ConnectivityPhase::AwaitDisconnect
        ) {
            return;
        }
        for _ in 0..INBOUND_PER_POLL {
            match self.broker.poll_inbound() {
                Some(message) => self.push_event(NetEvent::Message(message)),
                None => break,
            }
        }
    }

    fn push_event(&mut self, event: NetEvent) {
        if self.events.push_back(event).is_err() {
            self.counters.dropped_events = self.counters.dropped_events.saturating_add(1);
        }
    }

    /// Tears down both layers and schedules a reconnect after the backoff.
    fn disconnect_and_retry(&mut self, now: I) {
        self.broker.disconnect();
        self.link.disconnect(false);
        self.candidate_params = None;
        self.retry_at = Some(now + self.timings.retry_backoff);
        self.enter(ConnectivityPhase::Idle, now);
    }

    /// Honours a disconnect request while still connecting.
    fn abort<Q: PublishQueueConsumer>(&mut self, queue: &mut Q) {
        let erase = self.disconnect_requested.take().unwrap_or(false);
        if matches!(
            self.phase,
            ConnectivityPhase::AppConnect | ConnectivityPhase::LinkUp
        ) {
            self.broker.disconnect();
        }
        self.link.disconnect(erase);
        if erase {
            self.erase(queue);
        }
        self.candidate_params = None;
        self.retry_at = None;
        self.phase = ConnectivityPhase::Idle;
        self.phase_since = None;
    }

    fn erase<Q: PublishQueueConsumer>(&mut self, queue: &mut Q) {
        queue.clear();
        self.in_flight = None;
        self.quick_cache = None;
    }

    fn enter(&mut self, phase: ConnectivityPhase, now: I) {
        self.phase = phase;
        self.phase_since = Some(now);
    }

    fn elapsed(&self, now: I, window: Duration) -> bool {
        self.phase_since
            .is_none_or(|since| now.has_elapsed(since, window))
    }
}

impl<I, W, B> LinkControl for ConnectivityManager<I, W, B>
where
    I: Timestamp,
    W: LinkDriver,
    B: BrokerClient,
{
    fn request_connect(&mut self) {
        self.want_connected = true;
        // An erase still runs; the manager reconnects once it has finished.
        if self.disconnect_requested == Some(false) {
            self.disconnect_requested = None;
        }
    }

    fn request_disconnect(&mut self, erase: bool) {
        self.want_connected = false;
        let erase = erase || self.disconnect_requested.unwrap_or(false);
        self.disconnect_requested = Some(erase);
    }

    fn link_state(&self) -> LinkState {
        self.phase.link_state()
    }

    fn is_disconnected(&self) -> bool {
        self.phase == ConnectivityPhase::Idle && self.disconnect_requested.is_none()
    }

    fn next_event(&mut self) -> Option<NetEvent> {
        self.events.pop_front()
    }

    fn quick_cache(&self) -> Option<LinkParams> {
        self.quick_cache
    }

    fn set_quick_cache(&mut self, params: Option<LinkParams>) {
        self.quick_cache = params;
    }

    fn subscribe_on_session(&mut self, filter: &str) -> Result<(), SessionError> {
        self.add_session_subscription(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::{LocalPublishQueue, PublishQueueProducer};
    use crate::time::mock::MockInstant;

    const PARAMS: LinkParams = LinkParams {
        bssid: [0x10, 0x20, 0x30, 0x40, 0x50, 0x60],
        channel: 6,
    };

    #[derive(Default)]
    struct FakeLink {
        up: bool,
        accept_quick: bool,
        accept_normal: bool,
        begins: heapless::Vec<Option<LinkParams>, 16>,
        erased: bool,
    }

    impl LinkDriver for FakeLink {
        fn begin(&mut self, params: Option<&LinkParams>) {
            let _ = self.begins.push(params.copied());
            self.up = if params.is_some() {
                self.accept_quick
            } else {
                self.accept_normal
            };
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
    struct FakeBroker {
        connected: bool,
        refuse: bool,
        published: heapless::Vec<PublishItem, 16>,
        subscribed: heapless::Vec<Topic, 4>,
    }

    impl BrokerClient for FakeBroker {
        fn connect(&mut self) {
            self.connected = !self.refuse;
        }

        fn is_connected(&mut self) -> bool {
            self.connected
        }

        fn publish(&mut self, item: &PublishItem) -> Result<(), BrokerError> {
            if !self.connected {
                return Err(BrokerError::NotConnected);
            }
            self.published
                .push(item.clone())
                .map_err(|_| BrokerError::Rejected)
        }

        fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
            let mut filter = Topic::new();
            filter.push_str(topic).map_err(|_| BrokerError::Rejected)?;
            self.subscribed.push(filter).map_err(|_| BrokerError::Rejected)
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn poll_inbound(&mut self) -> Option<InboundMessage> {
            None
        }
    }

    type Manager = ConnectivityManager<MockInstant, FakeLink, FakeBroker>;

    fn manager(cache: Option<LinkParams>) -> Manager {
        let link = FakeLink {
            accept_quick: true,
            accept_normal: true,
            ..FakeLink::default()
        };
        ConnectivityManager::new(link, FakeBroker::default(), NetTimings::default(), cache)
    }

    fn run(manager: &mut Manager, queue: &mut LocalPublishQueue, start: u64, millis: u64) -> u64 {
        let mut now = start;
        while now <= start + millis {
            manager.poll(MockInstant::from_millis(now), queue);
            now += 10;
        }
        now
    }

    #[test]
    fn cold_connect_goes_through_confirm_and_fills_cache() {
        let mut manager = manager(None);
        let mut queue: LocalPublishQueue = LocalPublishQueue::new();
        manager.request_connect();
        run(&mut manager, &mut queue, 0, 1_000);

        assert_eq!(manager.link_state(), LinkState::FullyConnected);
        assert_eq!(manager.quick_cache(), Some(PARAMS));
        assert_eq!(manager.link().begins.as_slice(), &[None, Some(PARAMS)]);
        assert_eq!(manager.next_event(), Some(NetEvent::SessionEstablished));
    }

    #[test]
    fn quick_timeout_falls_back_once_and_invalidates_cache() {
        let mut manager = manager(Some(PARAMS));
        manager.link_mut().accept_quick = false;
        let mut queue: LocalPublishQueue = LocalPublishQueue::new();
        manager.request_connect();

        let now = run(&mut manager, &mut queue, 0, 100);
        assert_eq!(
            manager.link_state(),
            LinkState::LinkConnecting {
                mode: LinkMode::Quick
            }
        );

        run(&mut manager, &mut queue, now, 5_500);
        assert_eq!(manager.counters().quick_fallbacks, 1);
        assert_eq!(manager.quick_cache(), None);
        assert_eq!(
            manager.link_state(),
            LinkState::LinkConnecting {
                mode: LinkMode::Normal
            }
        );
    }

    #[test]
    fn normal_timeout_disconnects_and_retries() {
        let mut manager = manager(None);
        manager.link_mut().accept_normal = false;
        let mut queue: LocalPublishQueue = LocalPublishQueue::new();
        manager.request_connect();
        run(&mut manager, &mut queue, 0, 21_600);

        assert_eq!(manager.counters().link_timeouts, 1);
        assert_eq!(
            manager.link_state(),
            LinkState::LinkConnecting {
                mode: LinkMode::Normal
            }
        );
        assert_eq!(manager.link().begins.as_slice(), &[None, None]);
    }

    #[test]
    fn app_timeout_retries_while_link_is_up() {
        let mut manager = manager(Some(PARAMS));
        manager.broker_mut().refuse = true;
        let mut queue: LocalPublishQueue = LocalPublishQueue::new();
        manager.request_connect();
        run(&mut manager, &mut queue, 0, 15_200);

        assert_eq!(manager.counters().app_timeouts, 1);
        assert_eq!(manager.link_state(), LinkState::AppConnecting);
    }

    #[test]
    fn queued_items_survive_link_loss_in_order() {
        let mut manager = manager(Some(PARAMS));
        let mut queue: LocalPublishQueue = LocalPublishQueue::new();
        manager.request_connect();
        let now = run(&mut manager, &mut queue, 0, 100);
        assert_eq!(manager.link_state(), LinkState::FullyConnected);

        manager.link_mut().up = false;
        manager.broker_mut().connected = false;
        for topic in ["a", "b", "c"] {
            queue
                .try_enqueue(PublishItem::text(topic, "1", false).unwrap())
                .unwrap();
        }
        let now = run(&mut manager, &mut queue, now, 1_100);
        assert_eq!(manager.counters().link_losses, 1);
        assert!(manager.broker().published.is_empty());
        assert!(manager.has_in_flight());

        run(&mut manager, &mut queue, now, 1_000);
        assert_eq!(manager.link_state(), LinkState::FullyConnected);
        let topics: heapless::Vec<&str, 16> = manager
            .broker()
            .published
            .iter()
            .map(|item| item.topic.as_str())
            .collect();
        assert_eq!(topics.as_slice(), &["a", "b", "c"]);
    }

    #[test]
    fn disconnect_drains_queue_and_honours_erase() {
        let mut manager = manager(Some(PARAMS));
        let mut queue: LocalPublishQueue = LocalPublishQueue::new();
        manager.request_connect();
        let now = run(&mut manager, &mut queue, 0, 100);

        queue
            .try_enqueue(PublishItem::text("last", "1", true).unwrap())
            .unwrap();
        manager.request_disconnect(true);
        manager.request_disconnect(false);
        assert!(!manager.is_disconnected());
        run(&mut manager, &mut queue, now, 1_500);

        assert!(manager.is_disconnected());
        assert_eq!(
            manager.broker().published.last().map(|item| item.topic.as_str()),
            Some("last")
        );
        assert!(manager.link().erased);
        assert_eq!(manager.quick_cache(), None);
    }

    #[test]
    fn connect_keeps_a_pending_erase() {
        let mut manager = manager(Some(PARAMS));
        let mut queue: LocalPublishQueue = LocalPublishQueue::new();
        manager.request_connect();
        let now = run(&mut manager, &mut queue, 0, 100);
        assert_eq!(manager.link_state(), LinkState::FullyConnected);

        manager.request_disconnect(true);
        manager.request_connect();
        run(&mut manager, &mut queue, now, 3_000);

        assert!(manager.link().erased);
        assert_eq!(manager.link_state(), LinkState::FullyConnected);
        // The erase dropped the old cache; the reconnect went the normal way.
        assert_eq!(manager.link().begins.last(), Some(&Some(PARAMS)));
        assert_eq!(manager.link().begins.get(1), Some(&None));
    }

    #[test]
    fn connect_cancels_a_plain_disconnect() {
        let mut manager = manager(Some(PARAMS));
        let mut queue: LocalPublishQueue = LocalPublishQueue::new();
        manager.request_connect();
        let now = run(&mut manager, &mut queue, 0, 100);

        manager.request_disconnect(false);
        manager.request_connect();
        run(&mut manager, &mut queue, now, 1_000);

        assert!(!manager.link().erased);
        assert_eq!(manager.link_state(), LinkState::FullyConnected);
        assert_eq!(manager.link().begins.as_slice(), &[Some(PARAMS)]);
    }

    #[test]
    fn subscribe_only_when_fully_connected() {
        let mut manager = manager(Some(PARAMS));
        let mut queue: LocalPublishQueue = LocalPublishQueue::new();
        assert_eq!(manager.subscribe("x/#"), Err(SessionError::NotConnected));
        manager.add_session_subscription("home/cmd/#").unwrap();
        manager.request_connect();
        run(&mut manager, &mut queue, 0, 100);
        assert_eq!(manager.broker().subscribed.len(), 1);
        assert_eq!(manager.subscribe("x/#"), Ok(()));
    }
}
