//! Synchronous driver fronts for the async radio and broker tasks.
//!
//! The connectivity manager calls its [`LinkDriver`] and [`BrokerClient`]
//! without awaiting. On the device both are mailboxes: calls post a command
//! that the Wi-Fi or MQTT task picks up, and the tasks report progress back
//! through atomics and a bounded inbound channel.

use button_core::connectivity::{BrokerClient, BrokerError, InboundMessage, LinkDriver, LinkParams};
use button_core::publish::{PublishItem, Topic};
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::net::{pack_params, unpack_params};
use crate::shared::SharedMutex;

/// Commands outstanding between the broker front and the MQTT task.
pub const BROKER_OUTBOX_DEPTH: usize = 6;
/// Received messages not yet pulled by the connectivity manager.
pub const BROKER_INBOX_DEPTH: usize = 4;

/// Request posted to the Wi-Fi task. A newer request replaces an unread one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WifiCommand {
    /// Associate; `Some` pins the access point and channel.
    Begin(Option<LinkParams>),
    Disconnect { erase: bool },
}

/// State shared between [`WifiLink`] and the Wi-Fi task.
pub struct WifiMailbox {
    commands: Signal<SharedMutex, WifiCommand>,
    up: AtomicBool,
    params: AtomicU64,
}

impl WifiMailbox {
    pub const fn new() -> Self {
        Self {
            commands: Signal::new(),
            up: AtomicBool::new(false),
            params: AtomicU64::new(0),
        }
    }

    pub const fn link(&self) -> WifiLink<'_> {
        WifiLink { mailbox: self }
    }

    /// Waits for the next request.
    pub async fn next_command(&self) -> WifiCommand {
        self.commands.wait().await
    }

    /// Returns a request posted since the last call, if any.
    pub fn try_command(&self) -> Option<WifiCommand> {
        self.commands.try_take()
    }

    /// Marks the station associated with an address.
    pub fn report_up(&self, params: Option<LinkParams>) {
        self.params.store(pack_params(params), Ordering::Release);
        self.up.store(true, Ordering::Release);
    }

    pub fn report_down(&self) {
        self.up.store(false, Ordering::Release);
    }
}

impl Default for WifiMailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// [`LinkDriver`] posting into a [`WifiMailbox`].
#[derive(Copy, Clone)]
pub struct WifiLink<'a> {
    mailbox: &'a WifiMailbox,
}

impl LinkDriver for WifiLink<'_> {
    fn begin(&mut self, params: Option<&LinkParams>) {
        self.mailbox.up.store(false, Ordering::Release);
        self.mailbox
            .commands
            .signal(WifiCommand::Begin(params.copied()));
    }

    fn is_up(&mut self) -> bool {
        self.mailbox.up.load(Ordering::Acquire)
    }

    fn current_params(&mut self) -> Option<LinkParams> {
        if self.is_up() {
            unpack_params(self.mailbox.params.load(Ordering::Acquire))
        } else {
            None
        }
    }

    fn disconnect(&mut self, erase: bool) {
        self.mailbox.up.store(false, Ordering::Release);
        self.mailbox
            .commands
            .signal(WifiCommand::Disconnect { erase });
    }
}

/// Request posted to the MQTT task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BrokerCommand {
    Connect,
    Publish(PublishItem),
    Subscribe(Topic),
    Disconnect,
}

/// State shared between [`BrokerLink`] and the MQTT task.
pub struct BrokerMailbox {
    outbox: Channel<SharedMutex, BrokerCommand, BROKER_OUTBOX_DEPTH>,
    inbox: Channel<SharedMutex, InboundMessage, BROKER_INBOX_DEPTH>,
    connected: AtomicBool,
    dropped_inbound: AtomicU32,
}

impl BrokerMailbox {
    pub const fn new() -> Self {
        Self {
            outbox: Channel::new(),
            inbox: Channel::new(),
            connected: AtomicBool::new(false),
            dropped_inbound: AtomicU32::new(0),
        }
    }

    pub const fn client(&self) -> BrokerLink<'_> {
        BrokerLink { mailbox: self }
    }

    pub async fn next_command(&self) -> BrokerCommand {
        self.outbox.receive().await
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Hands a received message to the connectivity manager. Messages beyond
    /// the inbox depth are counted and dropped.
    pub fn deliver(&self, message: InboundMessage) -> bool {
        let accepted = self.inbox.try_send(message).is_ok();
        if !accepted {
            self.dropped_inbound.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    pub fn dropped_inbound(&self) -> u32 {
        self.dropped_inbound.load(Ordering::Relaxed)
    }

    fn post(&self, command: BrokerCommand) -> Result<(), BrokerError> {
        self.outbox
            .try_send(command)
            .map_err(|_| BrokerError::Transport)
    }
}

impl Default for BrokerMailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// [`BrokerClient`] posting into a [`BrokerMailbox`].
#[derive(Copy, Clone)]
pub struct BrokerLink<'a> {
    mailbox: &'a BrokerMailbox,
}

impl BrokerClient for BrokerLink<'_> {
    fn connect(&mut self) {
        self.mailbox.set_connected(false);
        self.mailbox.outbox.clear();
        self.mailbox.inbox.clear();
        // Outbox was just cleared, so a slot is free.
        let _ = self.mailbox.post(BrokerCommand::Connect);
    }

    fn is_connected(&mut self) -> bool {
        self.mailbox.connected.load(Ordering::Acquire)
    }

    fn publish(&mut self, item: &PublishItem) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.mailbox.post(BrokerCommand::Publish(item.clone()))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let mut filter = Topic::new();
        filter.push_str(topic).map_err(|_| BrokerError::Rejected)?;
        self.mailbox.post(BrokerCommand::Subscribe(filter))
    }

    fn disconnect(&mut self) {
        self.mailbox.set_connected(false);
        self.mailbox.outbox.clear();
        let _ = self.mailbox.post(BrokerCommand::Disconnect);
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        self.mailbox.inbox.try_receive().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use button_core::publish::Payload;
    use embassy_futures::block_on;

    const PARAMS: LinkParams = LinkParams {
        bssid: [2, 4, 6, 8, 10, 12],
        channel: 1,
    };

    fn message(topic: &str) -> InboundMessage {
        let mut bounded = Topic::new();
        bounded.push_str(topic).expect("fits");
        InboundMessage {
            topic: bounded,
            payload: Payload::new(),
        }
    }

    #[test]
    fn wifi_link_posts_latest_request() {
        let mailbox = WifiMailbox::new();
        let mut link = mailbox.link();

        link.begin(Some(&PARAMS));
        link.disconnect(true);
        assert_eq!(
            block_on(mailbox.next_command()),
            WifiCommand::Disconnect { erase: true }
        );
        assert_eq!(mailbox.try_command(), None);
    }

    #[test]
    fn wifi_link_reports_params_only_while_up() {
        let mailbox = WifiMailbox::new();
        let mut link = mailbox.link();

        link.begin(None);
        assert_eq!(block_on(mailbox.next_command()), WifiCommand::Begin(None));
        assert!(!link.is_up());

        mailbox.report_up(Some(PARAMS));
        assert!(link.is_up());
        assert_eq!(link.current_params(), Some(PARAMS));

        mailbox.report_down();
        assert_eq!(link.current_params(), None);
    }

    #[test]
    fn broker_publish_requires_a_session() {
        let mailbox = BrokerMailbox::new();
        let mut client = mailbox.client();
        let item = PublishItem::text("a/b", "1", true).expect("fits");

        assert_eq!(client.publish(&item), Err(BrokerError::NotConnected));

        client.connect();
        assert_eq!(block_on(mailbox.next_command()), BrokerCommand::Connect);
        mailbox.set_connected(true);
        assert!(client.is_connected());

        assert_eq!(client.publish(&item), Ok(()));
        assert_eq!(client.subscribe("a/cmd/+"), Ok(()));
        assert_eq!(
            block_on(mailbox.next_command()),
            BrokerCommand::Publish(item)
        );
        assert!(matches!(
            block_on(mailbox.next_command()),
            BrokerCommand::Subscribe(filter) if filter.as_str() == "a/cmd/+"
        ));
    }

    #[test]
    fn full_outbox_reports_transport_error() {
        let mailbox = BrokerMailbox::new();
        let mut client = mailbox.client();
        client.connect();
        mailbox.set_connected(true);
        let item = PublishItem::text("t", "x", false).expect("fits");

        // Connect already holds one slot.
        for _ in 1..BROKER_OUTBOX_DEPTH {
            assert_eq!(client.publish(&item), Ok(()));
        }
        assert_eq!(client.publish(&item), Err(BrokerError::Transport));
    }

    #[test]
    fn disconnect_discards_pending_publishes() {
        let mailbox = BrokerMailbox::new();
        let mut client = mailbox.client();
        client.connect();
        mailbox.set_connected(true);
        let item = PublishItem::text("t", "x", false).expect("fits");
        assert_eq!(client.publish(&item), Ok(()));

        client.disconnect();
        assert!(!client.is_connected());
        assert_eq!(block_on(mailbox.next_command()), BrokerCommand::Disconnect);
    }

    #[test]
    fn inbox_overflow_is_counted() {
        let mailbox = BrokerMailbox::new();
        let mut client = mailbox.client();
        for _ in 0..BROKER_INBOX_DEPTH {
            assert!(mailbox.deliver(message("x/cmd/awake_mode")));
        }
        assert!(!mailbox.deliver(message("x/cmd/awake_mode")));
        assert_eq!(mailbox.dropped_inbound(), 1);
        assert!(client.poll_inbound().is_some());
    }
}
