//! Outbound publish queue shared between producers and the connectivity worker.
//!
//! The queue is the only multi-producer structure in the device. Producers see
//! it through [`PublishQueueProducer`], the connectivity worker drains it
//! through [`PublishQueueConsumer`]. Firmware backs both traits with an embassy
//! channel; [`LocalPublishQueue`] is the single-context implementation.

use core::{fmt, time::Duration};

use heapless::{Deque, String, Vec};

use crate::time::Timestamp;

/// Maximum topic length in bytes.
pub const MAX_TOPIC_LEN: usize = 128;
/// Maximum payload length in bytes.
pub const MAX_PAYLOAD_LEN: usize = 96;
/// Depth of the outbound queue.
pub const PUBLISH_QUEUE_DEPTH: usize = 4;
/// How long a producer keeps retrying a full queue before dropping.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

pub type Topic = String<MAX_TOPIC_LEN>;
pub type Payload = Vec<u8, MAX_PAYLOAD_LEN>;

/// Reasons a [`PublishItem`] cannot be built.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PublishItemError {
    EmptyTopic,
    TopicTooLong,
    PayloadTooLong,
}

impl fmt::Display for PublishItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A message waiting to be published.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishItem {
    pub topic: Topic,
    pub payload: Payload,
    pub retained: bool,
}

impl PublishItem {
    /// Copies `topic` and `payload` into a bounded item.
    ///
    /// # Errors
    ///
    /// Fails when the topic is empty or either part exceeds its capacity.
    pub fn new(topic: &str, payload: &[u8], retained: bool) -> Result<Self, PublishItemError> {
        if topic.is_empty() {
            return Err(PublishItemError::EmptyTopic);
        }
        let mut bounded_topic = Topic::new();
        bounded_topic
            .push_str(topic)
            .map_err(|_| PublishItemError::TopicTooLong)?;
        let payload = Payload::from_slice(payload).map_err(|_| PublishItemError::PayloadTooLong)?;
        Ok(Self {
            topic: bounded_topic,
            payload,
            retained,
        })
    }

    /// Convenience for text payloads.
    ///
    /// # Errors
    ///
    /// See [`PublishItem::new`].
    pub fn text(topic: &str, payload: &str, retained: bool) -> Result<Self, PublishItemError> {
        Self::new(topic, payload.as_bytes(), retained)
    }
}

/// Error surfaced when an item cannot be enqueued.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PublishEnqueueError<E = ()> {
    /// Queue has reached its maximum capacity.
    QueueFull,
    /// Queue has been disconnected from its consumer.
    Disconnected,
    /// Transport-specific failure.
    Other(E),
}

/// Error surfaced when dequeueing fails.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PublishDequeueError<E = ()> {
    /// Queue has been disconnected from its producers.
    Disconnected,
    /// Transport-specific failure.
    Other(E),
}

/// Producer side of the publish queue.
pub trait PublishQueueProducer {
    /// Transport-specific error type.
    type Error;

    /// Attempts to enqueue an item without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PublishEnqueueError::QueueFull`] when no slot is free.
    fn try_enqueue(&mut self, item: PublishItem) -> Result<(), PublishEnqueueError<Self::Error>>;

    /// Returns the queue capacity if it is known.
    fn capacity(&self) -> Option<usize> {
        None
    }

    /// Returns the current queue depth if it can be observed.
    fn len(&self) -> Option<usize> {
        None
    }

    /// Returns `true` when the queue reports that it holds no items.
    fn is_empty(&self) -> Option<bool> {
        self.len().map(|current| current == 0)
    }
}

/// Consumer side of the publish queue; owned by the connectivity worker.
pub trait PublishQueueConsumer {
    /// Transport-specific error type.
    type Error;

    /// Attempts to dequeue the oldest item without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport has failed.
    fn try_dequeue(&mut self) -> Result<Option<PublishItem>, PublishDequeueError<Self::Error>>;

    /// Returns `true` when nothing is queued.
    fn is_drained(&self) -> bool;

    /// Discards everything queued.
    fn clear(&mut self);
}

/// Bounded FIFO usable when producer and consumer share one context.
#[derive(Clone, Debug)]
pub struct LocalPublishQueue<const N: usize = PUBLISH_QUEUE_DEPTH> {
    items: Deque<PublishItem, N>,
}

impl<const N: usize> LocalPublishQueue<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            items: Deque::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PublishItem> {
        self.items.iter()
    }
}

impl<const N: usize> Default for LocalPublishQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PublishQueueProducer for LocalPublishQueue<N> {
    type Error = ();

    fn try_enqueue(&mut self, item: PublishItem) -> Result<(), PublishEnqueueError> {
        self.items
            .push_back(item)
            .map_err(|_| PublishEnqueueError::QueueFull)
    }

    fn capacity(&self) -> Option<usize> {
        Some(N)
    }

    fn len(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

impl<const N: usize> PublishQueueConsumer for LocalPublishQueue<N> {
    type Error = ();

    fn try_dequeue(&mut self) -> Result<Option<PublishItem>, PublishDequeueError> {
        Ok(self.items.pop_front())
    }

    fn is_drained(&self) -> bool {
        self.items.is_empty()
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

/// Result of one [`Outbox::flush`] pass.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FlushReport {
    pub enqueued: u8,
    pub dropped: u8,
}

struct Pending<I> {
    item: PublishItem,
    first_attempt: Option<I>,
}

/// Producer-side staging buffer.
///
/// Items that meet a full queue stay here and are retried on later flushes;
/// once an item has waited `enqueue_timeout` it is dropped and counted.
pub struct Outbox<I, const N: usize = 12> {
    pending: Deque<Pending<I>, N>,
    enqueue_timeout: Duration,
    dropped_total: u32,
}

impl<I: Timestamp, const N: usize> Outbox<I, N> {
    #[must_use]
    pub const fn new(enqueue_timeout: Duration) -> Self {
        Self {
            pending: Deque::new(),
            enqueue_timeout,
            dropped_total: 0,
        }
    }

    /// Stages an item; returns it back when the outbox itself is full.
    ///
    /// # Errors
    ///
    /// Hands the item back when no staging slot is free.
    pub fn push(&mut self, item: PublishItem) -> Result<(), PublishItem> {
        self.pending
            .push_back(Pending {
                item,
                first_attempt: None,
            })
            .map_err(|pending| pending.item)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub const fn dropped_total(&self) -> u32 {
        self.dropped_total
    }

    /// Discards every staged item without counting them as drops.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Moves staged items into `queue` in order.
    pub fn flush<P: PublishQueueProducer>(&mut self, now: I, queue: &mut P) -> FlushReport {
        let mut report = FlushReport::default();
        while let Some(front) = self.pending.front_mut() {
            let started = *front.first_attempt.get_or_insert(now);
            match queue.try_enqueue(front.item.clone()) {
                Ok(()) => {
                    self.pending.pop_front();
                    report.enqueued = report.enqueued.saturating_add(1);
                }
                Err(PublishEnqueueError::QueueFull) => {
                    if now.has_elapsed(started, self.enqueue_timeout) {
                        self.pending.pop_front();
                        self.dropped_total = self.dropped_total.saturating_add(1);
                        report.dropped = report.dropped.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(PublishEnqueueError::Disconnected | PublishEnqueueError::Other(_)) => {
                    self.pending.pop_front();
                    self.dropped_total = self.dropped_total.saturating_add(1);
                    report.dropped = report.dropped.saturating_add(1);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::mock::MockInstant;

    fn item(topic: &str) -> PublishItem {
        PublishItem::text(topic, "PRESS", false).unwrap()
    }

    #[test]
    fn rejects_empty_and_oversized_topics() {
        assert_eq!(
            PublishItem::text("", "x", false),
            Err(PublishItemError::EmptyTopic)
        );
        let long = [b'a'; MAX_TOPIC_LEN + 1];
        let long = core::str::from_utf8(&long).unwrap();
        assert_eq!(
            PublishItem::text(long, "x", false),
            Err(PublishItemError::TopicTooLong)
        );
    }

    #[test]
    fn local_queue_is_bounded_fifo() {
        let mut queue: LocalPublishQueue<2> = LocalPublishQueue::new();
        queue.try_enqueue(item("a")).unwrap();
        queue.try_enqueue(item("b")).unwrap();
        assert_eq!(
            queue.try_enqueue(item("c")),
            Err(PublishEnqueueError::QueueFull)
        );
        assert_eq!(queue.try_dequeue().unwrap().unwrap().topic.as_str(), "a");
        assert_eq!(queue.try_dequeue().unwrap().unwrap().topic.as_str(), "b");
        assert_eq!(queue.try_dequeue(), Ok(None));
    }

    #[test]
    fn outbox_retries_then_drops_after_timeout() {
        let mut queue: LocalPublishQueue<1> = LocalPublishQueue::new();
        let mut outbox: Outbox<MockInstant, 4> = Outbox::new(Duration::from_millis(100));
        outbox.push(item("first")).unwrap();
        outbox.push(item("second")).unwrap();

        let report = outbox.flush(MockInstant::from_millis(0), &mut queue);
        assert_eq!(report, FlushReport { enqueued: 1, dropped: 0 });
        assert_eq!(outbox.len(), 1);

        let report = outbox.flush(MockInstant::from_millis(50), &mut queue);
        assert_eq!(report, FlushReport::default());

        let report = outbox.flush(MockInstant::from_millis(100), &mut queue);
        assert_eq!(report, FlushReport { enqueued: 0, dropped: 1 });
        assert!(outbox.is_empty());
        assert_eq!(outbox.dropped_total(), 1);
    }

    #[test]
    fn outbox_preserves_order_when_queue_drains() {
        let mut queue: LocalPublishQueue<1> = LocalPublishQueue::new();
        let mut outbox: Outbox<MockInstant, 4> = Outbox::new(DEFAULT_ENQUEUE_TIMEOUT);
        for topic in ["t1", "t2", "t3"] {
            outbox.push(item(topic)).unwrap();
        }
        let mut delivered = heapless::Vec::<Topic, 4>::new();
        for step in 0..3 {
            outbox.flush(MockInstant::from_millis(step * 10), &mut queue);
            if let Ok(Some(next)) = queue.try_dequeue() {
                delivered.push(next.topic).unwrap();
            }
        }
        let order: heapless::Vec<&str, 4> = delivered.iter().map(Topic::as_str).collect();
        assert_eq!(order.as_slice(), &["t1", "t2", "t3"]);
    }
}
