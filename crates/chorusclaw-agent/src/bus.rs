//! Message bus: fan-out of channel traffic to every bot, fan-in of replies.
//!
//! Every subscribed bot owns a bounded [`Mailbox`]. `publish_inbound` copies
//! an event into each live mailbox except the author's own, without ever
//! blocking the transport. Replies from all bots funnel through
//! `publish_outbound`, which holds a single lock around the transport sink.

use chorusclaw_core::{InboundEvent, OutboundMessage, SubscriptionId, TransportError};
use chorusclaw_tools::ChannelPoster;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Delivers outbound messages to the real channel.
#[async_trait::async_trait]
pub trait TransportSink: Send + Sync {
    /// Post `msg` attributed to `msg.bot_name`.
    async fn send(&self, msg: &OutboundMessage) -> Result<(), TransportError>;
}

struct MailboxInner {
    id: SubscriptionId,
    bot_name: String,
    queue: Mutex<VecDeque<InboundEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl MailboxInner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<InboundEvent>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue, evicting the oldest unread event when full. Returns true on eviction.
    fn push(&self, event: InboundEvent) -> bool {
        let evicted = {
            let mut q = self.queue();
            let evicted = if q.len() >= self.capacity {
                q.pop_front().is_some()
            } else {
                false
            };
            q.push_back(event);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One bot's inbox. Single consumer.
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl Mailbox {
    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    pub fn bot_name(&self) -> &str {
        &self.inner.bot_name
    }

    /// Wait for the next event. Returns `None` once the mailbox is closed and drained.
    pub async fn recv(&self) -> Option<InboundEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.inner.is_closed() {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<InboundEvent> {
        self.inner.queue().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events evicted from this mailbox because it was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.inner.id)
            .field("bot", &self.inner.bot_name)
            .field("len", &self.len())
            .finish()
    }
}

pub struct MessageBus {
    subscribers: DashMap<SubscriptionId, Arc<MailboxInner>>,
    next_id: AtomicU64,
    capacity: usize,
    sink: Arc<dyn TransportSink>,
    outbound_lock: tokio::sync::Mutex<()>,
    outbound_count: AtomicU64,
    dropped_by_bot: DashMap<String, u64>,
    loopback: bool,
}

impl MessageBus {
    pub fn new(sink: Arc<dyn TransportSink>, mailbox_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity: mailbox_capacity.max(1),
            sink,
            outbound_lock: tokio::sync::Mutex::new(()),
            outbound_count: AtomicU64::new(0),
            dropped_by_bot: DashMap::new(),
            loopback: false,
        }
    }

    /// Re-publish every delivered reply as an inbound event so the other bots
    /// see it. For transports that do not echo bot posts back themselves.
    pub fn with_loopback(mut self, enabled: bool) -> Self {
        self.loopback = enabled;
        self
    }

    pub fn subscribe(&self, bot_name: &str) -> Mailbox {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let inner = Arc::new(MailboxInner {
            id,
            bot_name: bot_name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.subscribers.insert(id, inner.clone());
        debug!(bot = %bot_name, subscription = %id, "subscribed");
        Mailbox { inner }
    }

    /// Remove and close a mailbox. A pending `recv` wakes up with `None`.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, inner)) => {
                inner.close();
                debug!(bot = %inner.bot_name, subscription = %id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Copy `event` into every live mailbox except its author's. Never blocks.
    pub fn publish_inbound(&self, event: InboundEvent) -> usize {
        let targets: Vec<Arc<MailboxInner>> = self
            .subscribers
            .iter()
            .filter(|entry| !entry.is_closed() && !event.is_own_echo(&entry.bot_name))
            .map(|entry| entry.value().clone())
            .collect();

        for mailbox in &targets {
            if mailbox.push(event.clone()) {
                self.record_drop(&mailbox.bot_name);
            }
        }
        debug!(event = %event.event_id, deliveries = targets.len(), "inbound published");
        targets.len()
    }

    /// Deliver to one bot's live mailbox only.
    pub fn deliver_to_bot(&self, bot_name: &str, event: InboundEvent) -> bool {
        let target = self
            .subscribers
            .iter()
            .find(|entry| entry.bot_name == bot_name && !entry.is_closed())
            .map(|entry| entry.value().clone());

        match target {
            Some(mailbox) => {
                if mailbox.push(event) {
                    self.record_drop(bot_name);
                }
                true
            }
            None => {
                warn!(bot = %bot_name, "no live mailbox for direct delivery");
                false
            }
        }
    }

    /// Hand a reply to the transport. Calls are serialized, so each bot's
    /// replies reach the channel in the order it published them.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), TransportError> {
        let _guard = self.outbound_lock.lock().await;
        if let Err(e) = self.sink.send(&msg).await {
            error!(bot = %msg.bot_name, channel = %msg.target_channel_id, error = %e, "outbound rejected");
            return Err(e);
        }
        self.outbound_count.fetch_add(1, Ordering::Relaxed);
        if self.loopback {
            self.publish_inbound(InboundEvent::from_bot(
                msg.target_channel_id.clone(),
                msg.bot_name.clone(),
                msg.text.clone(),
            ));
        }
        Ok(())
    }

    fn record_drop(&self, bot_name: &str) {
        *self.dropped_by_bot.entry(bot_name.to_string()).or_insert(0) += 1;
        warn!(bot = %bot_name, "mailbox full, dropped oldest event");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Total events dropped for `bot_name` across all its subscriptions.
    pub fn dropped_for(&self, bot_name: &str) -> u64 {
        self.dropped_by_bot.get(bot_name).map(|v| *v).unwrap_or(0)
    }

    pub fn outbound_count(&self) -> u64 {
        self.outbound_count.load(Ordering::Relaxed)
    }

    /// Close every mailbox.
    pub fn close_all(&self) {
        let ids: Vec<SubscriptionId> = self.subscribers.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.unsubscribe(id);
        }
    }
}

#[async_trait::async_trait]
impl ChannelPoster for MessageBus {
    async fn post(&self, msg: OutboundMessage) -> Result<(), TransportError> {
        self.publish_outbound(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    #[async_trait::async_trait]
    impl TransportSink for NullSink {
        async fn send(&self, _msg: &OutboundMessage) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let bus = MessageBus::new(Arc::new(NullSink), 2);
        let mb = bus.subscribe("a");
        for i in 0..3 {
            bus.publish_inbound(InboundEvent::human("c", "u", "U", format!("m{}", i)));
        }
        assert_eq!(mb.dropped(), 1);
        assert_eq!(bus.dropped_for("a"), 1);
        assert_eq!(mb.recv().await.unwrap().text, "m1");
        assert_eq!(mb.recv().await.unwrap().text, "m2");
    }

    #[tokio::test]
    async fn unsubscribe_wakes_pending_recv() {
        let bus = Arc::new(MessageBus::new(Arc::new(NullSink), 4));
        let mb = bus.subscribe("a");
        let id = mb.id();
        let waiter = tokio::spawn(async move { mb.recv().await });
        tokio::task::yield_now().await;
        assert!(bus.unsubscribe(id));
        assert!(waiter.await.unwrap().is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn loopback_reaches_other_bots_only() {
        let bus = MessageBus::new(Arc::new(NullSink), 4).with_loopback(true);
        let a = bus.subscribe("a");
        let b = bus.subscribe("b");
        bus.publish_outbound(OutboundMessage::new("a", "c", "hello"))
            .await
            .unwrap();
        assert!(a.is_empty());
        let echoed = b.try_recv().unwrap();
        assert!(echoed.is_self_origin);
        assert_eq!(echoed.sender_id, "a");
        assert_eq!(bus.outbound_count(), 1);
    }
}
