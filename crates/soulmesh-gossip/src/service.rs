//! The gossip service: publish, subscribe, receive and forward.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use soulmesh_overlay::{Frame, FrameKind, NeighborRegistry};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::dedup::RecentIds;
use crate::error::{Error, Result};
use crate::message::{GossipMessage, Priority, DEFAULT_MAX_HOPS};

/// Gossip settings.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Hop limit stamped on published messages.
    pub max_hops: u32,
    /// Upper bound honored on received messages regardless of their own `max_hops`.
    pub hop_ceiling: u32,
    pub ttl: Duration,
    /// Upper bound honored on received messages regardless of their own `ttl_ms`.
    pub ttl_ceiling: Duration,
    /// How far a message's timestamp may run ahead of the local clock.
    pub max_clock_skew: Duration,
    pub dedup_capacity: usize,
    /// Never shorter than `ttl_ceiling + max_clock_skew`; see [`GossipConfig::effective_dedup_window`].
    pub dedup_window: Duration,
    pub subscriber_queue: usize,
    /// How long a `Critical` message waits for space in a full subscriber queue.
    pub critical_wait: Duration,
    /// Realms this node belongs to. Zero or one realm means single-realm.
    pub realms: Vec<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            hop_ceiling: 8,
            ttl: Duration::from_secs(5 * 60),
            ttl_ceiling: Duration::from_secs(5 * 60),
            max_clock_skew: Duration::from_secs(30),
            dedup_capacity: 10_000,
            dedup_window: Duration::from_secs(10 * 60),
            subscriber_queue: 256,
            critical_wait: Duration::from_millis(100),
            realms: Vec::new(),
        }
    }
}

impl GossipConfig {
    pub fn with_realms(mut self, realms: Vec<String>) -> Self {
        self.realms = realms;
        self
    }

    pub fn with_max_hops(mut self, hops: u32) -> Self {
        self.max_hops = hops;
        self
    }

    pub fn with_subscriber_queue(mut self, capacity: usize) -> Self {
        self.subscriber_queue = capacity;
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    pub fn with_ttl_ceiling(mut self, ceiling: Duration) -> Self {
        self.ttl_ceiling = ceiling;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Ids are remembered at least as long as any accepted message stays live.
    pub fn effective_dedup_window(&self) -> Duration {
        self.dedup_window.max(self.ttl_ceiling + self.max_clock_skew)
    }

    fn is_multi_realm(&self) -> bool {
        self.realms.len() > 1
    }

    fn default_realm(&self) -> Option<String> {
        match self.realms.as_slice() {
            [only] => Some(only.to_ascii_lowercase()),
            _ => None,
        }
    }

    fn member_of(&self, realm: &str) -> bool {
        self.realms.iter().any(|r| r.eq_ignore_ascii_case(realm))
    }
}

/// What happened to a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Delivered to `delivered` subscribers and forwarded to `forwarded` neighbors.
    Accepted { delivered: usize, forwarded: usize },
    Duplicate,
    Expired,
    /// Timestamp too far ahead of the local clock.
    FutureDated,
    Malformed,
    /// Tagged with a realm this node is not part of.
    ForeignRealm,
    /// Untagged message on a multi-realm node.
    Untagged,
}

type Handler = Arc<dyn Fn(GossipMessage) + Send + Sync>;

struct Subscriber {
    message_type: String,
    /// Lowercased realm scope; `None` is the global scope.
    realm: Option<String>,
    tx: mpsc::Sender<GossipMessage>,
}

struct Inner {
    local_peer_id: String,
    registry: Arc<NeighborRegistry>,
    config: GossipConfig,
    seen: Mutex<RecentIds>,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_subscription: AtomicU64,
}

/// Floods realm-scoped messages across the neighbor registry.
#[derive(Clone)]
pub struct GossipService {
    inner: Arc<Inner>,
}

/// Handle returned by `subscribe`; dropping or disposing it unsubscribes.
pub struct Subscription {
    id: u64,
    service: Weak<Inner>,
    disposed: AtomicBool,
}

impl Subscription {
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.service.upgrade() {
            // Dropping the sender ends the worker once its queue drains.
            inner.write_subscribers().remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn write_subscribers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers.write().unwrap_or_else(|p| p.into_inner())
    }

    fn read_subscribers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn mark_seen(&self, msg: &GossipMessage, now_ms: u64) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        seen.insert(msg.id, now_ms)
    }
}

impl GossipService {
    pub fn new(
        local_peer_id: impl Into<String>,
        registry: Arc<NeighborRegistry>,
        config: GossipConfig,
    ) -> Self {
        let window = config.effective_dedup_window();
        let seen = RecentIds::new(config.dedup_capacity, window.as_millis() as u64);
        Self {
            inner: Arc::new(Inner {
                local_peer_id: local_peer_id.into(),
                registry,
                config,
                seen: Mutex::new(seen),
                subscribers: RwLock::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.inner.config
    }

    /// Build a message originated by this node with the configured hop/ttl limits.
    pub fn create_message(
        &self,
        message_type: impl Into<String>,
        payload: serde_json::Value,
        now_ms: u64,
    ) -> GossipMessage {
        GossipMessage::new(message_type, self.inner.local_peer_id.clone(), payload, now_ms)
            .with_max_hops(self.inner.config.max_hops)
            .with_ttl_ms(self.inner.config.ttl.as_millis() as u64)
    }

    /// Flood to every neighbor. Untagged messages on a single-realm node get
    /// that realm. Returns the number of neighbors that accepted the frame.
    pub fn publish(&self, mut message: GossipMessage, now_ms: u64) -> Result<usize> {
        if message.realm_id.is_none() {
            message.realm_id = self.inner.config.default_realm();
        }
        self.send_own(message, now_ms)
    }

    /// Flood within `realm`. The node must belong to the realm.
    pub fn publish_for_realm(
        &self,
        mut message: GossipMessage,
        realm: &str,
        now_ms: u64,
    ) -> Result<usize> {
        if !self.inner.config.member_of(realm) {
            return Err(Error::NotInRealm(realm.to_string()));
        }
        message.realm_id = Some(realm.to_string());
        self.send_own(message, now_ms)
    }

    fn send_own(&self, message: GossipMessage, now_ms: u64) -> Result<usize> {
        if !message.is_well_formed() {
            return Err(Error::Malformed);
        }
        // Our own flood must not come back to us as new.
        self.inner.mark_seen(&message, now_ms);
        let frame = Frame::new(FrameKind::Gossip, &message)?;
        let sent = self.inner.registry.broadcast_except(None, &frame);
        debug!(id = %message.id, kind = %message.message_type, sent, "gossip published");
        Ok(sent)
    }

    /// Subscribe to `message_type` in this node's default scope.
    pub fn subscribe<F>(&self, message_type: &str, handler: F) -> Subscription
    where
        F: Fn(GossipMessage) + Send + Sync + 'static,
    {
        let realm = self.inner.config.default_realm();
        self.add_subscriber(message_type, realm, Arc::new(handler))
    }

    /// Subscribe to `message_type` within `realm`.
    pub fn subscribe_for_realm<F>(&self, message_type: &str, realm: &str, handler: F) -> Subscription
    where
        F: Fn(GossipMessage) + Send + Sync + 'static,
    {
        self.add_subscriber(message_type, Some(realm.to_ascii_lowercase()), Arc::new(handler))
    }

    fn add_subscriber(&self, message_type: &str, realm: Option<String>, handler: Handler) -> Subscription {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<GossipMessage>(self.inner.config.subscriber_queue.max(1));

        let kind = message_type.to_string();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                    error!(kind = %kind, "gossip subscriber panicked");
                }
            }
        });

        self.inner.write_subscribers().insert(
            id,
            Subscriber {
                message_type: message_type.to_string(),
                realm,
                tx,
            },
        );
        Subscription {
            id,
            service: Arc::downgrade(&self.inner),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.read_subscribers().len()
    }

    /// Decode a gossip frame and run the receive path.
    pub async fn handle_frame(&self, from: &str, frame: &Frame, now_ms: u64) -> ReceiveOutcome {
        match frame.decode::<GossipMessage>() {
            Ok(message) => self.receive(message, Some(from), now_ms).await,
            Err(e) => {
                debug!(peer = %from, "undecodable gossip frame: {}", e);
                ReceiveOutcome::Malformed
            }
        }
    }

    /// Validate, dedup, deliver to local subscribers, then forward a copy.
    pub async fn receive(
        &self,
        message: GossipMessage,
        from: Option<&str>,
        now_ms: u64,
    ) -> ReceiveOutcome {
        let config = &self.inner.config;

        if !message.is_well_formed() {
            debug!(id = %message.id, "dropping malformed gossip");
            return ReceiveOutcome::Malformed;
        }
        if message.timestamp_ms > now_ms.saturating_add(config.max_clock_skew.as_millis() as u64) {
            debug!(id = %message.id, "dropping future-dated gossip");
            return ReceiveOutcome::FutureDated;
        }
        let ceiling = config.ttl_ceiling.as_millis() as u64;
        let message = if message.ttl_ms > ceiling {
            message.with_ttl_ms(ceiling)
        } else {
            message
        };
        if message.is_expired(now_ms) {
            trace!(id = %message.id, "dropping expired gossip");
            return ReceiveOutcome::Expired;
        }

        let scope = match message.realm_id.as_deref() {
            Some(realm) if config.member_of(realm) => Some(realm.to_ascii_lowercase()),
            Some(_) => return ReceiveOutcome::ForeignRealm,
            None if config.is_multi_realm() => return ReceiveOutcome::Untagged,
            None => config.default_realm(),
        };

        if !self.inner.mark_seen(&message, now_ms) {
            trace!(id = %message.id, "duplicate gossip");
            return ReceiveOutcome::Duplicate;
        }

        // Enqueue without blocking; critical messages that hit a full queue
        // get a bounded wait after forwarding.
        let mut delivered = 0;
        let mut waiting = Vec::new();
        {
            let subscribers = self.inner.read_subscribers();
            for sub in subscribers.values() {
                if sub.message_type != message.message_type || sub.realm != scope {
                    continue;
                }
                match sub.tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(msg)) => {
                        if message.metadata.priority == Priority::Critical {
                            waiting.push((sub.tx.clone(), msg));
                        } else {
                            warn!(kind = %message.message_type, "subscriber queue full, dropping gossip");
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }

        let effective_max = message.max_hops.min(config.hop_ceiling);
        let forwarded = if message.hop_count < effective_max && message.can_forward(now_ms) {
            match Frame::new(FrameKind::Gossip, &message.forwarded()) {
                Ok(frame) => self.inner.registry.broadcast_except(from, &frame),
                Err(e) => {
                    error!(id = %message.id, "failed to encode gossip: {}", e);
                    0
                }
            }
        } else {
            0
        };

        for (tx, msg) in waiting {
            match tokio::time::timeout(config.critical_wait, tx.send(msg)).await {
                Ok(Ok(())) => delivered += 1,
                _ => warn!(kind = %message.message_type, "subscriber queue full, dropping critical gossip"),
            }
        }

        ReceiveOutcome::Accepted { delivered, forwarded }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use soulmesh_overlay::CandidateConnection;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    const NOW: u64 = 1_000_000;

    fn service_with_neighbors(
        config: GossipConfig,
        neighbors: &[&str],
    ) -> (GossipService, Vec<mpsc::Receiver<Frame>>) {
        let registry = Arc::new(NeighborRegistry::default());
        let mut outboxes = Vec::new();
        for (i, peer) in neighbors.iter().enumerate() {
            let (tx, rx) = mpsc::channel(16);
            let addr = SocketAddr::from(([10, 0, 0, i as u8 + 1], 5000));
            registry.try_admit(CandidateConnection::new(*peer, addr).with_outbox(tx));
            outboxes.push(rx);
        }
        (GossipService::new("b3b3/local", registry, config), outboxes)
    }

    fn counter_sub(service: &GossipService, kind: &str) -> (Subscription, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = service.subscribe(kind, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (sub, count)
    }

    fn remote(kind: &str) -> GossipMessage {
        GossipMessage::new(kind, "b3b3/remote", json!({}), NOW)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn delivers_then_forwards_except_sender() {
        let (service, mut outboxes) = service_with_neighbors(GossipConfig::default(), &["a", "b", "c"]);
        let (_sub, count) = counter_sub(&service, "announce");

        let outcome = service.receive(remote("announce"), Some("a"), NOW).await;
        assert_eq!(outcome, ReceiveOutcome::Accepted { delivered: 1, forwarded: 2 });
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(outboxes[0].try_recv().is_err());
        let frame = outboxes[1].try_recv().unwrap();
        let copy: GossipMessage = frame.decode().unwrap();
        assert_eq!(copy.hop_count, 1);
        assert!(outboxes[2].try_recv().is_ok());
    }

    #[tokio::test]
    async fn duplicate_delivered_once() {
        let (service, _outboxes) = service_with_neighbors(GossipConfig::default(), &["a"]);
        let (_sub, count) = counter_sub(&service, "announce");
        let message = remote("announce");

        service.receive(message.clone(), Some("a"), NOW).await;
        let second = service.receive(message, Some("a"), NOW + 10).await;
        assert_eq!(second, ReceiveOutcome::Duplicate);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn at_hop_limit_delivered_but_not_forwarded() {
        let (service, mut outboxes) = service_with_neighbors(GossipConfig::default(), &["a", "b"]);
        let (_sub, count) = counter_sub(&service, "announce");
        let mut message = remote("announce");
        message.hop_count = message.max_hops;

        let outcome = service.receive(message, Some("a"), NOW).await;
        assert_eq!(outcome, ReceiveOutcome::Accepted { delivered: 1, forwarded: 0 });
        assert!(outboxes[1].try_recv().is_err());
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hop_ceiling_caps_remote_max_hops() {
        let (service, mut outboxes) = service_with_neighbors(GossipConfig::default(), &["a", "b"]);
        let mut message = remote("announce").with_max_hops(1000);
        message.hop_count = 8;
        service.receive(message, Some("a"), NOW).await;
        assert!(outboxes[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_ttl_cannot_outlive_dedup() {
        let (service, mut outboxes) = service_with_neighbors(GossipConfig::default(), &["a", "b"]);
        let (_sub, count) = counter_sub(&service, "announce");
        let message = remote("announce").with_ttl_ms(u64::MAX);

        let first = service.receive(message.clone(), Some("a"), NOW).await;
        assert_eq!(first, ReceiveOutcome::Accepted { delivered: 1, forwarded: 1 });
        let copy: GossipMessage = outboxes[1].try_recv().unwrap().decode().unwrap();
        assert_eq!(copy.ttl_ms, 300_000);

        // Past the ttl ceiling the message is expired rather than new again.
        let later = service.receive(message, Some("a"), NOW + 600_001).await;
        assert_eq!(later, ReceiveOutcome::Expired);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(outboxes[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn future_dated_messages_are_refused() {
        let (service, mut outboxes) = service_with_neighbors(GossipConfig::default(), &["a", "b"]);
        let (_sub, count) = counter_sub(&service, "announce");

        let ahead = GossipMessage::new("announce", "b3b3/remote", json!({}), NOW + 30_001);
        assert_eq!(service.receive(ahead, Some("a"), NOW).await, ReceiveOutcome::FutureDated);

        let within_skew = GossipMessage::new("announce", "b3b3/remote", json!({}), NOW + 30_000);
        let first = service.receive(within_skew.clone(), Some("a"), NOW).await;
        assert!(matches!(first, ReceiveOutcome::Accepted { delivered: 1, .. }));
        // Still remembered at the last moment the message is live.
        let last_live = NOW + 30_000 + 300_000 - 1;
        assert_eq!(service.receive(within_skew, Some("a"), last_live).await, ReceiveOutcome::Duplicate);

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(outboxes[1].try_recv().is_ok());
    }

    #[test]
    fn dedup_window_covers_ttl_ceiling_and_skew() {
        let short = GossipConfig::default().with_dedup_window(Duration::from_secs(1));
        assert_eq!(short.effective_dedup_window(), Duration::from_secs(330));
        let long = GossipConfig::default().with_dedup_window(Duration::from_secs(3600));
        assert_eq!(long.effective_dedup_window(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn expired_and_malformed_are_dropped() {
        let (service, mut outboxes) = service_with_neighbors(GossipConfig::default(), &["a", "b"]);
        let (_sub, count) = counter_sub(&service, "announce");

        let expired = remote("announce");
        let outcome = service.receive(expired, Some("a"), NOW + 300_000).await;
        assert_eq!(outcome, ReceiveOutcome::Expired);

        let mut malformed = remote("announce");
        malformed.originator_peer_id = String::new();
        assert_eq!(service.receive(malformed, Some("a"), NOW).await, ReceiveOutcome::Malformed);

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(outboxes[1].try_recv().is_err());
    }

    #[tokio::test]
    async fn realms_do_not_leak() {
        let config = GossipConfig::default().with_realms(vec!["Jazz".into(), "rock".into()]);
        let (service, _outboxes) = service_with_neighbors(config, &["a"]);

        let jazz = Arc::new(AtomicUsize::new(0));
        let rock = Arc::new(AtomicUsize::new(0));
        let (j, r) = (jazz.clone(), rock.clone());
        let _js = service.subscribe_for_realm("announce", "jazz", move |_| {
            j.fetch_add(1, Ordering::SeqCst);
        });
        let _rs = service.subscribe_for_realm("announce", "ROCK", move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        service.receive(remote("announce").with_realm("JAZZ"), Some("a"), NOW).await;
        assert_eq!(
            service.receive(remote("announce").with_realm("metal"), Some("a"), NOW).await,
            ReceiveOutcome::ForeignRealm
        );
        assert_eq!(
            service.receive(remote("announce"), Some("a"), NOW).await,
            ReceiveOutcome::Untagged
        );

        settle().await;
        assert_eq!(jazz.load(Ordering::SeqCst), 1);
        assert_eq!(rock.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_realm_treats_untagged_as_default() {
        let config = GossipConfig::default().with_realms(vec!["jazz".into()]);
        let (service, mut outboxes) = service_with_neighbors(config, &["a"]);
        let (_sub, count) = counter_sub(&service, "announce");

        let outcome = service.receive(remote("announce"), None, NOW).await;
        assert_eq!(outcome, ReceiveOutcome::Accepted { delivered: 1, forwarded: 1 });

        // publish stamps the default realm.
        let own = service.create_message("announce", json!({}), NOW);
        service.publish(own, NOW).unwrap();
        outboxes[0].try_recv().unwrap();
        let published: GossipMessage = outboxes[0].try_recv().unwrap().decode().unwrap();
        assert_eq!(published.realm_id.as_deref(), Some("jazz"));
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_for_foreign_realm_is_refused() {
        let (service, _outboxes) = service_with_neighbors(GossipConfig::default(), &["a"]);
        let message = service.create_message("announce", json!({}), NOW);
        assert!(matches!(
            service.publish_for_realm(message, "jazz", NOW),
            Err(Error::NotInRealm(_))
        ));
    }

    #[tokio::test]
    async fn own_message_echo_is_duplicate() {
        let (service, mut outboxes) = service_with_neighbors(GossipConfig::default(), &["a"]);
        let message = service.create_message("announce", json!({}), NOW);
        assert_eq!(service.publish(message, NOW).unwrap(), 1);
        let echoed: GossipMessage = outboxes[0].try_recv().unwrap().decode().unwrap();
        assert_eq!(service.receive(echoed, Some("a"), NOW).await, ReceiveOutcome::Duplicate);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let config = GossipConfig::default().with_subscriber_queue(1);
        let (service, _outboxes) = service_with_neighbors(config, &["a"]);
        // The worker cannot run until this task yields, so the queue of one fills.
        let _sub = service.subscribe("announce", |_| {});

        let mut delivered = 0;
        for _ in 0..5 {
            if let ReceiveOutcome::Accepted { delivered: d, .. } =
                service.receive(remote("announce"), Some("a"), NOW).await
            {
                delivered += d;
            }
        }
        assert!(delivered < 5);
    }

    #[tokio::test]
    async fn panicking_subscriber_is_contained() {
        let (service, _outboxes) = service_with_neighbors(GossipConfig::default(), &["a"]);
        let _bad = service.subscribe("announce", |_| panic!("subscriber bug"));
        let (_good, count) = counter_sub(&service, "announce");

        service.receive(remote("announce"), Some("a"), NOW).await;
        service.receive(remote("announce"), Some("a"), NOW).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disposed_subscription_stops_delivery() {
        let (service, _outboxes) = service_with_neighbors(GossipConfig::default(), &["a"]);
        let (sub, count) = counter_sub(&service, "announce");
        sub.dispose();
        sub.dispose();
        assert_eq!(service.subscriber_count(), 0);

        let outcome = service.receive(remote("announce"), Some("a"), NOW).await;
        assert_eq!(outcome, ReceiveOutcome::Accepted { delivered: 0, forwarded: 0 });
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
