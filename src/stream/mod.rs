//! Per-session multi-subscriber broadcast.
//!
//! Each session owns a set of subscriber slots; publishing writes the event
//! to every slot's unbounded outbound queue. A write failure on one slot
//! removes only that subscriber — one slow or broken consumer cannot break
//! the others. Every subscription gets its own keep-alive ticker, and a
//! periodic sweep removes connections old enough to be presumed leaked.
//!
//! Delivery is in-memory and best-effort: events are lost on restart, and
//! reconnecting clients recover through catch-up replay (`last_event_id`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::StreamConfig;
use crate::message::Message;

/// An event delivered to stream subscribers.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Synthetic first frame for fresh (non-resuming) subscriptions.
    Connected,
    /// A chat message, in per-session publish order.
    Message(Message),
    /// Periodic frame defeating idle-timeout proxies.
    KeepAlive,
}

impl StreamEvent {
    /// SSE event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Message(_) => "message",
            Self::KeepAlive => "keep-alive",
        }
    }

    /// SSE event id, present only for message frames.
    #[must_use]
    pub fn event_id(&self) -> Option<i64> {
        match self {
            Self::Message(m) => Some(m.id),
            _ => None,
        }
    }

    /// SSE data payload.
    #[must_use]
    pub fn data_json(&self) -> String {
        match self {
            Self::Connected => r#"{"status":"connected"}"#.to_owned(),
            Self::KeepAlive => r#"{}"#.to_owned(),
            Self::Message(m) => serde_json::to_string(m).unwrap_or_else(|_| "{}".to_owned()),
        }
    }
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::UnboundedSender<StreamEvent>,
    connected_at: Instant,
    keepalive: JoinHandle<()>,
}

/// Per-session broadcast hub.
pub struct StreamBroker {
    sessions: Mutex<HashMap<i64, Vec<SubscriberSlot>>>,
    next_subscriber_id: AtomicU64,
    config: StreamConfig,
}

/// A live subscription. Dropping it releases the subscriber slot.
pub struct Subscription {
    session_id: i64,
    subscriber_id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    broker: Weak<StreamBroker>,
}

impl Subscription {
    /// Await the next event; `None` once the slot has been removed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    #[must_use]
    pub fn session_id(&self) -> i64 {
        self.session_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.remove_subscriber(self.session_id, self.subscriber_id);
        }
    }
}

impl StreamBroker {
    #[must_use]
    pub fn new(config: StreamConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            config,
        }
    }

    /// Register a new subscriber for a session.
    ///
    /// The returned [`Subscription`] owns the outbound queue; a dedicated
    /// keep-alive ticker feeds it until the slot is removed. Catch-up
    /// replay is the caller's job — the broker only carries live events.
    pub fn subscribe(self: &Arc<Self>, session_id: i64) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        let keepalive = tokio::spawn(keepalive_loop(
            Arc::downgrade(self),
            session_id,
            subscriber_id,
            tx.clone(),
            self.config.keepalive_interval(),
        ));

        let slot = SubscriberSlot {
            id: subscriber_id,
            tx,
            connected_at: Instant::now(),
            keepalive,
        };
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.entry(session_id).or_default().push(slot);
        }
        debug!(session = session_id, subscriber = subscriber_id, "stream subscriber added");

        Subscription {
            session_id,
            subscriber_id,
            rx,
            broker: Arc::downgrade(self),
        }
    }

    /// Fan an event out to every subscriber of a session, in publish order.
    ///
    /// Slots whose queue rejects the write are removed; the rest are
    /// unaffected.
    pub fn publish(&self, session_id: i64, event: &StreamEvent) {
        let mut dead = Vec::new();
        {
            let Ok(mut sessions) = self.sessions.lock() else {
                return;
            };
            let Some(slots) = sessions.get_mut(&session_id) else {
                return;
            };
            for slot in slots.iter() {
                if slot.tx.send(event.clone()).is_err() {
                    dead.push(slot.id);
                }
            }
            if !dead.is_empty() {
                slots.retain(|slot| {
                    let keep = !dead.contains(&slot.id);
                    if !keep {
                        slot.keepalive.abort();
                    }
                    keep
                });
                if slots.is_empty() {
                    sessions.remove(&session_id);
                }
            }
        }
        for id in dead {
            debug!(session = session_id, subscriber = id, "removed broken stream subscriber");
        }
    }

    /// Remove one subscriber slot, aborting its keep-alive ticker.
    pub fn remove_subscriber(&self, session_id: i64, subscriber_id: u64) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        if let Some(slots) = sessions.get_mut(&session_id) {
            slots.retain(|slot| {
                let keep = slot.id != subscriber_id;
                if !keep {
                    slot.keepalive.abort();
                }
                keep
            });
            if slots.is_empty() {
                sessions.remove(&session_id);
            }
        }
    }

    /// Number of live subscribers for one session.
    #[must_use]
    pub fn connection_count(&self, session_id: i64) -> usize {
        self.sessions
            .lock()
            .map(|s| s.get(&session_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Live subscriber counts per session (observability).
    #[must_use]
    pub fn connection_counts(&self) -> HashMap<i64, usize> {
        self.sessions
            .lock()
            .map(|s| s.iter().map(|(&sid, slots)| (sid, slots.len())).collect())
            .unwrap_or_default()
    }

    /// Periodic sweep removing subscribers whose connection age exceeds the
    /// staleness threshold — leaked handles from abnormally terminated
    /// clients. Runs until the token is cancelled.
    pub fn spawn_maintenance(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.config.idle_sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => broker.sweep_stale(),
                }
            }
            info!("stream broker maintenance stopped");
        })
    }

    fn sweep_stale(&self) {
        let stale_after = self.config.stale_after();
        let mut removed = 0usize;
        if let Ok(mut sessions) = self.sessions.lock() {
            for slots in sessions.values_mut() {
                slots.retain(|slot| {
                    let keep = slot.connected_at.elapsed() < stale_after;
                    if !keep {
                        slot.keepalive.abort();
                        removed += 1;
                    }
                    keep
                });
            }
            sessions.retain(|_, slots| !slots.is_empty());
        }
        if removed > 0 {
            info!(removed, "swept stale stream subscribers");
        }
    }
}

async fn keepalive_loop(
    broker: Weak<StreamBroker>,
    session_id: i64,
    subscriber_id: u64,
    tx: mpsc::UnboundedSender<StreamEvent>,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so keep-alives start one
    // interval after connect.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if tx.send(StreamEvent::KeepAlive).is_err() {
            if let Some(broker) = broker.upgrade() {
                broker.remove_subscriber(session_id, subscriber_id);
            }
            break;
        }
    }
}
