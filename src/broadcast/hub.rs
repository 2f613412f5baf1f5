use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::analysis::PacketRecord;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Receiving end of a subscriber's bounded outbound channel.
pub type Outbound = mpsc::Receiver<Arc<PacketRecord>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// One viewer as seen by the hub: an id plus the sending half of its channel.
pub struct Subscriber {
    id: SubscriberId,
    sender: mpsc::Sender<Arc<PacketRecord>>,
}

impl Subscriber {
    /// Creates a subscriber with a fresh id and an outbound channel holding at
    /// most `capacity` records (at least one).
    pub fn channel(capacity: usize) -> (Subscriber, Outbound) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed));
        (Subscriber { id, sender }, receiver)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

struct SubscriberSlot {
    sender: mpsc::Sender<Arc<PacketRecord>>,
    delivered: u64,
    dropped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub records_published: u64,
    pub deliveries: u64,
    pub drops: u64,
    pub subscribers: usize,
}

/// Fans each record out to every registered subscriber without ever blocking
/// the publisher. A subscriber whose channel is full loses that record only.
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<SubscriberId, SubscriberSlot>>,
    records_published: AtomicU64,
    deliveries: AtomicU64,
    drops: AtomicU64,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            records_published: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<SubscriberId, SubscriberSlot>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, subscriber: Subscriber) -> SubscriberId {
        let id = subscriber.id;
        let slot = SubscriberSlot {
            sender: subscriber.sender,
            delivered: 0,
            dropped: 0,
        };
        let count = {
            let mut registry = self.registry();
            registry.insert(id, slot);
            registry.len()
        };
        debug!("Registered {} ({} active)", id, count);
        id
    }

    /// Removes a subscriber and closes its channel. Returns false if it was
    /// already gone.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.registry().remove(&id);
        match removed {
            Some(slot) => {
                debug!("Unregistered {} ({} delivered, {} dropped)", id, slot.delivered, slot.dropped);
                true
            },
            None => false,
        }
    }

    /// Unregisters everyone, returning how many subscribers were removed.
    pub fn unregister_all(&self) -> usize {
        let drained: Vec<(SubscriberId, SubscriberSlot)> = self.registry().drain().collect();
        for (id, slot) in &drained {
            debug!("Unregistered {} ({} delivered, {} dropped)", id, slot.delivered, slot.dropped);
        }
        drained.len()
    }

    pub fn publish(&self, record: PacketRecord) -> PublishOutcome {
        let record = Arc::new(record);
        let mut outcome = PublishOutcome::default();

        {
            let mut registry = self.registry();
            for slot in registry.values_mut() {
                match slot.sender.try_send(Arc::clone(&record)) {
                    Ok(()) => {
                        slot.delivered += 1;
                        outcome.delivered += 1;
                    },
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                        slot.dropped += 1;
                        outcome.dropped += 1;
                    },
                }
            }
        }

        self.records_published.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.drops.fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        outcome
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    pub fn is_registered(&self, id: SubscriberId) -> bool {
        self.registry().contains_key(&id)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            records_published: self.records_published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}
