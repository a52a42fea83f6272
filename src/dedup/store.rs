use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::RequestFingerprint;

/// What a completed provider call leaves behind for later duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupRecord {
    pub response: String,
    pub model_id: String,
    pub output_tokens: u64,
    /// Cost actually incurred by the original call
    pub cost: f64,
    /// What the original call would have cost without any cache policy
    pub naive_cost: f64,
}

/// A stored response. Callers always receive copies.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupEntry {
    pub response: String,
    pub model_id: String,
    pub output_tokens: u64,
    pub cost: f64,
    pub naive_cost: f64,
    pub created_at: Instant,
    pub hit_count: u64,
}

impl DedupEntry {
    fn from_record(record: DedupRecord, now: Instant) -> Self {
        Self {
            response: record.response,
            model_id: record.model_id,
            output_tokens: record.output_tokens,
            cost: record.cost,
            naive_cost: record.naive_cost,
            created_at: now,
            hit_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
enum FlightState {
    Pending,
    Resolved(DedupEntry),
    Abandoned,
}

#[derive(Debug)]
enum Slot {
    InFlight {
        tx: watch::Sender<FlightState>,
        started_at: Instant,
        flight_id: Uuid,
    },
    Ready {
        entry: DedupEntry,
        /// Fixed at creation; hits never extend it.
        expires_at: Instant,
    },
}

/// Result of a plain lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(DedupEntry),
    Miss,
}

/// Result of [`DedupStore::claim`].
#[derive(Debug)]
pub enum Claim {
    /// A live response already exists.
    Hit(DedupEntry),
    /// The caller owns the provider call for this fingerprint.
    Leader(FlightGuard),
    /// Another caller is resolving this fingerprint.
    Wait(FlightWaiter),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub ready: usize,
    pub in_flight: usize,
}

/// TTL-indexed response store with at most one in-flight call per fingerprint.
#[derive(Debug)]
pub struct DedupStore {
    entries: DashMap<RequestFingerprint, Slot>,
    ttl_ms: AtomicU64,
}

impl DedupStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ms: AtomicU64::new(ttl.as_millis() as u64),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    /// Change the TTL for entries created from now on.
    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(ttl.as_millis() as u64, Ordering::Relaxed);
    }

    /// Return a live entry, counting the hit. Expired entries are a miss even
    /// if the sweeper has not removed them yet.
    pub fn lookup(&self, fp: &RequestFingerprint, now: Instant) -> Lookup {
        match self.entries.get_mut(fp) {
            Some(mut slot) => match &mut *slot {
                Slot::Ready { entry, expires_at } if *expires_at > now => {
                    entry.hit_count += 1;
                    Lookup::Hit(entry.clone())
                }
                _ => Lookup::Miss,
            },
            None => Lookup::Miss,
        }
    }

    /// Store a response directly, resolving any in-flight call for the same key.
    pub fn put(&self, fp: &RequestFingerprint, record: DedupRecord, now: Instant) -> DedupEntry {
        let entry = DedupEntry::from_record(record, now);
        let slot = Slot::Ready {
            entry: entry.clone(),
            expires_at: now + self.ttl(),
        };
        if let Some(Slot::InFlight { tx, .. }) = self.entries.insert(fp.clone(), slot) {
            tx.send_replace(FlightState::Resolved(entry.clone()));
        }
        entry
    }

    /// Look up `fp` and, on a miss, either become the leader for it or join the
    /// call already in flight.
    pub fn claim(self: &Arc<Self>, fp: &RequestFingerprint, now: Instant) -> Claim {
        match self.entries.entry(fp.clone()) {
            Entry::Occupied(mut occupied) => {
                match occupied.get_mut() {
                    Slot::Ready { entry, expires_at } if *expires_at > now => {
                        entry.hit_count += 1;
                        return Claim::Hit(entry.clone());
                    }
                    Slot::InFlight { tx, .. } => {
                        return Claim::Wait(FlightWaiter {
                            store: Arc::downgrade(self),
                            fp: fp.clone(),
                            rx: tx.subscribe(),
                        });
                    }
                    Slot::Ready { .. } => {}
                }
                // Expired entry: take over the key
                let (guard, slot) = self.start_flight(fp, now);
                occupied.insert(slot);
                Claim::Leader(guard)
            }
            Entry::Vacant(vacant) => {
                let (guard, slot) = self.start_flight(fp, now);
                vacant.insert(slot);
                Claim::Leader(guard)
            }
        }
    }

    fn start_flight(self: &Arc<Self>, fp: &RequestFingerprint, now: Instant) -> (FlightGuard, Slot) {
        let flight_id = Uuid::new_v4();
        let (tx, _rx) = watch::channel(FlightState::Pending);
        debug!(fingerprint = %fp, %flight_id, "Dedup flight started");
        (
            FlightGuard {
                store: self.clone(),
                fp: fp.clone(),
                flight_id,
                resolved: false,
            },
            Slot::InFlight {
                tx,
                started_at: now,
                flight_id,
            },
        )
    }

    /// Remove expired entries and in-flight calls stuck for more than ten TTLs.
    ///
    /// Returns the number of slots removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let stale_after = self.ttl() * 10;
        let before = self.entries.len();
        self.entries.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::InFlight { started_at, .. } => now.duration_since(*started_at) <= stale_after,
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Swept dedup entries");
        }
        removed
    }

    pub fn stats(&self) -> DedupStats {
        let mut stats = DedupStats::default();
        for slot in self.entries.iter() {
            match slot.value() {
                Slot::Ready { .. } => stats.ready += 1,
                Slot::InFlight { .. } => stats.in_flight += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `sweep` every `interval` until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.sweep(Instant::now());
            }
        })
    }

    fn resolve(&self, fp: &RequestFingerprint, flight_id: Uuid, entry: DedupEntry) {
        let Some(mut slot) = self.entries.get_mut(fp) else {
            return;
        };
        if !matches!(&*slot, Slot::InFlight { flight_id: id, .. } if *id == flight_id) {
            return;
        }
        let expires_at = entry.created_at + self.ttl();
        let previous = std::mem::replace(
            &mut *slot,
            Slot::Ready {
                entry: entry.clone(),
                expires_at,
            },
        );
        if let Slot::InFlight { tx, .. } = previous {
            tx.send_replace(FlightState::Resolved(entry));
        }
    }

    fn abandon(&self, fp: &RequestFingerprint, flight_id: Uuid) {
        let removed = self.entries.remove_if(fp, |_, slot| {
            matches!(slot, Slot::InFlight { flight_id: id, .. } if *id == flight_id)
        });
        if let Some((_, Slot::InFlight { tx, .. })) = removed {
            tx.send_replace(FlightState::Abandoned);
        }
    }

    fn count_hit(&self, fp: &RequestFingerprint) {
        if let Some(mut slot) = self.entries.get_mut(fp) {
            if let Slot::Ready { entry, .. } = &mut *slot {
                entry.hit_count += 1;
            }
        }
    }
}

/// Held by the caller that owns the provider call for a fingerprint.
///
/// Dropping the guard without calling [`complete`](Self::complete) abandons
/// the flight so waiters can retry.
#[derive(Debug)]
pub struct FlightGuard {
    store: Arc<DedupStore>,
    fp: RequestFingerprint,
    flight_id: Uuid,
    resolved: bool,
}

impl FlightGuard {
    pub fn fingerprint(&self) -> &RequestFingerprint {
        &self.fp
    }

    /// Record the response and wake every waiter with a copy of it.
    pub fn complete(mut self, record: DedupRecord, now: Instant) -> DedupEntry {
        self.resolved = true;
        let entry = DedupEntry::from_record(record, now);
        self.store.resolve(&self.fp, self.flight_id, entry.clone());
        entry
    }

    /// Give up the flight; waiters will re-claim.
    pub fn abandon(mut self) {
        self.resolved = true;
        self.store.abandon(&self.fp, self.flight_id);
        debug!(fingerprint = %self.fp, flight_id = %self.flight_id, "Dedup flight abandoned");
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(
                fingerprint = %self.fp,
                flight_id = %self.flight_id,
                "Dedup flight dropped without resolution, releasing waiters"
            );
            self.store.abandon(&self.fp, self.flight_id);
        }
    }
}

/// Handle for a caller waiting on someone else's in-flight call.
#[derive(Debug)]
pub struct FlightWaiter {
    store: Weak<DedupStore>,
    fp: RequestFingerprint,
    rx: watch::Receiver<FlightState>,
}

impl FlightWaiter {
    /// Wait for the leader. `None` means the leader gave up and the caller
    /// should claim again.
    pub async fn wait(mut self) -> Option<DedupEntry> {
        loop {
            let state = self.rx.borrow_and_update().clone();
            match state {
                FlightState::Resolved(mut entry) => {
                    if let Some(store) = self.store.upgrade() {
                        store.count_hit(&self.fp);
                    }
                    entry.hit_count += 1;
                    return Some(entry);
                }
                FlightState::Abandoned => return None,
                FlightState::Pending => {}
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without a final value
                return match self.rx.borrow().clone() {
                    FlightState::Resolved(entry) => Some(entry),
                    _ => None,
                };
            }
        }
    }
}
