//! Request deduplication.
//!
//! Identical requests (same [`RequestFingerprint`]) are interchangeable. The
//! store keeps finished responses for a fixed TTL and guarantees that at most
//! one provider call is in flight per fingerprint: concurrent duplicates wait
//! for the first call and receive its response as a dedup hit.

mod fingerprint;
mod store;

pub use fingerprint::{normalize, ContextFingerprint, RequestFingerprint};
pub use store::{
    Claim, DedupEntry, DedupRecord, DedupStats, DedupStore, FlightGuard, FlightWaiter, Lookup,
};
