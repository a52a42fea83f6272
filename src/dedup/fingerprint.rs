//! Request and context fingerprints.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::request::RoutableRequest;

/// Digest identifying interchangeable requests. Key of the dedup store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

/// Digest of the context segment alone, shared across user turns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextFingerprint(String);

impl RequestFingerprint {
    pub fn of(request: &RoutableRequest) -> Self {
        let mut hasher = Sha256::new();
        field(&mut hasher, request.model.as_deref().unwrap_or("auto"));
        field(
            &mut hasher,
            request.capability_hint.map(|t| t.as_str()).unwrap_or("-"),
        );
        field(&mut hasher, &normalize(&request.context));
        field(&mut hasher, &normalize(&request.user_input));

        let s = &request.sampling;
        field(&mut hasher, &format!("{:?}", s.temperature.map(f32::to_bits)));
        field(&mut hasher, &format!("{:?}", s.top_p.map(f32::to_bits)));
        field(&mut hasher, &format!("{:?}", s.max_output_tokens));
        hasher.update((s.stop.len() as u64).to_le_bytes());
        for stop in &s.stop {
            field(&mut hasher, stop);
        }

        if let Some(key) = &request.idempotency_key {
            field(&mut hasher, key);
        }

        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ContextFingerprint {
    pub fn of(context: &str) -> Self {
        let mut hasher = Sha256::new();
        field(&mut hasher, &normalize(context));
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0[..16])
    }
}

impl std::fmt::Display for ContextFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0[..16])
    }
}

/// Length-prefixed so ("ab", "c") and ("a", "bc") hash differently.
fn field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

/// Collapse whitespace runs and trim, so formatting-only differences dedupe.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
