//! Fallback across an ordered candidate list.
//!
//! Each candidate is tried at most once, in order. A retryable failure moves
//! on to the next candidate; a non-retryable one stops the walk. Failed
//! attempts are pushed into a shared `Arc<Mutex<Vec<AttemptRecord>>>` owned by
//! the caller so the history survives if the walk itself is cancelled.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub model: String,
    pub error: String,
    pub retryable: bool,
}

/// Something the walk can dispatch to.
pub trait Candidate {
    fn label(&self) -> String;
}

/// Errors that may or may not justify trying the next candidate.
pub trait Retryable: std::fmt::Display {
    fn is_retryable(&self) -> bool;
}

/// How the walk ended.
#[derive(Debug)]
pub enum DispatchOutcome<T, E> {
    /// Candidate at `index` succeeded.
    Completed { index: usize, value: T },
    /// Every candidate failed, or a non-retryable failure stopped the walk.
    Failed { last: E },
    /// The list was empty.
    NoCandidates,
}

/// Try `send` against each candidate in order until one succeeds.
pub async fn run_candidates<C, T, E, F, Fut>(
    candidates: &[C],
    attempts: Arc<Mutex<Vec<AttemptRecord>>>,
    send: F,
) -> DispatchOutcome<T, E>
where
    C: Candidate,
    E: Retryable,
    F: Fn(usize, &C) -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
{
    let mut last_error: Option<E> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        match send(index, candidate).await {
            Ok(value) => return DispatchOutcome::Completed { index, value },
            Err(err) => {
                let retryable = err.is_retryable();
                attempts
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(AttemptRecord {
                        model: candidate.label(),
                        error: err.to_string(),
                        retryable,
                    });

                if !retryable {
                    return DispatchOutcome::Failed { last: err };
                }
                tracing::warn!(
                    model = %candidate.label(),
                    error = %err,
                    remaining = candidates.len() - index - 1,
                    "Candidate failed, falling back"
                );
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(last) => DispatchOutcome::Failed { last },
        None => DispatchOutcome::NoCandidates,
    }
}

/// Render attempts as `model: error; model: error` for error messages.
pub fn format_attempts(attempts: &[AttemptRecord]) -> String {
    if attempts.is_empty() {
        return "no candidates attempted".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.model, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failed models in attempt order, for the `x-cachewise-retries` header.
///
/// Returns `None` if nothing failed.
pub fn format_retries_header(attempts: &[AttemptRecord]) -> Option<String> {
    if attempts.is_empty() {
        return None;
    }
    Some(
        attempts
            .iter()
            .map(|a| a.model.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    )
}
