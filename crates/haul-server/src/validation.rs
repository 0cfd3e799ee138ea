//! Debounced existence checks.
//!
//! Each connection owns a [`ValidationStream`]. Issuing a check bumps the
//! stream's sequence and cancels whatever lookup was in flight. A finished
//! lookup is delivered only if its sequence is still the newest, and the
//! compare and the delivery happen under the same lock as issuing, so a
//! stale result can never slip in after a newer check was issued.

use std::sync::Arc;
use std::time::Duration;

use haul_core::{ArtifactReference, HaulError};
use metrics::counter;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::VALIDATIONS_SUPERSEDED_TOTAL;
use crate::source::ArtifactSource;

/// Per-connection validation sequence.
#[derive(Debug, Default)]
pub struct ValidationStream {
    state: Mutex<StreamState>,
}

#[derive(Debug, Default)]
struct StreamState {
    latest: u64,
    in_flight: Option<CancellationToken>,
}

impl ValidationStream {
    /// Create an empty stream. The first issued sequence is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next sequence, cancelling the previous lookup.
    pub fn issue(&self) -> (u64, CancellationToken) {
        let mut state = self.state.lock();
        if let Some(previous) = state.in_flight.take() {
            previous.cancel();
        }
        state.latest += 1;
        let token = CancellationToken::new();
        state.in_flight = Some(token.clone());
        (state.latest, token)
    }

    /// Run `deliver` if `sequence` is still the newest issued. Returns `None`
    /// when it was superseded.
    pub fn deliver_if_current<T>(&self, sequence: u64, deliver: impl FnOnce() -> T) -> Option<T> {
        let mut state = self.state.lock();
        if sequence != state.latest {
            return None;
        }
        state.in_flight = None;
        Some(deliver())
    }

    /// Highest sequence issued so far.
    pub fn latest(&self) -> u64 {
        self.state.lock().latest
    }
}

/// Result of one debounced check.
#[derive(Debug)]
pub enum ValidationOutcome {
    /// The lookup finished while still the newest. `result` was delivered.
    Current {
        /// Sequence of this check.
        sequence: u64,
        /// Whether the reference exists, or why the lookup failed.
        result: Result<bool, HaulError>,
    },
    /// A newer check was issued first. Nothing was delivered.
    Superseded {
        /// Sequence of this check.
        sequence: u64,
    },
}

/// Existence lookups bounded by a timeout and debounced per stream.
pub struct ValidationDebouncer {
    source: Arc<dyn ArtifactSource>,
    timeout: Duration,
}

impl ValidationDebouncer {
    /// Create a debouncer over `source`.
    pub fn new(source: Arc<dyn ArtifactSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Single lookup with no debouncing.
    pub async fn lookup(&self, reference: &ArtifactReference) -> Result<bool, HaulError> {
        match tokio::time::timeout(self.timeout, self.source.exists(reference)).await {
            Ok(Ok(exists)) => Ok(exists),
            Ok(Err(error)) => Err(HaulError::LookupFailed {
                message: error.to_string(),
            }),
            Err(_) => Err(HaulError::LookupFailed {
                message: format!("lookup timed out after {}ms", self.timeout.as_millis()),
            }),
        }
    }

    /// Check `reference` on behalf of `stream`. `on_current` runs under the
    /// stream lock only if this check is still the newest when it finishes.
    pub async fn check_exists<F>(
        &self,
        stream: &ValidationStream,
        reference: &ArtifactReference,
        on_current: F,
    ) -> ValidationOutcome
    where
        F: FnOnce(u64, &Result<bool, HaulError>),
    {
        let (sequence, cancelled) = stream.issue();

        let result = tokio::select! {
            () = cancelled.cancelled() => None,
            result = self.lookup(reference) => Some(result),
        };

        let delivered = result.and_then(|result| {
            stream.deliver_if_current(sequence, || {
                on_current(sequence, &result);
                result
            })
        });

        match delivered {
            Some(result) => ValidationOutcome::Current { sequence, result },
            None => {
                debug!(sequence, %reference, "validation superseded");
                counter!(VALIDATIONS_SUPERSEDED_TOTAL).increment(1);
                ValidationOutcome::Superseded { sequence }
            }
        }
    }
}
