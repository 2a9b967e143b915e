//! Waits for pending archive writes before a query runs.
//!
//! A message that was just sent may still sit in an archiver queue when its
//! sender queries the archive. The gate asks every archiver how long until
//! everything queued up to now is stored and sleeps that long, bounded.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::archiver::EtaSource;
use crate::metrics;

/// How a gate wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Nothing was pending
    Ready,
    /// Waited out the full ETA
    Waited(Duration),
    /// The ETA exceeded the bound; waited the bound only
    Bounded(Duration),
    /// Cancelled before the ETA passed
    Interrupted(Duration),
}

impl GateOutcome {
    /// Whether results may be missing recently archived messages.
    pub fn possibly_incomplete(&self) -> bool {
        matches!(self, GateOutcome::Bounded(_) | GateOutcome::Interrupted(_))
    }
}

pub struct AvailabilityGate {
    sources: Vec<Arc<dyn EtaSource>>,
    max_wait: Duration,
}

impl AvailabilityGate {
    pub fn new(sources: Vec<Arc<dyn EtaSource>>, max_wait: Duration) -> Self {
        Self { sources, max_wait }
    }

    /// Longest ETA across all archivers for items queued up to `at`.
    pub fn eta(&self, at: Instant) -> Duration {
        self.sources
            .iter()
            .map(|source| source.availability_eta(at))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Sleep until data archived before now is available, the bound passes or
    /// `token` is cancelled.
    pub async fn wait(&self, token: &CancellationToken) -> GateOutcome {
        let started = Instant::now();
        let eta = self.eta(started);
        if eta.is_zero() {
            return GateOutcome::Ready;
        }

        let wait = eta.min(self.max_wait);
        debug!(eta_ms = eta.as_millis() as u64, wait_ms = wait.as_millis() as u64, "Waiting for pending archive writes");

        let outcome = tokio::select! {
            _ = token.cancelled() => GateOutcome::Interrupted(started.elapsed()),
            _ = tokio::time::sleep(wait) => {
                if wait < eta {
                    GateOutcome::Bounded(wait)
                } else {
                    GateOutcome::Waited(wait)
                }
            }
        };

        let waited = match outcome {
            GateOutcome::Ready => Duration::ZERO,
            GateOutcome::Waited(d) | GateOutcome::Bounded(d) | GateOutcome::Interrupted(d) => d,
        };
        metrics::record_gate_wait(waited.as_secs_f64() * 1000.0, outcome.possibly_incomplete());

        if outcome.possibly_incomplete() {
            warn!(
                waited_ms = waited.as_millis() as u64,
                eta_ms = eta.as_millis() as u64,
                "Stopped waiting for pending archive writes, results possibly incomplete"
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Duration);

    impl EtaSource for Fixed {
        fn availability_eta(&self, _at: Instant) -> Duration {
            self.0
        }
    }

    fn gate(etas: &[u64], max_wait_ms: u64) -> AvailabilityGate {
        AvailabilityGate::new(
            etas.iter()
                .map(|ms| Arc::new(Fixed(Duration::from_millis(*ms))) as Arc<dyn EtaSource>)
                .collect(),
            Duration::from_millis(max_wait_ms),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pending_writes_is_immediate() {
        let gate = gate(&[0, 0], 1_000);
        assert_eq!(gate.wait(&CancellationToken::new()).await, GateOutcome::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_slowest_archiver() {
        let gate = gate(&[100, 700, 300], 1_000);
        let started = Instant::now();
        let outcome = gate.wait(&CancellationToken::new()).await;
        assert_eq!(outcome, GateOutcome::Waited(Duration::from_millis(700)));
        assert!(started.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded() {
        let gate = gate(&[5_000], 1_000);
        let outcome = gate.wait(&CancellationToken::new()).await;
        assert_eq!(outcome, GateOutcome::Bounded(Duration::from_millis(1_000)));
        assert!(outcome.possibly_incomplete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let gate = gate(&[5_000], 10_000);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let outcome = gate.wait(&token).await;
        assert!(matches!(outcome, GateOutcome::Interrupted(_)));
        assert!(outcome.possibly_incomplete());
    }
}
