//! Dispatch scheduler: paced, in-order delivery of reply segments.
//!
//! Segments go out one at a time on a single transport. Before each segment
//! the scheduler waits roughly as long as a person would take to type the
//! previous one. Every successful send is appended to the message log right
//! away; a failed send is logged and the remaining segments still go out.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::channels::Transport;
use crate::config::PacingConfig;
use crate::lead::MessageRecord;
use crate::pipeline::contract::Segments;
use crate::store::LeadStore;

/// Outcome of one `deliver` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn is_partial(&self) -> bool {
        self.failed > 0
    }
}

pub struct DispatchScheduler {
    transport: Arc<dyn Transport>,
    store: Arc<dyn LeadStore>,
    pacing: PacingConfig,
}

impl DispatchScheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn LeadStore>,
        pacing: PacingConfig,
    ) -> Self {
        Self {
            transport,
            store,
            pacing,
        }
    }

    /// Delay before a segment, without jitter.
    ///
    /// The first segment waits `first_delay`. Later ones wait the previous
    /// segment's typing time clamped to `[min_delay, max_delay]`.
    pub fn base_delay(&self, previous: Option<&str>) -> Duration {
        match previous {
            None => self.pacing.first_delay,
            Some(prev) => {
                let chars = u32::try_from(prev.chars().count()).unwrap_or(u32::MAX);
                self.pacing
                    .per_char
                    .saturating_mul(chars)
                    .clamp(self.pacing.min_delay, self.pacing.max_delay)
            }
        }
    }

    fn delay_for(&self, previous: Option<&str>) -> Duration {
        let base = self.base_delay(previous);
        if previous.is_none() || self.pacing.max_jitter.is_zero() {
            return base;
        }
        let max = self.pacing.max_jitter.as_millis() as u64;
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Send `segments` to `contact_id` in order. Best effort, no retry.
    pub async fn deliver(&self, contact_id: &str, segments: &Segments) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut previous: Option<&str> = None;

        for (index, segment) in segments.iter().enumerate() {
            let delay = self.delay_for(previous);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            previous = Some(segment.as_str());

            if let Err(e) = self.transport.send(contact_id, segment).await {
                warn!(
                    contact = %contact_id,
                    segment = index,
                    error = %e,
                    "Segment send failed, continuing"
                );
                report.failed += 1;
                continue;
            }
            report.sent += 1;

            if let Err(e) = self
                .store
                .append_message(&MessageRecord::agent(contact_id, segment.as_str()))
                .await
            {
                error!(contact = %contact_id, error = %e, "Failed to log sent segment");
            }
        }

        debug!(
            contact = %contact_id,
            sent = report.sent,
            failed = report.failed,
            "Dispatch finished"
        );
        report
    }
}
