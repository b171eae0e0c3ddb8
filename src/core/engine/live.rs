//! Owned realtime subscription for one source

use std::sync::Arc;

use tracing::debug;

use super::{ApplyOutcome, RealtimeStatus, SourceEngine};
use crate::core::remote::Subscription;

/// A ready source together with its open change channel
///
/// Dropping it releases the channel and marks the source disconnected.
pub struct LiveSource {
    engine: Arc<SourceEngine>,
    subscription: Subscription,
}

impl LiveSource {
    pub(super) fn new(engine: Arc<SourceEngine>, subscription: Subscription) -> Self {
        engine.set_realtime(RealtimeStatus::Subscribed);
        debug!(source = engine.name(), table = subscription.table(), "subscribed");
        Self {
            engine,
            subscription,
        }
    }

    pub fn engine(&self) -> &Arc<SourceEngine> {
        &self.engine
    }

    /// Apply every notification already delivered, returning how many changed state
    pub fn apply_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Some(change) = self.subscription.try_recv() {
            if self.engine.apply_change(&change) == ApplyOutcome::Applied {
                applied += 1;
            }
        }
        applied
    }

    /// Wait for and apply the next notification; `None` once the channel closes
    pub async fn next(&mut self) -> Option<ApplyOutcome> {
        let change = self.subscription.recv().await?;
        Some(self.engine.apply_change(&change))
    }

    /// Apply notifications until the channel closes
    pub async fn run(mut self) {
        while self.next().await.is_some() {}
        debug!(source = self.engine.name(), "change channel closed");
    }
}

impl Drop for LiveSource {
    fn drop(&mut self) {
        self.engine.set_realtime(RealtimeStatus::Disconnected);
    }
}
