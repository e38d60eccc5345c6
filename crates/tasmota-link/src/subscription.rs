use std::sync::atomic::{AtomicU32, Ordering};

use transport_bus::SubscriptionId;

/// Largest subscription identifier MQTT v5 can carry on the wire.
pub const MAX_SUBSCRIPTION_ID: SubscriptionId = 268_435_455;

/// Monotonic subscription identifiers owned by one session.
///
/// Identifiers start at 1, never repeat until the counter wraps past
/// [`MAX_SUBSCRIPTION_ID`], and are never 0.
#[derive(Debug)]
pub struct SubscriptionIds {
    next: AtomicU32,
}

impl Default for SubscriptionIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl SubscriptionIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn starting_at(first: SubscriptionId) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    pub fn next_id(&self) -> SubscriptionId {
        let result = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(if current >= MAX_SUBSCRIPTION_ID {
                    1
                } else {
                    current + 1
                })
            });
        match result {
            Ok(id) | Err(id) => id.clamp(1, MAX_SUBSCRIPTION_ID),
        }
    }
}
