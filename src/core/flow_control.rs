//! Client side flow control over outstanding messages.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::trace;

/// What to do when a reservation would exceed the limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitExceededBehavior {
    /// Wait until capacity frees up.
    #[default]
    Block,
    /// Account for the reservation without waiting.
    Ignore,
}

/// Limits on messages handed to the user but not yet acked or nacked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlSettings {
    /// Maximum outstanding messages, `None` for no limit.
    pub max_outstanding_element_count: Option<u64>,
    /// Maximum outstanding bytes, `None` for no limit.
    pub max_outstanding_request_bytes: Option<u64>,
    /// Behavior when a limit would be exceeded.
    pub limit_exceeded_behavior: LimitExceededBehavior,
}

impl Default for FlowControlSettings {
    fn default() -> Self {
        Self {
            max_outstanding_element_count: Some(1000),
            max_outstanding_request_bytes: Some(100 * 1024 * 1024),
            limit_exceeded_behavior: LimitExceededBehavior::Block,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Outstanding {
    elements: u64,
    bytes: u64,
}

/// Tracks outstanding messages and bytes against [`FlowControlSettings`].
///
/// Shared by every connection of a subscriber.
#[derive(Debug)]
pub struct FlowController {
    settings: FlowControlSettings,
    outstanding: Mutex<Outstanding>,
    released: Notify,
}

impl FlowController {
    /// Create a flow controller.
    pub fn new(settings: FlowControlSettings) -> Self {
        Self {
            settings,
            outstanding: Mutex::new(Outstanding::default()),
            released: Notify::new(),
        }
    }

    /// The settings this controller enforces.
    pub fn settings(&self) -> &FlowControlSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, Outstanding> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // A reservation larger than a limit is admitted once nothing is outstanding,
    // otherwise it would never fit.
    fn fits(&self, current: &Outstanding, elements: u64, bytes: u64) -> bool {
        if current.elements == 0 && current.bytes == 0 {
            return true;
        }
        let elements_ok = self
            .settings
            .max_outstanding_element_count
            .map_or(true, |max| current.elements + elements <= max);
        let bytes_ok = self
            .settings
            .max_outstanding_request_bytes
            .map_or(true, |max| current.bytes + bytes <= max);
        elements_ok && bytes_ok
    }

    /// Reserve capacity, waiting for releases while the limits are exceeded.
    pub async fn reserve(&self, elements: u64, bytes: u64) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_reserve(elements, bytes) {
                return;
            }
            trace!(elements, bytes, "Flow controller is blocking");
            released.await;
        }
    }

    /// Reserve capacity without waiting. Returns whether the reservation was made.
    ///
    /// With [`LimitExceededBehavior::Ignore`] this always succeeds.
    pub fn try_reserve(&self, elements: u64, bytes: u64) -> bool {
        let mut outstanding = self.lock();
        if self.settings.limit_exceeded_behavior == LimitExceededBehavior::Block
            && !self.fits(&outstanding, elements, bytes)
        {
            return false;
        }
        outstanding.elements += elements;
        outstanding.bytes += bytes;
        true
    }

    /// Return capacity. Counters saturate at zero.
    pub fn release(&self, elements: u64, bytes: u64) {
        {
            let mut outstanding = self.lock();
            outstanding.elements = outstanding.elements.saturating_sub(elements);
            outstanding.bytes = outstanding.bytes.saturating_sub(bytes);
        }
        self.released.notify_waiters();
    }

    /// Messages currently outstanding.
    pub fn outstanding_element_count(&self) -> u64 {
        self.lock().elements
    }

    /// Bytes currently outstanding.
    pub fn outstanding_bytes(&self) -> u64 {
        self.lock().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn limits(elements: u64, bytes: u64) -> FlowControlSettings {
        FlowControlSettings {
            max_outstanding_element_count: Some(elements),
            max_outstanding_request_bytes: Some(bytes),
            limit_exceeded_behavior: LimitExceededBehavior::Block,
        }
    }

    #[tokio::test]
    async fn test_reserve_and_release_bytes() {
        let controller = FlowController::new(limits(10, 1000));

        controller.reserve(1, 300).await;
        assert_eq!(controller.outstanding_bytes(), 300);
        assert_eq!(controller.outstanding_element_count(), 1);

        controller.release(1, 300);
        assert_eq!(controller.outstanding_bytes(), 0);
        assert_eq!(controller.outstanding_element_count(), 0);
    }

    #[test]
    fn test_release_never_goes_negative() {
        let controller = FlowController::new(limits(10, 1000));
        controller.release(3, 500);
        assert_eq!(controller.outstanding_bytes(), 0);
        assert_eq!(controller.outstanding_element_count(), 0);
    }

    #[test]
    fn test_try_reserve_respects_element_limit() {
        let controller = FlowController::new(limits(2, 1000));
        assert!(controller.try_reserve(1, 1));
        assert!(controller.try_reserve(1, 1));
        assert!(!controller.try_reserve(1, 1));
    }

    #[test]
    fn test_oversized_message_admitted_when_idle() {
        let controller = FlowController::new(limits(10, 100));
        assert!(controller.try_reserve(1, 500));
        assert!(!controller.try_reserve(1, 1));
    }

    #[test]
    fn test_ignore_behavior_never_blocks() {
        let controller = FlowController::new(FlowControlSettings {
            max_outstanding_element_count: Some(1),
            max_outstanding_request_bytes: None,
            limit_exceeded_behavior: LimitExceededBehavior::Ignore,
        });
        assert!(controller.try_reserve(1, 10));
        assert!(controller.try_reserve(1, 10));
        assert_eq!(controller.outstanding_element_count(), 2);
    }

    #[tokio::test]
    async fn test_reserve_blocks_until_release() {
        let controller = Arc::new(FlowController::new(limits(1, 1000)));
        controller.reserve(1, 10).await;

        let blocked = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.reserve(1, 20).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        controller.release(1, 10);
        tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .expect("reservation should complete after release")
            .unwrap();
        assert_eq!(controller.outstanding_bytes(), 20);
    }
}
