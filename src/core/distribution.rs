//! Ack latency distribution used to pick lease extensions.

use std::sync::{Mutex, MutexGuard, PoisonError};

use hdrhistogram::Histogram;

use crate::error::{Error, Result};

/// Histogram of whole-second values in `[0, max_value)`.
///
/// Values at or above the top of the range are counted as `max_value - 1`.
#[derive(Debug)]
pub struct Distribution {
    histogram: Mutex<Histogram<u64>>,
    max_value: u64,
}

impl Distribution {
    /// Create a distribution over `[0, max_value)`.
    pub fn new(max_value: usize) -> Result<Self> {
        let max_value = (max_value as u64).max(1);
        let histogram = Histogram::new_with_max(max_value.max(2), 3)
            .map_err(|e| Error::Internal(format!("Failed to create ack latency histogram: {:?}", e)))?;
        Ok(Self {
            histogram: Mutex::new(histogram),
            max_value,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Histogram<u64>> {
        self.histogram.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one observation.
    pub fn record(&self, value: u32) {
        let value = u64::from(value).min(self.max_value - 1);
        self.lock().saturating_record(value);
    }

    /// Number of recorded observations.
    pub fn count(&self) -> u64 {
        self.lock().len()
    }

    /// Smallest value at or below which `percentile` percent of observations fall.
    ///
    /// `percentile` is clamped to `(0, 100]`.
    pub fn percentile(&self, percentile: f64) -> u32 {
        let percentile = percentile.clamp(f64::MIN_POSITIVE, 100.0);
        let value = self.lock().value_at_percentile(percentile);
        u32::try_from(value.min(self.max_value - 1)).unwrap_or(u32::MAX)
    }
}
