//! Aggregates computed from stored ping results

use serde::{Deserialize, Serialize};

use crate::{DeviceId, PingResult};

/// Reachability statistics for one device over a time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingStatistics {
    pub device_id: DeviceId,

    pub total_samples: u64,
    pub successful: u64,
    pub failed: u64,

    /// Percentage of successful probes (0-100), 0 when there are no samples
    pub success_rate: f64,

    /// Mean response time over successful probes only
    pub average_response_time_ms: Option<f64>,

    /// Most recent result in the window
    pub last_result: Option<PingResult>,
}

impl PingStatistics {
    pub fn empty(device_id: DeviceId) -> Self {
        Self {
            device_id,
            total_samples: 0,
            successful: 0,
            failed: 0,
            success_rate: 0.0,
            average_response_time_ms: None,
            last_result: None,
        }
    }

    /// Build from raw counts, as returned by an aggregate query
    pub fn from_counts(
        device_id: DeviceId,
        total_samples: u64,
        successful: u64,
        average_response_time_ms: Option<f64>,
        last_result: Option<PingResult>,
    ) -> Self {
        let success_rate = if total_samples == 0 {
            0.0
        } else {
            successful as f64 / total_samples as f64 * 100.0
        };

        Self {
            device_id,
            total_samples,
            successful,
            failed: total_samples - successful,
            success_rate,
            average_response_time_ms,
            last_result,
        }
    }

    /// Aggregate results already filtered to one device and window
    pub fn from_results<'a>(
        device_id: DeviceId,
        results: impl IntoIterator<Item = &'a PingResult>,
    ) -> Self {
        let mut total = 0u64;
        let mut successful = 0u64;
        let mut rtt_sum = 0.0;
        let mut last: Option<&PingResult> = None;

        for result in results {
            total += 1;
            if result.success {
                successful += 1;
                rtt_sum += result.response_time_ms.unwrap_or_default();
            }
            if last.is_none_or(|l| result.timestamp >= l.timestamp) {
                last = Some(result);
            }
        }

        let average = (successful > 0).then(|| rtt_sum / successful as f64);
        Self::from_counts(device_id, total, successful, average, last.cloned())
    }
}
