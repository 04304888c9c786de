//! Network quality as seen by reachability probes, and the timeouts that
//! follow from it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default ceiling for one test attempt.
pub const DEFAULT_BASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Ceiling applied on constrained devices before quality scaling.
pub const CONSTRAINED_TIMEOUT_CAP: Duration = Duration::from_secs(45);

/// Probe slower than this is a poor network.
const POOR_RESPONSE_MS: u64 = 3000;

/// Probe slower than this is a fair network.
const FAIR_RESPONSE_MS: u64 = 1000;

/// Variants are ordered from worst to best.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Default,
)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Offline,
    Poor,
    Fair,
    #[default]
    Good,
}

serde_plain::derive_display_from_serialize!(NetworkQuality);

impl NetworkQuality {
    pub fn from_response_time(response_time_ms: u64) -> Self {
        if response_time_ms > POOR_RESPONSE_MS {
            NetworkQuality::Poor
        } else if response_time_ms > FAIR_RESPONSE_MS {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Good
        }
    }
}

/// Result of a connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reachability {
    pub online: bool,
    pub response_time_ms: Option<u64>,
    pub quality: NetworkQuality,
}

impl Reachability {
    pub fn online(response_time_ms: u64) -> Self {
        Self {
            online: true,
            response_time_ms: Some(response_time_ms),
            quality: NetworkQuality::from_response_time(response_time_ms),
        }
    }

    /// The probe ran out of time: the link is up but struggling.
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            online: true,
            response_time_ms: Some(timeout.as_millis() as u64),
            quality: NetworkQuality::Poor,
        }
    }

    pub fn offline() -> Self {
        Self { online: false, response_time_ms: None, quality: NetworkQuality::Offline }
    }
}

impl Default for Reachability {
    fn default() -> Self {
        Self { online: true, response_time_ms: None, quality: NetworkQuality::Good }
    }
}

/// Per-attempt timeout.
///
/// Constrained devices are capped first, then the result is stretched on
/// slow networks: doubled when poor, 1.5x when fair.
pub fn attempt_timeout(
    base: Duration,
    constrained: bool,
    quality: NetworkQuality,
) -> Duration {
    let timeout = if constrained { base.min(CONSTRAINED_TIMEOUT_CAP) } else { base };

    match quality {
        NetworkQuality::Poor => timeout.mul_f64(2.0),
        NetworkQuality::Fair => timeout.mul_f64(1.5),
        NetworkQuality::Good | NetworkQuality::Offline => timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_from_response_time() {
        assert_eq!(NetworkQuality::from_response_time(200), NetworkQuality::Good);
        assert_eq!(NetworkQuality::from_response_time(1000), NetworkQuality::Good);
        assert_eq!(NetworkQuality::from_response_time(1001), NetworkQuality::Fair);
        assert_eq!(NetworkQuality::from_response_time(3001), NetworkQuality::Poor);
    }

    #[test]
    fn test_attempt_timeout() {
        let base = DEFAULT_BASE_TIMEOUT;
        assert_eq!(attempt_timeout(base, false, NetworkQuality::Good), base);
        assert_eq!(
            attempt_timeout(base, true, NetworkQuality::Good),
            Duration::from_secs(45)
        );
        assert_eq!(
            attempt_timeout(base, false, NetworkQuality::Poor),
            Duration::from_secs(120)
        );
        assert_eq!(
            attempt_timeout(base, true, NetworkQuality::Fair),
            Duration::from_millis(67_500)
        );
    }

    #[test]
    fn test_reachability_constructors() {
        assert!(!Reachability::offline().online);
        assert_eq!(Reachability::offline().quality, NetworkQuality::Offline);

        let slow = Reachability::timed_out(Duration::from_secs(5));
        assert!(slow.online);
        assert_eq!(slow.quality, NetworkQuality::Poor);

        assert_eq!(Reachability::online(1500).quality, NetworkQuality::Fair);
        assert_eq!(NetworkQuality::Fair.to_string(), "fair");
    }
}
