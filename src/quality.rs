//! Connection quality tiers.
//!
//! A tier is a coarse label for measured throughput. Tiers are ordered from
//! worst to best so the derived `Ord` can pick the bottleneck direction.

use serde::{Deserialize, Serialize};

/// Tier thresholds in Mbps, exclusive upper bounds.
mod thresholds {
    pub const POOR: f64 = 2.0;
    pub const MODERATE: f64 = 15.0;
    pub const GOOD: f64 = 75.0;
    pub const EXCELLENT: f64 = 200.0;
    pub const ULTRA: f64 = 500.0;
}

/// Variants are ordered from worst to best for correct derived Ord behavior.
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
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Poor,
    Moderate,
    Good,
    Excellent,
    Ultra,
    Gigabit,
}

serde_plain::derive_display_from_serialize!(Tier);
serde_plain::derive_fromstr_from_deserialize!(Tier);

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::Poor,
        Tier::Moderate,
        Tier::Good,
        Tier::Excellent,
        Tier::Ultra,
        Tier::Gigabit,
    ];

    /// Classify a throughput in Mbps. Negative and NaN inputs count as 0.
    pub fn of(speed_mbps: f64) -> Tier {
        let speed = if speed_mbps.is_nan() { 0.0 } else { speed_mbps.max(0.0) };

        if speed < thresholds::POOR {
            Tier::Poor
        } else if speed < thresholds::MODERATE {
            Tier::Moderate
        } else if speed < thresholds::GOOD {
            Tier::Good
        } else if speed < thresholds::EXCELLENT {
            Tier::Excellent
        } else if speed < thresholds::ULTRA {
            Tier::Ultra
        } else {
            Tier::Gigabit
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Drop `steps` tiers, never below [`Tier::Poor`].
    pub fn downgrade(self, steps: usize) -> Tier {
        Tier::ALL[self.index().saturating_sub(steps)]
    }

    /// Human label used in plan descriptions.
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Poor => "Poor",
            Tier::Moderate => "Moderate",
            Tier::Good => "Good",
            Tier::Excellent => "Excellent",
            Tier::Ultra => "Ultra",
            Tier::Gigabit => "Gigabit",
        }
    }

    /// True for the two tiers where any failure suggests an oversized plan.
    pub fn is_extreme(&self) -> bool {
        matches!(self, Tier::Ultra | Tier::Gigabit)
    }
}

/// Convenience wrapper over [`Tier::of`].
pub fn tier_of(speed_mbps: f64) -> Tier {
    Tier::of(speed_mbps)
}

/// Bits per second to megabits per second.
pub fn bps_to_mbps(bps: f64) -> f64 {
    bps / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(tier_of(0.0), Tier::Poor);
        assert_eq!(tier_of(1.99), Tier::Poor);
        assert_eq!(tier_of(2.0), Tier::Moderate);
        assert_eq!(tier_of(14.9), Tier::Moderate);
        assert_eq!(tier_of(15.0), Tier::Good);
        assert_eq!(tier_of(75.0), Tier::Excellent);
        assert_eq!(tier_of(200.0), Tier::Ultra);
        assert_eq!(tier_of(499.9), Tier::Ultra);
        assert_eq!(tier_of(500.0), Tier::Gigabit);
        assert_eq!(tier_of(10_000.0), Tier::Gigabit);
    }

    #[test]
    fn test_negative_and_nan_are_poor() {
        assert_eq!(tier_of(-5.0), Tier::Poor);
        assert_eq!(tier_of(f64::NAN), Tier::Poor);
    }

    #[test]
    fn test_downgrade_saturates() {
        assert_eq!(Tier::Excellent.downgrade(2), Tier::Moderate);
        assert_eq!(Tier::Moderate.downgrade(2), Tier::Poor);
        assert_eq!(Tier::Poor.downgrade(1), Tier::Poor);
        assert_eq!(Tier::Gigabit.downgrade(0), Tier::Gigabit);
    }

    #[test]
    fn test_tier_display_and_parse() {
        assert_eq!(Tier::Excellent.to_string(), "excellent");
        assert_eq!("gigabit".parse::<Tier>().unwrap(), Tier::Gigabit);
        assert!("unknown".parse::<Tier>().is_err());
    }

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Poor < Tier::Moderate);
        assert!(Tier::Ultra < Tier::Gigabit);
        assert_eq!(std::cmp::min(Tier::Excellent, Tier::Poor), Tier::Poor);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_tier_is_monotonic(a in -10.0f64..2000.0, b in -10.0f64..2000.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(tier_of(lo) <= tier_of(hi));
        }
    }
}
