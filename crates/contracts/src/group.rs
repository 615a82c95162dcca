//! SyncGroup - devices aligned against each other

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{DeviceId, QualityThresholds};

/// Group alignment tier, derived from member spread
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl GroupQuality {
    /// Map a spread in milliseconds onto a tier. Tighter spread, higher tier.
    pub fn from_spread(spread_ms: f64, thresholds: &QualityThresholds) -> Self {
        let spread = spread_ms.abs();
        if !spread.is_finite() {
            GroupQuality::Poor
        } else if spread <= thresholds.excellent_ms {
            GroupQuality::Excellent
        } else if spread <= thresholds.good_ms {
            GroupQuality::Good
        } else if spread <= thresholds.fair_ms {
            GroupQuality::Fair
        } else {
            GroupQuality::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupQuality::Excellent => "excellent",
            GroupQuality::Good => "good",
            GroupQuality::Fair => "fair",
            GroupQuality::Poor => "poor",
        }
    }

    /// Numeric level for gauges (3 = excellent, 0 = poor)
    pub fn level(&self) -> u8 {
        match self {
            GroupQuality::Excellent => 3,
            GroupQuality::Good => 2,
            GroupQuality::Fair => 1,
            GroupQuality::Poor => 0,
        }
    }
}

/// Sync group. Owned by the registry; snapshots of it are handed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncGroup {
    pub group_id: String,
    pub member_device_ids: BTreeSet<DeviceId>,
    pub priority: i32,
    /// Common lag the members are steered towards (derived)
    pub target_group_offset_ms: f64,
    /// Max minus min alignment error across reachable members (derived)
    pub spread_ms: f64,
    /// Tier derived from `spread_ms`
    pub quality: GroupQuality,
}

impl SyncGroup {
    pub fn new(group_id: impl Into<String>, priority: i32) -> Self {
        Self {
            group_id: group_id.into(),
            member_device_ids: BTreeSet::new(),
            priority,
            target_group_offset_ms: 0.0,
            spread_ms: 0.0,
            quality: GroupQuality::Poor,
        }
    }

    pub fn len(&self) -> usize {
        self.member_device_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_device_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_tiers() {
        let thresholds = QualityThresholds::default();
        assert_eq!(GroupQuality::from_spread(0.5, &thresholds), GroupQuality::Excellent);
        assert_eq!(GroupQuality::from_spread(8.0, &thresholds), GroupQuality::Good);
        assert_eq!(GroupQuality::from_spread(20.0, &thresholds), GroupQuality::Fair);
        assert_eq!(GroupQuality::from_spread(80.0, &thresholds), GroupQuality::Poor);
        assert_eq!(GroupQuality::from_spread(f64::NAN, &thresholds), GroupQuality::Poor);
    }

    #[test]
    fn test_quality_ordering() {
        assert!(GroupQuality::Excellent < GroupQuality::Poor);
        assert!(GroupQuality::Excellent.level() > GroupQuality::Good.level());
    }
}
