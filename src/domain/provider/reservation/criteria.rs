use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MIN_VLAN: u16 = 1;
const MAX_VLAN: u16 = 4094;

/// Requested point-to-point service: two STPs, the VLANs on each side and the bandwidth.
///
/// Immutable once reserved. A change of criteria needs a new reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criteria {
    pub source_stp: String,
    pub destination_stp: String,
    pub source_vlan: u16,
    pub destination_vlan: u16,
    /// Requested bandwidth in Mbit/s.
    pub bandwidth: u64,
    /// Requested start of service in ms since epoch, `None` for "now".
    #[serde(default)]
    pub start_time: Option<i64>,
    /// Requested end of service in ms since epoch, `None` for "no end date".
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default = "default_symmetric")]
    pub symmetric_path: bool,
}

fn default_symmetric() -> bool {
    true
}

impl Criteria {
    pub fn new(source_stp: impl Into<String>, destination_stp: impl Into<String>, vlan: u16, bandwidth: u64) -> Self {
        Criteria {
            source_stp: source_stp.into(),
            destination_stp: destination_stp.into(),
            source_vlan: vlan,
            destination_vlan: vlan,
            bandwidth,
            start_time: None,
            end_time: None,
            symmetric_path: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_stp.trim().is_empty() || self.destination_stp.trim().is_empty() {
            return Err(Error::InvalidCriteria("source and destination STP must be set".to_string()));
        }
        if self.source_stp == self.destination_stp {
            return Err(Error::InvalidCriteria(format!("source and destination STP are identical ({})", self.source_stp)));
        }
        if self.bandwidth == 0 {
            return Err(Error::InvalidCriteria("bandwidth must be greater than 0".to_string()));
        }
        for vlan in [self.source_vlan, self.destination_vlan] {
            if !(MIN_VLAN..=MAX_VLAN).contains(&vlan) {
                return Err(Error::InvalidCriteria(format!("VLAN {} outside of {}-{}", vlan, MIN_VLAN, MAX_VLAN)));
            }
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start >= end {
                return Err(Error::InvalidCriteria(format!("start time {} is not before end time {}", start, end)));
            }
        }
        Ok(())
    }
}
