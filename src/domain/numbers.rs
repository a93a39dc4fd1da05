//! Range-Checked Numbers
//!
//! Bounded numeric identifiers validated at construction. Values outside
//! their domain raise [`Error::ValueOutOfRange`] and are never clamped.

use crate::error::{RangeViolation, Result};
use serde::Serialize;
use std::fmt;

// =============================================================================
// Constants
// =============================================================================

/// Smallest usable DRBD node id
pub const NODE_ID_MIN: i64 = 0;
/// Largest usable DRBD node id
pub const NODE_ID_MAX: i64 = 31;

pub const VOLUME_NUMBER_MIN: i64 = 0;
pub const VOLUME_NUMBER_MAX: i64 = 65535;

pub const MINOR_NUMBER_MIN: i64 = 0;
pub const MINOR_NUMBER_MAX: i64 = (1 << 20) - 1;

pub const TCP_PORT_MIN: i64 = 1;
pub const TCP_PORT_MAX: i64 = 65535;

/// Smallest net size of a replicated volume in KiB
pub const MIN_VOLUME_SIZE_KIB: u64 = 4;
/// Largest volume size in KiB the replication layer supports
pub const MAX_VOLUME_SIZE_KIB: u64 = 1 << 40;

// =============================================================================
// Value Kinds
// =============================================================================

/// Kind of checked value, carried by range violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    NodeId,
    VolumeNumber,
    MinorNumber,
    TcpPort,
    VolumeSize,
    ConfiguredRange,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::NodeId => write!(f, "DRBD node id"),
            ValueKind::VolumeNumber => write!(f, "Volume number"),
            ValueKind::MinorNumber => write!(f, "Minor number"),
            ValueKind::TcpPort => write!(f, "TCP port"),
            ValueKind::VolumeSize => write!(f, "Volume size (KiB)"),
            ValueKind::ConfiguredRange => write!(f, "Configured range bound"),
        }
    }
}

// =============================================================================
// Checked Number Types
// =============================================================================

macro_rules! checked_number {
    ($(#[$meta:meta])* $name:ident($repr:ty), $kind:expr, $min:expr, $max:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name($repr);

        impl $name {
            pub const MIN: i64 = $min;
            pub const MAX: i64 = $max;

            /// Validates `value` against the domain of this type
            pub fn new(value: i64) -> Result<Self> {
                RangeViolation::check($kind, value as i128, Self::MIN as i128, Self::MAX as i128)?;
                Ok(Self(value as $repr))
            }

            pub fn value(&self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<i64> for $name {
            type Error = crate::error::Error;

            fn try_from(value: i64) -> Result<Self> {
                Self::new(value)
            }
        }
    };
}

checked_number!(
    /// Peer id of a resource within its replication group
    DrbdNodeId(u8),
    ValueKind::NodeId,
    NODE_ID_MIN,
    NODE_ID_MAX
);

checked_number!(
    /// Volume number within a resource definition
    VolumeNumber(u16),
    ValueKind::VolumeNumber,
    VOLUME_NUMBER_MIN,
    VOLUME_NUMBER_MAX
);

checked_number!(
    /// Block device minor number
    MinorNumber(u32),
    ValueKind::MinorNumber,
    MINOR_NUMBER_MIN,
    MINOR_NUMBER_MAX
);

checked_number!(
    /// TCP port used for replication traffic
    TcpPortNumber(u16),
    ValueKind::TcpPort,
    TCP_PORT_MIN,
    TCP_PORT_MAX
);

/// Validates a volume size in KiB
pub fn check_volume_size(size_kib: u64) -> Result<u64> {
    RangeViolation::check(
        ValueKind::VolumeSize,
        size_kib as i128,
        MIN_VOLUME_SIZE_KIB as i128,
        MAX_VOLUME_SIZE_KIB as i128,
    )?;
    Ok(size_kib)
}

/// Inclusive range of numbers handed out by an allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct NumberRange {
    pub min: i64,
    pub max: i64,
}

impl NumberRange {
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: i64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl fmt::Display for NumberRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Bound, Error};
    use assert_matches::assert_matches;

    #[test]
    fn test_node_id_range() {
        assert_eq!(DrbdNodeId::new(0).unwrap().value(), 0);
        assert_eq!(DrbdNodeId::new(31).unwrap().value(), 31);
        assert_matches!(
            DrbdNodeId::new(32),
            Err(Error::ValueOutOfRange(RangeViolation {
                kind: ValueKind::NodeId,
                bound: Bound::TooHigh,
                ..
            }))
        );
        assert_matches!(
            DrbdNodeId::new(-1),
            Err(Error::ValueOutOfRange(RangeViolation { bound: Bound::TooLow, .. }))
        );
    }

    #[test]
    fn test_port_and_minor_ranges() {
        assert!(TcpPortNumber::new(7000).is_ok());
        assert!(TcpPortNumber::new(0).is_err());
        assert!(TcpPortNumber::new(65536).is_err());
        assert!(MinorNumber::new(1_048_575).is_ok());
        assert!(MinorNumber::new(1_048_576).is_err());
        assert!(VolumeNumber::new(65535).is_ok());
        assert!(VolumeNumber::new(65536).is_err());
    }

    #[test]
    fn test_volume_size_bounds() {
        assert_eq!(check_volume_size(1_048_576).unwrap(), 1_048_576);
        assert_matches!(
            check_volume_size(0),
            Err(Error::ValueOutOfRange(RangeViolation {
                kind: ValueKind::VolumeSize,
                bound: Bound::TooLow,
                ..
            }))
        );
        assert_matches!(
            check_volume_size(MAX_VOLUME_SIZE_KIB + 1),
            Err(Error::ValueOutOfRange(RangeViolation {
                bound: Bound::TooHigh,
                ..
            }))
        );
    }

    #[test]
    fn test_numbers_serialize_transparently() {
        let port = TcpPortNumber::new(7001).unwrap();
        assert_eq!(serde_json::to_value(port).unwrap(), serde_json::json!(7001));
    }
}
