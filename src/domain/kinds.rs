//! Domain Enumerations
//!
//! Node roles, replication transports, interface types and storage
//! provider kinds, with their stored representations.

use serde::{Serialize, Serializer};
use std::fmt;

// =============================================================================
// Node Type
// =============================================================================

/// Role of a cluster node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeType {
    Controller,
    #[default]
    Satellite,
    Combined,
    Auxiliary,
}

impl NodeType {
    /// Flag value stored for this type
    pub fn flag_value(&self) -> i64 {
        match self {
            NodeType::Controller => 1,
            NodeType::Satellite => 2,
            NodeType::Combined => 3,
            NodeType::Auxiliary => 4,
        }
    }

    pub fn from_flag_value(value: i64) -> Option<Self> {
        match value {
            1 => Some(NodeType::Controller),
            2 => Some(NodeType::Satellite),
            3 => Some(NodeType::Combined),
            4 => Some(NodeType::Auxiliary),
            _ => None,
        }
    }

    /// A combined node is both a controller and a satellite
    pub fn includes(&self, other: NodeType) -> bool {
        let required = other.flag_value();
        self.flag_value() & required == required
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Controller => "CONTROLLER",
            NodeType::Satellite => "SATELLITE",
            NodeType::Combined => "COMBINED",
            NodeType::Auxiliary => "AUXILIARY",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for NodeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.flag_value())
    }
}

// =============================================================================
// String Enumerations
// =============================================================================

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Parses the stored representation, ignoring case
            pub fn parse(text: &str) -> Option<Self> {
                $(
                    if text.eq_ignore_ascii_case($text) {
                        return Some($name::$variant);
                    }
                )+
                None
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// Transport used for replication traffic of a resource
    TransportType {
        Ip => "IP",
        Rdma => "RDMA",
        RoCe => "RoCE",
    }
);

string_enum!(
    /// Link type of a network interface
    NetInterfaceType {
        Ip => "IP",
        Rdma => "RDMA",
        RoCe => "RoCE",
    }
);

string_enum!(
    /// Storage provider backing a storage pool
    DeviceProviderKind {
        Diskless => "DISKLESS",
        Lvm => "LVM",
        LvmThin => "LVM_THIN",
        Zfs => "ZFS",
        ZfsThin => "ZFS_THIN",
        File => "FILE",
        FileThin => "FILE_THIN",
    }
);

impl DeviceProviderKind {
    /// Providers that place no local data on the node
    pub fn is_diskless(&self) -> bool {
        matches!(self, DeviceProviderKind::Diskless)
    }
}

impl Default for TransportType {
    fn default() -> Self {
        TransportType::Ip
    }
}
