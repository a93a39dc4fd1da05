//! Checked Names
//!
//! Every name compares case-insensitively on an upper-case value while
//! keeping the spelling it was created with for display and storage.

use crate::error::{Error, Result};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

// =============================================================================
// Validation Rules
// =============================================================================

/// Length and character rules for one kind of name
#[derive(Debug, Clone, Copy)]
pub struct NameRules {
    pub kind: &'static str,
    pub min_length: usize,
    pub max_length: usize,
    pub valid_first: fn(char) -> bool,
    pub valid_inner: fn(char) -> bool,
}

fn ascii_letter(c: char) -> bool {
    c.is_ascii_alphabetic()
}

fn identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl NameRules {
    /// Validates `name` against these rules
    pub fn check(&self, name: &str) -> Result<()> {
        let invalid = |reason: String| Error::InvalidName {
            kind: self.kind,
            name: name.to_string(),
            reason,
        };

        let length = name.chars().count();
        if length < self.min_length {
            return Err(invalid(format!(
                "shorter than the minimum length of {}",
                self.min_length
            )));
        }
        if length > self.max_length {
            return Err(invalid(format!(
                "longer than the maximum length of {}",
                self.max_length
            )));
        }

        let mut chars = name.chars();
        if let Some(first) = chars.next() {
            if !(self.valid_first)(first) {
                return Err(invalid(format!("invalid leading character '{}'", first)));
            }
        }
        if let Some(bad) = chars.find(|c| !(self.valid_inner)(*c)) {
            return Err(invalid(format!("invalid character '{}'", bad)));
        }
        Ok(())
    }
}

/// Hostname rules: dot separated labels of letters, digits and hyphens
fn check_hostname(kind: &'static str, name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        kind,
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.len() < 2 {
        return Err(invalid("shorter than the minimum length of 2"));
    }
    if name.len() > 255 {
        return Err(invalid("longer than the maximum length of 255"));
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid("hostname labels must be 1 to 63 characters long"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("hostname labels must not start or end with '-'"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("hostname labels may only contain letters, digits and '-'"));
        }
    }
    Ok(())
}

// =============================================================================
// Name Types
// =============================================================================

macro_rules! checked_name {
    ($(#[$meta:meta])* $name:ident, $check:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            value: String,
            display: String,
        }

        impl $name {
            /// Validates and creates the name
            pub fn new(name: impl AsRef<str>) -> Result<Self> {
                let name = name.as_ref();
                let check: fn(&str) -> Result<()> = $check;
                check(name)?;
                Ok(Self {
                    value: name.to_uppercase(),
                    display: name.to_string(),
                })
            }

            /// Upper-case comparison value
            pub fn value(&self) -> &str {
                &self.value
            }

            /// Name as originally spelled
            pub fn display_name(&self) -> &str {
                &self.display
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.value == other.value
            }
        }

        impl Eq for $name {}

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.value.cmp(&other.value)
            }
        }

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.value.hash(state);
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.display)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.display)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(name: &str) -> Result<Self> {
                Self::new(name)
            }
        }
    };
}

/// Rules for resource, storage pool and snapshot names
pub const IDENTIFIER_RULES: NameRules = NameRules {
    kind: "identifier",
    min_length: 2,
    max_length: 48,
    valid_first: ascii_letter,
    valid_inner: identifier_char,
};

/// Rules for network interface names
pub const NET_INTERFACE_RULES: NameRules = NameRules {
    kind: "net interface name",
    min_length: 2,
    max_length: 32,
    valid_first: ascii_letter,
    valid_inner: identifier_char,
};

checked_name!(
    /// Cluster-unique node name, a valid hostname
    NodeName,
    |name| check_hostname("node name", name)
);

checked_name!(
    /// Cluster-unique resource definition name
    ResourceName,
    |name| NameRules { kind: "resource name", ..IDENTIFIER_RULES }.check(name)
);

checked_name!(
    /// Cluster-unique storage pool definition name
    StorPoolName,
    |name| NameRules { kind: "storage pool name", ..IDENTIFIER_RULES }.check(name)
);

checked_name!(
    /// Snapshot name, unique within one resource definition
    SnapshotName,
    |name| NameRules { kind: "snapshot name", ..IDENTIFIER_RULES }.check(name)
);

checked_name!(
    /// Network interface name, unique within one node
    NetInterfaceName,
    |name| NET_INTERFACE_RULES.check(name)
);
