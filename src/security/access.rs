//! Access Types and Contexts
//!
//! An [`AccessContext`] is the caller identity carried through every call.
//! Object access is a total order `VIEW < USE < CHANGE < CONTROL`; the
//! privileges of a context grant object access independent of any ACL.

use crate::error::{Error, Result};
use bitflags::bitflags;
use serde::{Serialize, Serializer};
use std::fmt;

// =============================================================================
// Access Type
// =============================================================================

/// Level of access to a protected object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessType {
    View,
    Use,
    Change,
    Control,
}

impl AccessType {
    /// Stored bit pattern; every level includes the bits of the lower ones
    pub fn value(&self) -> i64 {
        match self {
            AccessType::View => 0x1,
            AccessType::Use => 0x3,
            AccessType::Change => 0x7,
            AccessType::Control => 0xF,
        }
    }

    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            0x1 => Some(AccessType::View),
            0x3 => Some(AccessType::Use),
            0x7 => Some(AccessType::Change),
            0xF => Some(AccessType::Control),
            _ => None,
        }
    }

    /// Whether this level satisfies `requested`
    pub fn has_access(&self, requested: AccessType) -> bool {
        *self >= requested
    }

    /// The lower of both levels
    pub fn intersect(self, other: AccessType) -> AccessType {
        self.min(other)
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessType::View => "VIEW",
            AccessType::Use => "USE",
            AccessType::Change => "CHANGE",
            AccessType::Control => "CONTROL",
        };
        write!(f, "{}", name)
    }
}

impl Serialize for AccessType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.value())
    }
}

// =============================================================================
// Privileges
// =============================================================================

bitflags! {
    /// Privileges held by an access context
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Privilege: u64 {
        const OBJ_VIEW = 1 << 0;
        const OBJ_USE = 1 << 1;
        const OBJ_CHANGE = 1 << 2;
        const OBJ_CONTROL = 1 << 3;
        const OBJ_OWNER = 1 << 4;
        const SYS_ALL = Self::OBJ_VIEW.bits()
            | Self::OBJ_USE.bits()
            | Self::OBJ_CHANGE.bits()
            | Self::OBJ_CONTROL.bits()
            | Self::OBJ_OWNER.bits()
            | (1 << 63);
    }
}

impl Privilege {
    /// Highest object access granted by these privileges alone
    pub fn object_access(&self) -> Option<AccessType> {
        if self.contains(Privilege::OBJ_CONTROL) {
            Some(AccessType::Control)
        } else if self.contains(Privilege::OBJ_CHANGE) {
            Some(AccessType::Change)
        } else if self.contains(Privilege::OBJ_USE) {
            Some(AccessType::Use)
        } else if self.contains(Privilege::OBJ_VIEW) {
            Some(AccessType::View)
        } else {
            None
        }
    }
}

// =============================================================================
// Security Names
// =============================================================================

macro_rules! security_name {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Validates the name; names are stored upper-case
            pub fn new(name: impl AsRef<str>) -> Result<Self> {
                let name = name.as_ref();
                let valid = !name.is_empty()
                    && name.len() <= 24
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
                if !valid {
                    return Err(Error::InvalidName {
                        kind: $kind,
                        name: name.to_string(),
                        reason: "expected 1 to 24 letters, digits, '_' or '-'".into(),
                    });
                }
                Ok(Self(name.to_uppercase()))
            }

            pub fn value(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }
    };
}

security_name!(
    /// Authenticated subject
    Identity,
    "identity"
);

security_name!(
    /// Role a subject acts in; ACL entries are keyed by role
    Role,
    "role"
);

security_name!(
    /// Security domain of a subject or type of an object
    SecurityType,
    "security type"
);

const SYSTEM: &str = "SYSTEM";
const PUBLIC: &str = "PUBLIC";

impl Identity {
    pub fn system() -> Self {
        Self(SYSTEM.into())
    }

    pub fn public() -> Self {
        Self(PUBLIC.into())
    }
}

impl Role {
    pub fn system() -> Self {
        Self(SYSTEM.into())
    }

    pub fn public() -> Self {
        Self(PUBLIC.into())
    }
}

impl SecurityType {
    pub fn system() -> Self {
        Self(SYSTEM.into())
    }

    pub fn public() -> Self {
        Self(PUBLIC.into())
    }
}

// =============================================================================
// Access Context
// =============================================================================

/// Caller identity used for every authorization check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    identity: Identity,
    role: Role,
    domain: SecurityType,
    privileges: Privilege,
}

impl AccessContext {
    pub fn new(identity: Identity, role: Role, domain: SecurityType, privileges: Privilege) -> Self {
        Self {
            identity,
            role,
            domain,
            privileges,
        }
    }

    /// Context with every privilege; reserved for the loader and other
    /// infrastructure
    pub(crate) fn system() -> Self {
        Self::new(
            Identity::system(),
            Role::system(),
            SecurityType::system(),
            Privilege::SYS_ALL,
        )
    }

    /// Unprivileged context
    pub fn public() -> Self {
        Self::new(
            Identity::public(),
            Role::public(),
            SecurityType::public(),
            Privilege::empty(),
        )
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn domain(&self) -> &SecurityType {
        &self.domain
    }

    pub fn privileges(&self) -> Privilege {
        self.privileges
    }

    /// Same subject with a reduced privilege set
    pub fn with_privileges(&self, privileges: Privilege) -> Self {
        Self {
            privileges,
            ..self.clone()
        }
    }
}

impl fmt::Display for AccessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.identity, self.role, self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_type_order() {
        assert!(AccessType::View < AccessType::Use);
        assert!(AccessType::Use < AccessType::Change);
        assert!(AccessType::Change < AccessType::Control);
        assert!(AccessType::Control.has_access(AccessType::View));
        assert!(!AccessType::Use.has_access(AccessType::Change));
        assert_eq!(AccessType::Change.intersect(AccessType::Use), AccessType::Use);
        assert_eq!(AccessType::from_value(0x7), Some(AccessType::Change));
        assert_eq!(AccessType::from_value(0x2), None);
    }

    #[test]
    fn test_privilege_object_access() {
        assert_eq!(Privilege::SYS_ALL.object_access(), Some(AccessType::Control));
        assert_eq!(
            (Privilege::OBJ_VIEW | Privilege::OBJ_USE).object_access(),
            Some(AccessType::Use)
        );
        assert_eq!(Privilege::empty().object_access(), None);
    }

    #[test]
    fn test_contexts() {
        let system = AccessContext::system();
        assert_eq!(system.role(), &Role::system());
        assert!(system.privileges().contains(Privilege::OBJ_OWNER));

        let public = AccessContext::public();
        assert!(public.privileges().is_empty());

        let admin = AccessContext::new(
            Identity::new("alice").unwrap(),
            Role::new("admin").unwrap(),
            SecurityType::public(),
            Privilege::OBJ_VIEW,
        );
        assert_eq!(admin.to_string(), "ALICE/ADMIN@PUBLIC");
        assert!(Role::new("no spaces").is_err());
    }
}
