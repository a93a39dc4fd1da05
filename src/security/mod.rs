//! Security layer - Access contexts and per-object protection
//!
//! Every entity owns one [`ObjectProtection`]; every accessor and mutator
//! checks the calling [`AccessContext`] against it before doing anything
//! else.

pub mod access;
pub mod paths;
pub mod protection;

pub use access::{AccessContext, AccessType, Identity, Privilege, Role, SecurityType};
pub use protection::ObjectProtection;
