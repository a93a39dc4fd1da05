//! Domain layer - Checked values shared by the entity graph
//!
//! Names are case-insensitive identifiers validated at construction,
//! numbers are range-checked and never clamped, and the enumerations
//! describe node roles, transports and storage providers.

pub mod kinds;
pub mod names;
pub mod numbers;

pub use kinds::*;
pub use names::*;
pub use numbers::*;
