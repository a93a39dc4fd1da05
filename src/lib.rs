//! Storage Topology Controller
//!
//! Transactional core of a controller for replicated block storage
//! clusters. It keeps the live object graph of nodes, storage pools,
//! resources, volumes, snapshots and the connections between them, guards
//! every object with an access control list and persists changes through
//! commit/rollback transaction scopes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Controller                             │
//! │   config · number allocation · factories · metrics · scopes      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                      Object Graph (objects)                      │
//! │  Node ── NetInterface      StorPoolDefinition ── StorPool        │
//! │   │                                                │             │
//! │  Resource ── Volume ───────────────────────────────┘             │
//! │   │           │                                                  │
//! │  ResourceDefinition ── VolumeDefinition                          │
//! │   │                                                              │
//! │  SnapshotDefinition ── SnapshotVolumeDefinition                  │
//! │   └── Snapshot ── SnapshotVolume                                 │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  security        transaction         props        stateflags     │
//! │  (ACLs)          (scopes, maps)      (key/value)  (bit sets)     │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                persistence (drivers, loader, database)           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Controller instance, scopes and factories
//! - [`objects`]: Entity graph and its API data
//! - [`transaction`]: Transaction manager and transactional containers
//! - [`persistence`]: Database abstraction, drivers and the graph loader
//! - [`security`]: Access contexts and object protection
//! - [`domain`]: Checked names, numbers and enumerations
//! - [`error`]: Error types and handling

#![recursion_limit = "256"]

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod numberpool;
pub mod objects;
pub mod persistence;
pub mod props;
pub mod security;
pub mod stateflags;
pub mod transaction;

// Re-export commonly used types
pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::{Error, ErrorClass, Result};
pub use metrics::ControllerMetrics;

pub use objects::{
    CoreObjects, InstanceMode, NetInterface, Node, NodeConnection, Resource, ResourceConnection,
    ResourceDefinition, Snapshot, SnapshotDefinition, SnapshotVolume, SnapshotVolumeDefinition, StorPool,
    StorPoolDefinition, Volume, VolumeConnection, VolumeDefinition,
};

pub use persistence::{Database, DatabaseDrivers, DatabaseLoader, MemoryDatabase};
pub use security::{AccessContext, ObjectProtection};
pub use transaction::TransactionMgr;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
