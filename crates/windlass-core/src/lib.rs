//! # windlass-core
//!
//! Core abstractions for the windlass sync pipeline.
//!
//! This crate provides the foundational types and contracts used across all
//! windlass components:
//!
//! - **Identifiers**: Strongly-typed vault, window and epoch IDs
//! - **Storage**: Object-storage contract with conditional writes and
//!   bounded-memory multipart uploads
//! - **Staging**: Per-window prefix layout with manifest-last atomicity
//! - **Control Plane**: The durable window queue and vault state, with CAS
//!   transitions, leases and a change feed
//! - **Configuration and Observability**: Env-driven immutable config and
//!   tracing setup
//!
//! ## Crate Boundary
//!
//! `windlass-core` is the only crate allowed to define shared primitives.
//! The producer, consumer and apply engine live in `windlass-flow` and
//! interact exclusively through the contracts defined here.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod lease;
pub mod observability;
pub mod queue;
pub mod retry;
pub mod staging;
pub mod storage;
pub mod types;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::SyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::lease::VaultLease;
    pub use crate::queue::{
        ChangeEvent, ChangeFeed, ControlPlane, EntryStatus, LeaseRecord, ObjectControlPlane,
        RegisterOutcome, StatusUpdate, VaultMode, VaultState, VaultStateUpdate, WindowEntry,
    };
    pub use crate::staging::StagingArea;
    pub use crate::storage::{
        MemoryBackend, MultipartUpload, ObjectMeta, ObjectStoreBackend, StorageBackend,
        WritePrecondition, WriteResult,
    };
    pub use crate::types::{
        Epoch, LeaseScope, LoadType, LogicalTime, SortKey, VaultId, WindowRef,
    };
}

// Re-export key types at crate root for ergonomics
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use lease::VaultLease;
pub use observability::{LogFormat, init_logging};
pub use queue::{
    ChangeEvent, ChangeFeed, ControlPlane, EntryStatus, LeaseRecord, ObjectControlPlane,
    RegisterOutcome, StatusUpdate, VaultMode, VaultState, VaultStateUpdate, WindowEntry,
};
pub use staging::StagingArea;
pub use storage::{
    MemoryBackend, MultipartUpload, ObjectMeta, ObjectStoreBackend, StorageBackend,
    WritePrecondition, WriteResult,
};
pub use types::{Epoch, LeaseScope, LoadType, LogicalTime, SortKey, VaultId, WindowRef};
