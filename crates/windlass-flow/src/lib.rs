//! # windlass-flow
//!
//! The sync pipeline domain for windlass: producer, consumer orchestrator
//! and apply engine.
//!
//! ## Core Concepts
//!
//! - **Window**: one time-bounded change set from the vendor, staged under
//!   its own prefix and registered as a queue entry
//! - **Producer**: stages windows and registers READY entries; idempotent
//!   on the window's logical time
//! - **Consumer**: acquires the per-vault lease, selects the earliest
//!   eligible window and drives the apply engine
//! - **Apply**: schema reconciliation plus one warehouse transaction per
//!   window
//!
//! ## Guarantees
//!
//! - Windows of one vault and load type apply in strictly ascending
//!   logical time
//! - At most one window per vault is in flight at any instant
//! - The watermark advances only when a warehouse transaction commits

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod admin;
pub mod alerts;
pub mod apply;
pub mod archive;
pub mod columnar;
pub mod consumer;
pub mod error;
pub mod manifest;
pub mod producer;
pub mod schema;
pub mod vendor;
pub mod warehouse;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::admin::{FullEntrySpec, reset_failed, trigger_full_load};
    pub use crate::alerts::{Alert, AlertSeverity, AlertSink, MemoryAlertSink, TracingAlertSink};
    pub use crate::apply::{ApplyEngine, ApplyOutcome};
    pub use crate::consumer::{Consumer, DrainReport};
    pub use crate::error::{Error, Result};
    pub use crate::manifest::{DataFileRef, Manifest, ManifestRow};
    pub use crate::producer::{Producer, ProducerReport};
    pub use crate::schema::{ColumnSpec, LogicalType, SchemaRegistry};
    pub use crate::vendor::{FilePart, VendorClient, WindowDescriptor};
    pub use crate::warehouse::{MemoryWarehouse, Warehouse, WarehouseTxn};
}

pub use admin::{FullEntrySpec, reset_failed, trigger_full_load};
pub use alerts::{Alert, AlertSeverity, AlertSink, MemoryAlertSink, TracingAlertSink};
pub use apply::{ApplyEngine, ApplyOutcome};
pub use consumer::{Consumer, DrainReport};
pub use error::{Error, Result};
pub use manifest::{DataFileRef, Manifest, ManifestRow};
pub use producer::{Producer, ProducerReport};
pub use schema::{ColumnSpec, LogicalType, SchemaRegistry};
pub use vendor::{FilePart, VendorClient, WindowDescriptor};
pub use warehouse::{MemoryWarehouse, Warehouse, WarehouseTxn};
