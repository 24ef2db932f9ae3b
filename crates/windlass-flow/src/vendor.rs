//! Vendor feed contract.
//!
//! The vendor exposes time-windowed change sets ("windows") as tar.gz
//! archives, possibly split into multiple file parts. The client is a thin
//! adapter; windlass only depends on this contract.

use async_trait::async_trait;
use bytes::Bytes;

use windlass_core::types::{LoadType, LogicalTime};

use crate::error::Result;

/// One downloadable part of a window archive.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// Vendor-side name used to fetch the part.
    pub name: String,
    /// 1-based part number; parts concatenate in order.
    pub part_number: u32,
}

/// One available window advertised by the vendor.
#[derive(Debug, Clone)]
pub struct WindowDescriptor {
    /// The kind of change set.
    pub load_type: LoadType,
    /// Window stop time; becomes the entry's logical time.
    pub stop_time: LogicalTime,
    /// Archive file name, e.g. `88071-20240101-0015-N.tar.gz`.
    pub file_name: String,
    /// Total records across the window. Zero-record windows are skipped.
    pub record_count: u64,
    /// The archive's file parts in upload order.
    pub parts: Vec<FilePart>,
}

/// Client for the vendor's window listing and download API.
#[async_trait]
pub trait VendorClient: Send + Sync + 'static {
    /// Lists windows of `load_type` with stop times in `(start, stop]`.
    ///
    /// Order is vendor-defined; callers sort by stop time.
    async fn list_windows(
        &self,
        load_type: LoadType,
        start: LogicalTime,
        stop: LogicalTime,
    ) -> Result<Vec<WindowDescriptor>>;

    /// Downloads one file part.
    async fn fetch_part(&self, part_name: &str) -> Result<Bytes>;
}
