//! Per-window staging layout and atomicity discipline.
//!
//! Each window stages under one prefix:
//!
//! ```text
//! <root>/vault=<vault_id>/incr/stoptime=<YYYYMMDDHHMM>/manifest.csv
//!                                                     /<object>_upsert.<csv|parquet>
//!                                                     /<object>_delete.<csv|parquet>
//! <root>/vault=<vault_id>/log/date=<YYYYMMDD>/log_manifest.csv
//! <root>/vault=<vault_id>/full/date=<YYYYMMDD>/full_manifest.csv
//! ```
//!
//! The manifest is always written **last**, so manifest presence is the
//! durability marker: a manifest exists at a prefix only if every data file
//! it references was written first.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::storage::{MultipartUpload, StorageBackend, WritePrecondition, WriteResult};
use crate::types::{LoadType, WindowRef};

/// Returns the staging prefix for a window, without trailing slash.
#[must_use]
pub fn window_prefix(root: &str, window: &WindowRef) -> String {
    let partition = match window.load_type {
        LoadType::Incr => format!("stoptime={}", window.logical_time.key()),
        LoadType::Log | LoadType::Full => format!("date={}", window.logical_time.date_key()),
    };
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        format!(
            "vault={}/{}/{partition}",
            window.vault_id,
            window.load_type.as_str()
        )
    } else {
        format!(
            "{root}/vault={}/{}/{partition}",
            window.vault_id,
            window.load_type.as_str()
        )
    }
}

/// Returns the manifest file name for a load type.
#[must_use]
pub fn manifest_name(load_type: LoadType) -> &'static str {
    match load_type {
        LoadType::Incr => "manifest.csv",
        LoadType::Log => "log_manifest.csv",
        LoadType::Full => "full_manifest.csv",
    }
}

/// Durable write/read of one window's manifest and data files.
///
/// Cheap to clone; all clones share the backend.
pub struct StagingArea {
    backend: Arc<dyn StorageBackend>,
    root: String,
}

impl Clone for StagingArea {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            root: self.root.clone(),
        }
    }
}

impl StagingArea {
    /// Creates a staging area rooted at `root` within the backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, root: impl Into<String>) -> Self {
        Self {
            backend,
            root: root.into(),
        }
    }

    /// The staging prefix for a window.
    #[must_use]
    pub fn prefix(&self, window: &WindowRef) -> String {
        window_prefix(&self.root, window)
    }

    /// Full path of a data file inside a window.
    #[must_use]
    pub fn data_path(&self, window: &WindowRef, file_name: &str) -> String {
        format!("{}/{file_name}", self.prefix(window))
    }

    /// Full path of the window's manifest.
    #[must_use]
    pub fn manifest_path(&self, window: &WindowRef) -> String {
        self.data_path(window, manifest_name(window.load_type))
    }

    /// Path for the raw vendor archive staged before extraction.
    #[must_use]
    pub fn archive_path(&self, window: &WindowRef, file_name: &str) -> String {
        format!("{}/_archive/{file_name}", self.prefix(window))
    }

    /// Writes one data file under the window prefix.
    ///
    /// Data files are written before the manifest; re-staging overwrites.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage write fails.
    pub async fn write_data_file(
        &self,
        window: &WindowRef,
        file_name: &str,
        data: Bytes,
    ) -> Result<()> {
        let path = self.data_path(window, file_name);
        self.backend
            .put(&path, data, WritePrecondition::None)
            .await?;
        Ok(())
    }

    /// Starts a multipart upload for the raw vendor archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload could not be started.
    pub async fn start_archive_upload(
        &self,
        window: &WindowRef,
        file_name: &str,
    ) -> Result<Box<dyn MultipartUpload>> {
        let path = self.archive_path(window, file_name);
        self.backend.start_multipart(&path).await
    }

    /// Writes the raw vendor archive in one shot (single-part files).
    ///
    /// # Errors
    ///
    /// Returns an error if the storage write fails.
    pub async fn write_archive(
        &self,
        window: &WindowRef,
        file_name: &str,
        data: Bytes,
    ) -> Result<()> {
        let path = self.archive_path(window, file_name);
        self.backend
            .put(&path, data, WritePrecondition::None)
            .await?;
        Ok(())
    }

    /// Reads the staged raw archive.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the archive was never staged.
    pub async fn read_archive(&self, window: &WindowRef, file_name: &str) -> Result<Bytes> {
        self.backend.get(&self.archive_path(window, file_name)).await
    }

    /// Writes the manifest, completing the window.
    ///
    /// Write-once: a duplicate write of an already-finished window is a
    /// no-op, mirroring idempotent producer retries.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage write fails.
    pub async fn finish_window(&self, window: &WindowRef, manifest: Bytes) -> Result<()> {
        let path = self.manifest_path(window);
        match self
            .backend
            .put(&path, manifest, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => {
                tracing::debug!(window = %window, "window staged");
                Ok(())
            }
            WriteResult::PreconditionFailed { .. } => {
                tracing::debug!(window = %window, "window already staged");
                Ok(())
            }
        }
    }

    /// Reads the window's manifest.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the window was never finished.
    pub async fn read_manifest(&self, window: &WindowRef) -> Result<Bytes> {
        self.backend.get(&self.manifest_path(window)).await
    }

    /// Reads one data file from the window.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the file is absent.
    pub async fn read_data_file(&self, window: &WindowRef, file_name: &str) -> Result<Bytes> {
        self.backend.get(&self.data_path(window, file_name)).await
    }

    /// Returns whether the window's manifest has been written.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage head fails.
    pub async fn is_finished(&self, window: &WindowRef) -> Result<bool> {
        Ok(self.backend.head(&self.manifest_path(window)).await?.is_some())
    }

    /// Verifies that every referenced file exists under the window prefix.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` naming the first missing file.
    pub async fn verify_files(&self, window: &WindowRef, file_names: &[String]) -> Result<()> {
        for file_name in file_names {
            let path = self.data_path(window, file_name);
            if self.backend.head(&path).await?.is_none() {
                return Err(Error::NotFound(format!(
                    "manifest references missing file: {path}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use crate::types::{LogicalTime, VaultId};

    fn window(load_type: LoadType, key: &str) -> WindowRef {
        WindowRef::new(
            VaultId::new("v1").unwrap(),
            load_type,
            LogicalTime::parse_key(key).unwrap(),
        )
    }

    fn staging() -> StagingArea {
        StagingArea::new(Arc::new(MemoryBackend::new()), "lake")
    }

    #[test]
    fn prefix_layout_per_load_type() {
        let incr = window(LoadType::Incr, "202401010015");
        assert_eq!(
            window_prefix("lake", &incr),
            "lake/vault=v1/incr/stoptime=202401010015"
        );

        let log = window(LoadType::Log, "20240101");
        assert_eq!(window_prefix("lake", &log), "lake/vault=v1/log/date=20240101");

        let full = window(LoadType::Full, "20240101");
        assert_eq!(
            window_prefix("", &full),
            "vault=v1/full/date=20240101"
        );
    }

    #[test]
    fn manifest_name_per_load_type() {
        assert_eq!(manifest_name(LoadType::Incr), "manifest.csv");
        assert_eq!(manifest_name(LoadType::Log), "log_manifest.csv");
        assert_eq!(manifest_name(LoadType::Full), "full_manifest.csv");
    }

    #[tokio::test]
    async fn manifest_written_last_marks_completion() {
        let staging = staging();
        let win = window(LoadType::Incr, "202401010015");

        staging
            .write_data_file(&win, "product__v_upsert.csv", Bytes::from("id\n1\n"))
            .await
            .expect("data");
        assert!(!staging.is_finished(&win).await.expect("finished"));

        staging
            .finish_window(&win, Bytes::from("object_name,operation\n"))
            .await
            .expect("finish");
        assert!(staging.is_finished(&win).await.expect("finished"));
    }

    #[tokio::test]
    async fn finish_window_is_idempotent() {
        let staging = staging();
        let win = window(LoadType::Incr, "202401010015");

        staging
            .finish_window(&win, Bytes::from("m"))
            .await
            .expect("first");
        staging
            .finish_window(&win, Bytes::from("m"))
            .await
            .expect("second");

        assert_eq!(
            staging.read_manifest(&win).await.expect("read"),
            Bytes::from("m")
        );
    }

    #[tokio::test]
    async fn verify_files_names_missing_file() {
        let staging = staging();
        let win = window(LoadType::Incr, "202401010015");
        staging
            .write_data_file(&win, "present.csv", Bytes::from("x"))
            .await
            .expect("data");

        staging
            .verify_files(&win, &["present.csv".into()])
            .await
            .expect("present");

        let err = staging
            .verify_files(&win, &["present.csv".into(), "absent.csv".into()])
            .await
            .expect_err("absent");
        assert!(err.to_string().contains("absent.csv"));
    }
}
