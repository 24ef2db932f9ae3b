//! Error types for the sync pipeline domain.

use windlass_core::types::VaultId;

/// The result type used throughout windlass-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in producer, consumer and apply operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A vendor API call failed.
    #[error("vendor error: {message}")]
    Vendor {
        /// Description of the vendor failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The vendor archive could not be unpacked.
    #[error("archive error: {message}")]
    Archive {
        /// Description of the archive failure.
        message: String,
    },

    /// The window manifest is malformed or references missing files.
    ///
    /// Fatal for the window; the entry is marked FAILED for an operator.
    #[error("invalid manifest: {message}")]
    ManifestInvalid {
        /// Description of the manifest problem.
        message: String,
    },

    /// A schema change outside the allowed widening matrix.
    ///
    /// Never applied silently; fails the window before any DDL runs.
    #[error(
        "incompatible schema change on {object}.{column}: {from_type} -> {to_type}"
    )]
    IncompatibleSchemaChange {
        /// Affected object (table).
        object: String,
        /// Affected column.
        column: String,
        /// The live column type.
        from_type: String,
        /// The requested column type.
        to_type: String,
    },

    /// A warehouse statement or transaction failed.
    #[error("warehouse error: {message}")]
    Warehouse {
        /// Description of the warehouse failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The consumer's lease lapsed mid-apply.
    ///
    /// The transaction is rolled back before commit; the entry stays
    /// PROCESSING and recovers via lease TTL.
    #[error("lease lost for vault {vault_id} during apply")]
    LeaseLost {
        /// The vault whose lease lapsed.
        vault_id: VaultId,
    },

    /// A columnar conversion (CSV/arrow/parquet) failed.
    #[error("columnar conversion error: {message}")]
    Columnar {
        /// Description of the conversion failure.
        message: String,
    },

    /// An error from windlass-core.
    #[error("core error: {0}")]
    Core(#[from] windlass_core::Error),
}

impl Error {
    /// Creates a new vendor error.
    #[must_use]
    pub fn vendor(message: impl Into<String>) -> Self {
        Self::Vendor {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new vendor error with a source.
    #[must_use]
    pub fn vendor_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Vendor {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new warehouse error.
    #[must_use]
    pub fn warehouse(message: impl Into<String>) -> Self {
        Self::Warehouse {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new manifest error.
    #[must_use]
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::ManifestInvalid {
            message: message.into(),
        }
    }

    /// Creates a new columnar conversion error.
    #[must_use]
    pub fn columnar(message: impl std::fmt::Display) -> Self {
        Self::Columnar {
            message: message.to_string(),
        }
    }

    /// Returns whether this failure requires operator intervention.
    ///
    /// Protocol errors are never retried: the same input will fail the same
    /// way.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::ManifestInvalid { .. }
                | Self::IncompatibleSchemaChange { .. }
                | Self::Core(windlass_core::Error::DuplicateChecksum { .. })
        )
    }

    /// Returns whether this failure is worth retrying locally.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_transient())
    }
}
