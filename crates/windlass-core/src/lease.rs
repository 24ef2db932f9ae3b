//! Per-vault exclusion lease held by one consumer process.
//!
//! A lease is a time-bounded claim on a `(vault, stream)` pair stored in
//! the control plane. Acquisition honors expiry of a crashed holder; loss
//! of the lease mid-apply is detected by [`VaultLease::is_held`] before the
//! warehouse transaction commits. Release is explicit; a process that exits
//! without releasing is covered by the TTL.

use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use crate::error::Result;
use crate::queue::ControlPlane;
use crate::types::{LeaseScope, VaultId};

/// RAII-free lease guard. All cleanup paths are explicit calls.
pub struct VaultLease {
    plane: Arc<dyn ControlPlane>,
    vault: VaultId,
    scope: LeaseScope,
    owner: String,
    ttl: Duration,
}

impl VaultLease {
    /// Attempts to acquire the `(vault, scope)` lease with the given TTL.
    ///
    /// Returns `None` when another live holder owns the lease; that is a
    /// normal outcome ("another runner owns it"), not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane is unreachable or the vault
    /// state does not exist.
    pub async fn acquire(
        plane: Arc<dyn ControlPlane>,
        vault: VaultId,
        scope: LeaseScope,
        ttl: Duration,
    ) -> Result<Option<Self>> {
        let owner = Ulid::new().to_string();
        if plane.acquire_lease(&vault, scope, &owner, ttl).await? {
            tracing::debug!(vault = %vault, scope = %scope, owner = %owner, "lease acquired");
            Ok(Some(Self {
                plane,
                vault,
                scope,
                owner,
                ttl,
            }))
        } else {
            Ok(None)
        }
    }

    /// Returns the unique holder ID of this lease.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Extends the lease by its TTL.
    ///
    /// # Errors
    ///
    /// Returns `Error::PreconditionFailed` if the lease was taken over.
    pub async fn renew(&self) -> Result<()> {
        self.plane
            .renew_lease(&self.vault, self.scope, &self.owner, self.ttl)
            .await
    }

    /// Returns whether this process still holds a live lease.
    ///
    /// Checked immediately before COMMIT: a lost lease aborts the window.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane is unreachable.
    pub async fn is_held(&self) -> Result<bool> {
        Ok(self
            .plane
            .lease_holder(&self.vault, self.scope)
            .await?
            .is_some_and(|holder| holder.owner == self.owner && !holder.is_expired()))
    }

    /// Releases the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane is unreachable.
    pub async fn release(self) -> Result<()> {
        self.plane
            .release_lease(&self.vault, self.scope, &self.owner)
            .await
    }
}
