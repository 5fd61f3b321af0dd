//! Idempotent dispatch guard.
//!
//! At most one worker may advance a given job at a time. A worker takes a
//! [`DispatchLease`] before touching the job; a second dispatch for the same
//! key is turned away while the lease is live. Leases live in the control
//! store, so workers in separate processes see each other's claims. They
//! expire after a TTL, so a crashed worker cannot block a job forever, and
//! [`DispatchGuard::run_exclusive`] renews them while the work runs.

use crate::errors::DocflowError;
use crate::storage::ControlStore;
use crate::utils::{to_chrono, Clock};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hands out exclusive, expiring leases keyed by job.
#[derive(Debug, Clone)]
pub struct DispatchGuard {
    control: Arc<dyn ControlStore>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl DispatchGuard {
    /// Creates a guard whose leases live for `ttl` unless renewed.
    #[must_use]
    pub fn new(control: Arc<dyn ControlStore>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { control, ttl, clock }
    }

    /// Lease lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Tries to take the lease for `key`.
    ///
    /// Returns `None` while another live lease holds it. An expired lease is
    /// taken over.
    ///
    /// # Errors
    ///
    /// Control-store failures.
    pub async fn try_acquire(&self, key: impl Into<String>) -> Result<Option<DispatchLease>, DocflowError> {
        let key = key.into();
        let token = crate::utils::generate_id();
        let now = self.clock.now();
        if !self
            .control
            .acquire_lease(&key, token, now, now + to_chrono(self.ttl))
            .await?
        {
            return Ok(None);
        }
        Ok(Some(DispatchLease {
            key,
            token,
            guard: self.clone(),
            released: false,
        }))
    }

    /// Runs `work` while holding the lease for `key`, renewing it every
    /// third of the TTL. Returns `None` without polling `work` if the key is
    /// held elsewhere.
    ///
    /// # Errors
    ///
    /// Control-store failures while acquiring. Renewal and release failures
    /// are logged; the lease then lapses at its expiry.
    pub async fn run_exclusive<F>(&self, key: impl Into<String>, work: F) -> Result<Option<F::Output>, DocflowError>
    where
        F: Future,
    {
        let Some(lease) = self.try_acquire(key).await? else {
            return Ok(None);
        };
        let renew_every = (self.ttl / 3).max(Duration::from_millis(10));

        tokio::pin!(work);
        let output = loop {
            tokio::select! {
                biased;
                output = &mut work => break output,
                () = tokio::time::sleep(renew_every) => match lease.renew().await {
                    Ok(true) => debug!(dispatch_key = %lease.key, "Dispatch lease renewed"),
                    Ok(false) => warn!(dispatch_key = %lease.key, "Dispatch lease lost while work was running"),
                    Err(err) => warn!(dispatch_key = %lease.key, error = %err, "Dispatch lease renewal failed"),
                },
            }
        };

        if let Err(err) = lease.release().await {
            warn!(error = %err, "Dispatch lease release failed");
        }
        Ok(Some(output))
    }

    /// Returns true if a live lease exists for `key`.
    ///
    /// # Errors
    ///
    /// Control-store failures.
    pub async fn is_held(&self, key: &str) -> Result<bool, DocflowError> {
        let now = self.clock.now();
        Ok(self.control.lease_expiry(key).await?.is_some_and(|expiry| expiry > now))
    }
}

/// An exclusive claim on a dispatch key.
///
/// Release it with [`DispatchLease::release`]. A lease dropped without
/// release is given back in a background task when a runtime is available,
/// and otherwise lapses at its expiry.
#[derive(Debug)]
pub struct DispatchLease {
    key: String,
    token: Uuid,
    guard: DispatchGuard,
    released: bool,
}

impl DispatchLease {
    /// The leased key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Pushes the expiry one TTL past now. Returns false if the lease was
    /// taken over after expiring.
    ///
    /// # Errors
    ///
    /// Control-store failures.
    pub async fn renew(&self) -> Result<bool, DocflowError> {
        let expires_at = self.guard.clock.now() + to_chrono(self.guard.ttl);
        Ok(self.guard.control.renew_lease(&self.key, self.token, expires_at).await?)
    }

    /// Gives the key back. A takeover after expiry is left alone.
    ///
    /// # Errors
    ///
    /// Control-store failures.
    pub async fn release(mut self) -> Result<(), DocflowError> {
        self.released = true;
        self.guard.control.release_lease(&self.key, self.token).await?;
        Ok(())
    }
}

impl Drop for DispatchLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let control = Arc::clone(&self.guard.control);
        let key = std::mem::take(&mut self.key);
        let token = self.token;
        runtime.spawn(async move {
            if let Err(err) = control.release_lease(&key, token).await {
                warn!(dispatch_key = %key, error = %err, "Dispatch lease release failed");
            }
        });
    }
}
