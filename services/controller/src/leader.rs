//! Leader election over a lease object.
//!
//! Exactly one controller manager runs the controllers at a time. The lease
//! is claimed and renewed with compare-and-swap writes; a holder that fails
//! to renew for a full lease duration is treated as gone and can be taken
//! over. Losing leadership is fatal to the process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetplane_api::{Lease, LeaseSpec, ObjectKey, ObjectMeta};
use fleetplane_id::RequestId;
use fleetplane_reconcile::Clock;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("leadership lost to {holder}")]
    Lost { holder: String },

    #[error("lease not renewed within {0:?}")]
    Expired(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one acquire-or-renew attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Leading,
    /// Someone else holds an unexpired lease.
    Following { holder: String },
    /// Another candidate wrote the lease first; try again next tick.
    Contended,
}

pub struct LeaderElector {
    leases: Store<Lease>,
    clock: Arc<dyn Clock>,
    key: ObjectKey,
    identity: String,
    lease_duration: Duration,
    renew_period: Duration,
}

impl LeaderElector {
    pub fn new(
        leases: Store<Lease>,
        clock: Arc<dyn Clock>,
        key: ObjectKey,
        identity: impl Into<String>,
        lease_duration: Duration,
        renew_period: Duration,
    ) -> Self {
        Self {
            leases,
            clock,
            key,
            identity: identity.into(),
            lease_duration,
            renew_period,
        }
    }

    pub fn from_config(config: &Config, leases: Store<Lease>, clock: Arc<dyn Clock>) -> Self {
        let election = &config.leader_election;
        let identity = election
            .identity
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.cluster_name, RequestId::new()));
        Self::new(
            leases,
            clock,
            ObjectKey::new(&election.namespace, &election.lease_name),
            identity,
            Duration::from_secs(u64::from(election.lease_duration_secs)),
            Duration::from_secs(election.renew_period_secs),
        )
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn lease_seconds(&self) -> u32 {
        u32::try_from(self.lease_duration.as_secs()).unwrap_or(u32::MAX)
    }

    pub fn try_acquire_or_renew(&self) -> Result<Attempt, LeaderError> {
        let now = self.clock.now();
        let Some(lease) = self.leases.get(&self.key) else {
            let lease = Lease {
                metadata: ObjectMeta::named(&self.key.namespace, &self.key.name),
                spec: LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: self.lease_seconds(),
                    acquire_time: Some(now),
                    renew_time: Some(now),
                    lease_transitions: 0,
                },
            };
            return match self.leases.create(lease) {
                Ok(_) => Ok(Attempt::Leading),
                Err(StoreError::AlreadyExists { .. }) => Ok(Attempt::Contended),
                Err(e) => Err(e.into()),
            };
        };

        let holder = lease.spec.holder_identity.clone();
        let mine = holder.as_deref() == Some(self.identity.as_str());
        if let Some(holder) = holder.filter(|_| !mine) {
            if !lease.is_expired(now) {
                return Ok(Attempt::Following { holder });
            }
            info!(previous = %holder, "Lease expired, taking over");
        }

        let mut next = lease;
        if !mine {
            next.spec.holder_identity = Some(self.identity.clone());
            next.spec.acquire_time = Some(now);
            next.spec.lease_transitions += 1;
        }
        next.spec.renew_time = Some(now);
        next.spec.lease_duration_seconds = self.lease_seconds();
        match self.leases.update(next) {
            Ok(_) => Ok(Attempt::Leading),
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(Attempt::Contended),
            Err(e) => Err(e.into()),
        }
    }

    /// Give the lease up so a successor need not wait for it to expire.
    pub fn release(&self) -> Result<(), LeaderError> {
        let Some(mut lease) = self.leases.get(&self.key) else {
            return Ok(());
        };
        if lease.spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        lease.spec.holder_identity = None;
        lease.spec.renew_time = None;
        match self.leases.update(lease) {
            Ok(_) => {
                info!(identity = %self.identity, "Released leadership");
                Ok(())
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Campaign and renew until `shutdown` flips or leadership is lost.
    ///
    /// `leading` is set while this process holds the lease. Returns an error
    /// when leadership is lost, after clearing `leading`.
    pub async fn run(
        &self,
        leading: watch::Sender<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), LeaderError> {
        info!(identity = %self.identity, lease = %self.key, "Starting leader election");
        let mut last_renewed: Option<DateTime<Utc>> = None;

        loop {
            let attempt = match self.try_acquire_or_renew() {
                Ok(attempt) => attempt,
                Err(e) => {
                    warn!(error = %e, "Lease write failed");
                    Attempt::Contended
                }
            };
            let now = self.clock.now();
            let was_leading = *leading.borrow();

            match attempt {
                Attempt::Leading => {
                    last_renewed = Some(now);
                    if !was_leading {
                        info!(identity = %self.identity, "Acquired leadership");
                        leading.send_replace(true);
                    }
                }
                Attempt::Following { holder } if was_leading => {
                    leading.send_replace(false);
                    return Err(LeaderError::Lost { holder });
                }
                Attempt::Following { holder } => {
                    debug!(holder = %holder, "Following");
                }
                Attempt::Contended => {
                    let renewed_within = last_renewed.is_some_and(|at| {
                        (now - at).to_std().unwrap_or(Duration::ZERO) < self.lease_duration
                    });
                    if was_leading && !renewed_within {
                        leading.send_replace(false);
                        return Err(LeaderError::Expired(self.lease_duration));
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.renew_period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }

        if *leading.borrow() {
            leading.send_replace(false);
            self.release()?;
        }
        Ok(())
    }
}
