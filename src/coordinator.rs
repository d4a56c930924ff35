//! Device state machine: acquire, release, activation, idle-timeout
//! auto-release, and cool-down dispatch.
//!
//! A device is in one of four derived states — ABSENT (no sources), IDLE
//! (present, not using, not colding), BUSY (present, using), COOLING
//! (present, not using, colding). Acquire races linearize on the store's
//! compare-and-set; each lease's idle watcher is keyed on `usingBeganAt`,
//! so a stale watcher observes the epoch change and exits without acting.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::errors::{AcquireError, ReleaseError};
use crate::identity::Principal;
use crate::store::{Source, Store};
use crate::ws::provider::ReleaseChannel;

/// Timer knobs, separated from [`crate::config::Config`] so tests can
/// shrink them.
#[derive(Debug, Clone)]
pub struct CoordinatorTiming {
    /// Bound on the provider cool-down HTTP callback.
    pub cold_timeout: std::time::Duration,
    /// How long a provider gets to complete cool-down before `colding` is
    /// force-cleared.
    pub cold_grace: std::time::Duration,
    /// Slack added to every idle-watcher sleep.
    pub idle_grace: std::time::Duration,
}

impl Default for CoordinatorTiming {
    fn default() -> Self {
        Self {
            cold_timeout: std::time::Duration::from_secs(10),
            cold_grace: std::time::Duration::from_secs(60),
            idle_grace: std::time::Duration::from_secs(3),
        }
    }
}

/// Who is asking for a release.
#[derive(Debug, Clone)]
pub enum ReleaseActor {
    /// Admins may release any device.
    Admin,
    /// A user may release only their own lease.
    User(String),
}

pub struct DeviceCoordinator {
    store: Arc<Store>,
    releaser: Arc<dyn ReleaseChannel>,
    http: reqwest::Client,
    timing: CoordinatorTiming,
}

impl DeviceCoordinator {
    pub fn new(
        store: Arc<Store>,
        releaser: Arc<dyn ReleaseChannel>,
        timing: CoordinatorTiming,
    ) -> Self {
        Self {
            store,
            releaser,
            http: reqwest::Client::new(),
            timing,
        }
    }

    // ─── Acquire ────────────────────────────────────────────────────────────

    /// Lease `udid` for `lease_email`. Visibility is checked against the
    /// calling principal (admins may lease on behalf of someone else).
    ///
    /// Exactly one of N concurrent callers wins the `¬using → using`
    /// compare-and-set; losers get [`AcquireError::RaceLost`]. Acquiring a
    /// device already leased by `lease_email` is an idempotent no-op.
    pub async fn acquire(
        self: &Arc<Self>,
        principal: &Principal,
        lease_email: &str,
        udid: &str,
        idle_timeout: i64,
    ) -> Result<(), AcquireError> {
        let Some(device) = self.store.device(udid).await? else {
            return Err(AcquireError::Absent);
        };
        if !auth::visible(principal, &device) {
            return Err(AcquireError::NotVisible);
        }
        if !device.present() {
            return Err(AcquireError::Absent);
        }
        if device.using {
            if device.user_id.as_deref() == Some(lease_email) {
                return Ok(());
            }
            return Err(AcquireError::Busy);
        }
        if device.colding {
            return Err(AcquireError::Colding);
        }

        if !self.store.try_claim(udid).await? {
            return Err(AcquireError::RaceLost);
        }

        let now = Utc::now();
        if !self
            .store
            .begin_lease(udid, lease_email, now, idle_timeout)
            .await?
        {
            // The device drained between the claim and the lease write.
            return Err(AcquireError::Absent);
        }
        info!(udid, user = lease_email, idle_timeout, "device acquired");
        self.spawn_idle_watcher(udid.to_string(), now, now, idle_timeout);
        Ok(())
    }

    /// Bump `lastActivatedAt` — only while `email` holds the lease.
    /// Rate-safe at arbitrary call frequency.
    pub async fn activate(&self, email: &str, udid: &str) -> Result<bool> {
        self.store.touch_activity(udid, email, Utc::now()).await
    }

    // ─── Release ────────────────────────────────────────────────────────────

    /// Release `udid` and enter cool-down. Releasing a device that is not
    /// in use is an idempotent no-op.
    pub async fn release(
        self: &Arc<Self>,
        udid: &str,
        actor: &ReleaseActor,
    ) -> Result<(), ReleaseError> {
        let Some(device) = self.store.device(udid).await? else {
            return Err(ReleaseError::NotFound);
        };
        if !device.using {
            return Ok(());
        }
        if let ReleaseActor::User(email) = actor {
            if device.user_id.as_deref() != Some(email.as_str()) {
                return Err(ReleaseError::NotOwner);
            }
        }

        let now = Utc::now();
        let elapsed = device
            .using_began_at
            .map(|began| (now - began).num_seconds())
            .unwrap_or(0);
        if !self.store.finish_lease(udid, elapsed).await? {
            // Someone else completed the release concurrently.
            return Ok(());
        }
        info!(
            udid,
            user = device.user_id.as_deref().unwrap_or(""),
            elapsed_secs = elapsed,
            "device released — entering cool-down"
        );

        // The highest-priority source owns cool-down.
        let Some(source) = device.best_source().cloned() else {
            // Device went absent mid-lease; nothing to cool.
            self.store.clear_colding(udid).await?;
            return Ok(());
        };

        if !self.releaser.send_release(&source.id, udid).await {
            warn!(udid, provider = %source.id, "release command undeliverable — provider session gone");
        }

        let coordinator = self.clone();
        let udid = udid.to_string();
        let epoch = device.using_began_at;
        tokio::spawn(async move {
            coordinator.cold_device(udid, source, epoch).await;
        });
        Ok(())
    }

    /// Fire the provider's cool-down endpoint and supervise completion.
    ///
    /// Any HTTP failure clears `colding` immediately so an offline provider
    /// cannot strand the device. On success the provider is expected to
    /// finish cool-down by re-publishing the device; if that never happens
    /// within the grace period, `colding` is cleared here as a fallback —
    /// but only while `usingBeganAt` still matches the released lease.
    async fn cold_device(
        self: Arc<Self>,
        udid: String,
        source: Source,
        epoch: Option<DateTime<Utc>>,
    ) {
        let url = format!("{}/cold", source.url.trim_end_matches('/'));
        let result = self
            .http
            .post(&url)
            .query(&[("udid", udid.as_str()), ("secret", source.secret.as_str())])
            .timeout(self.timing.cold_timeout)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(udid = %udid, url = %url, "cool-down accepted by provider");
                tokio::time::sleep(self.timing.cold_grace).await;
                match self.store.device(&udid).await {
                    Ok(Some(d)) if d.colding && d.using_began_at == epoch => {
                        warn!(udid = %udid, "provider never completed cool-down — clearing colding");
                        if let Err(e) = self.store.clear_colding(&udid).await {
                            error!(udid = %udid, err = %e, "failed to clear stuck colding");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!(udid = %udid, err = %e, "cool-down fallback read failed"),
                }
            }
            Ok(resp) => {
                warn!(udid = %udid, url = %url, status = %resp.status(), "cool-down rejected — clearing colding");
                if let Err(e) = self.store.clear_colding(&udid).await {
                    error!(udid = %udid, err = %e, "failed to clear colding");
                }
            }
            Err(e) => {
                warn!(udid = %udid, url = %url, err = %e, "cool-down request failed — clearing colding");
                if let Err(e) = self.store.clear_colding(&udid).await {
                    error!(udid = %udid, err = %e, "failed to clear colding");
                }
            }
        }
    }

    // ─── Idle watcher ───────────────────────────────────────────────────────

    /// One watcher per lease, keyed on the lease epoch (`usingBeganAt`).
    /// Never propagates errors; logs and re-arms.
    pub fn spawn_idle_watcher(
        self: &Arc<Self>,
        udid: String,
        epoch: DateTime<Utc>,
        last_activated: DateTime<Utc>,
        idle_timeout: i64,
    ) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator
                .idle_watch(udid, epoch, last_activated, idle_timeout)
                .await;
        });
    }

    async fn idle_watch(
        self: Arc<Self>,
        udid: String,
        epoch: DateTime<Utc>,
        mut last_activated: DateTime<Utc>,
        mut idle_timeout: i64,
    ) {
        loop {
            let deadline = last_activated + ChronoDuration::seconds(idle_timeout.max(0));
            let wait = (deadline - Utc::now()).to_std().unwrap_or_default() + self.timing.idle_grace;
            debug!(udid = %udid, wait_secs = wait.as_secs(), "idle watcher armed");
            tokio::time::sleep(wait).await;

            let device = match self.store.device(&udid).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(udid = %udid, err = %e, "idle watcher read failed — retrying");
                    tokio::time::sleep(self.timing.idle_grace).await;
                    continue;
                }
            };
            let Some(device) = device else { return };

            // A different epoch means another lease is in effect; this
            // watcher belongs to a finished one.
            if device.using_began_at != Some(epoch) {
                debug!(udid = %udid, "idle watcher stale — lease epoch changed");
                return;
            }
            if !device.using {
                return;
            }

            last_activated = device.last_activated_at.unwrap_or(epoch);
            idle_timeout = device.idle_timeout;
            if last_activated + ChronoDuration::seconds(idle_timeout.max(0)) <= Utc::now() {
                let Some(user) = device.user_id.clone() else { return };
                info!(udid = %udid, user = %user, "idle timeout reached — auto-releasing");
                if let Err(e) = self.release(&udid, &ReleaseActor::User(user)).await {
                    warn!(udid = %udid, err = %e, "idle auto-release failed");
                }
                return;
            }
            // Activity arrived in the meantime — loop re-arms with the
            // remaining interval.
        }
    }

    /// Re-arm idle watchers for every live lease. Called once at startup so
    /// a crash restart does not strand leases.
    pub async fn rearm_leases(self: &Arc<Self>) -> Result<usize> {
        let devices = self.store.devices_in_use().await?;
        let mut count = 0;
        for device in devices {
            let Some(epoch) = device.using_began_at else {
                continue;
            };
            let last = device.last_activated_at.unwrap_or(epoch);
            self.spawn_idle_watcher(device.udid.clone(), epoch, last, device.idle_timeout);
            count += 1;
        }
        if count > 0 {
            info!(leases = count, "re-armed idle watchers for live leases");
        }
        Ok(count)
    }
}
