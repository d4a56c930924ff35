//! Domain error types surfaced to API callers.
//!
//! Business errors map to structured `{success:false, description}` JSON
//! responses; transient store failures bubble up as 500 without leaking
//! internals.

use thiserror::Error;

/// Reasons an acquire request is rejected. All map to HTTP 403.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Unknown udid or a device with no live sources.
    #[error("device absent")]
    Absent,

    /// Leased by someone else.
    #[error("device busy")]
    Busy,

    /// Still cooling down from the previous lease.
    #[error("device is colding")]
    Colding,

    /// Lost the compare-and-set race against a concurrent acquire.
    #[error("not fast enough, device has been taken by others")]
    RaceLost,

    /// The caller's visibility predicate excludes this device.
    #[error("device not visible to you")]
    NotVisible,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Reasons a release request is rejected. All map to HTTP 403; a release of
/// a device that is not in use is reported as idempotent success instead.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("device not exist")]
    NotFound,

    #[error("device is not owned by you")]
    NotOwner,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
