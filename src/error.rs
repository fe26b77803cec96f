//! Error kinds for the mesh manager core.
//!
//! Public manager methods return [`ManagerError`] so callers can match on
//! kind (§7 of the spec: transport, decode, invariant, store, firmware,
//! not-connected, invalid-configuration). Internal helpers that don't need
//! to expose a typed error to their caller keep using `anyhow::Result`, the
//! same split the template crate draws between its `storage`/`meshtastic`
//! modules (typed-ish via `anyhow!`) and its public server API.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode inbound frame: {0}")]
    Decode(String),

    #[error("invariant violation in inbound data: {0}")]
    InvariantViolation(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("firmware does not support this operation (requires >= 2.7.0)")]
    FirmwareNotSupported,

    #[error("not connected to radio")]
    NotConnected,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
