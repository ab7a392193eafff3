//! drmsession - DRM session lifecycle management.
//!
//! This crate provides:
//! - A reference counted DRM session state machine that opens a native
//!   crypto engine session, acquires, restores, renews and releases keys.
//! - A background request dispatcher with pluggable retry policy.
//! - Lifecycle event fan-out to listeners on their own delivery contexts.
//! - Device-wide provisioning arbitration.
//! - PSSH parsing and generation.
//! - Optional remote CDM engine and HTTP license transport.
//!
//! Feature flags:
//! - `cli`: enable the CLI binary helpers.
//! - `log`: route library logging through the `log` crate (default).
//! - `remote`: enable the remote CDM engine and HTTP transport.
//! - `tracing`: route library logging through `tracing` instead.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Background execution of provisioning and key requests.
pub mod dispatcher;
/// Crypto engine contract and key status helpers.
pub mod engine;
/// Common error types and Result alias.
pub mod error;
/// Session lifecycle events and listener fan-out.
pub mod events;
/// Session inbox and the notifier handle posting into it.
pub mod inbox;
/// Delivery contexts for listener callbacks.
pub mod looper;
/// Device provisioning arbitration.
pub mod provisioning;
/// Retry policy for failed requests.
pub mod retry;
/// Scheme init data and PSSH utilities.
pub mod scheme;
/// The DRM session state machine.
pub mod session;
/// Fake collaborators for tests.
pub mod testing;
/// Request transport contract and HTTP implementation.
pub mod transport;

/// Remote CDM engine (feature: `remote`).
#[cfg(feature = "remote")]
pub mod remote;

pub use error::{Error, Result, SharedError};
pub use events::{DrmSessionEventListener, EventDispatcher};
pub use session::{Collaborators, DrmSession, SessionConfig, SessionMode, SessionState};
