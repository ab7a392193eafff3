//! Crypto engine contract.
//!
//! The engine is the platform or hardware DRM implementation a session talks
//! to. It is never owned by this crate; sessions hold it behind an `Arc` and
//! only call it from their owning context.
use std::collections::HashMap;

use uuid::Uuid;

use crate::error::Result;
use crate::scheme::SchemeData;

/// Key-status entry holding the remaining license duration in seconds.
pub const LICENSE_DURATION_REMAINING: &str = "LicenseDurationRemaining";
/// Key-status entry holding the remaining playback duration in seconds.
pub const PLAYBACK_DURATION_REMAINING: &str = "PlaybackDurationRemaining";

/// Key status reported by the engine, keyed by engine specific names.
pub type KeyStatus = HashMap<String, String>;

/// Kind of license a key request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Keys used for a single playback and never persisted.
    Streaming,
    /// Keys persisted by the engine and referenced by a key-set id.
    Offline,
    /// Release of previously persisted offline keys.
    Release,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Streaming => "STREAMING",
            KeyType::Offline => "OFFLINE",
            KeyType::Release => "RELEASE",
        }
    }
}

/// Opaque key request built by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub data: Vec<u8>,
    /// License server URL suggested by the engine, empty when unknown.
    pub license_server_url: String,
}

/// Opaque provisioning request built by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub data: Vec<u8>,
    pub default_url: String,
}

/// Handle a decoder uses to decrypt samples for an opened session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoHandle {
    pub scheme: Uuid,
    pub session_id: Vec<u8>,
    pub requires_secure_decoder: bool,
}

/// Asynchronous notifications raised by the engine for an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// Loaded keys are no longer sufficient, e.g. after key rotation.
    KeyRequired,
    KeyExpired,
    ProvisionRequired,
}

/// Platform DRM implementation consumed by sessions.
///
/// Every call happens on the session's owning context. Implementations
/// report a missing device certificate as [`Error::NotProvisioned`] so the
/// session can route it to provisioning.
///
/// [`Error::NotProvisioned`]: crate::error::Error::NotProvisioned
pub trait CryptoEngine: Send + Sync {
    /// Open a native session and return its id.
    fn open_session(&self) -> Result<Vec<u8>>;

    /// Close a native session. Failures are the engine's to log.
    fn close_session(&self, session_id: &[u8]);

    /// Create the decoder-facing handle bound to an opened session.
    fn create_crypto_handle(&self, session_id: &[u8]) -> Result<CryptoHandle>;

    fn get_provision_request(&self) -> Result<ProvisionRequest>;

    fn provide_provision_response(&self, response: &[u8]) -> Result<()>;

    /// Build a key request.
    ///
    /// `scope` is the session id, or the offline key-set id for
    /// [`KeyType::Release`]. `scheme_data` is `None` for sessions that only
    /// use offline keys.
    fn get_key_request(
        &self,
        scope: &[u8],
        scheme_data: Option<&[SchemeData]>,
        key_type: KeyType,
        parameters: &HashMap<String, String>,
    ) -> Result<KeyRequest>;

    /// Load a key response. Returns the key-set id for offline licenses.
    fn provide_key_response(&self, scope: &[u8], response: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Restore persisted offline keys into an opened session.
    fn restore_keys(&self, session_id: &[u8], key_set_id: &[u8]) -> Result<()>;

    fn query_key_status(&self, session_id: &[u8]) -> Result<KeyStatus>;
}

/// Remaining license time in seconds, the minimum of the license and
/// playback durations reported in `status`.
///
/// Missing or unparsable entries count as no time left.
pub fn license_duration_remaining(status: &KeyStatus) -> i64 {
    let duration = |name: &str| {
        status
            .get(name)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0)
    };
    duration(LICENSE_DURATION_REMAINING).min(duration(PLAYBACK_DURATION_REMAINING))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn status(license: Option<&str>, playback: Option<&str>) -> KeyStatus {
        let mut status = KeyStatus::new();
        if let Some(v) = license {
            status.insert(LICENSE_DURATION_REMAINING.to_string(), v.to_string());
        }
        if let Some(v) = playback {
            status.insert(PLAYBACK_DURATION_REMAINING.to_string(), v.to_string());
        }
        status
    }

    #[rstest]
    #[case::license_is_shorter(Some("30"), Some("600"), 30)]
    #[case::playback_is_shorter(Some("900"), Some("120"), 120)]
    #[case::missing_playback(Some("900"), None, 0)]
    #[case::garbage(Some("soon"), Some("600"), 0)]
    #[case::negative(Some("-5"), Some("600"), -5)]
    fn remaining_duration_is_minimum(
        #[case] license: Option<&str>,
        #[case] playback: Option<&str>,
        #[case] expected: i64,
    ) {
        assert_eq!(license_duration_remaining(&status(license, playback)), expected);
    }
}
