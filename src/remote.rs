//! Crypto engine backed by a pywidevine serve compatible remote CDM.
//!
//! The remote API covers streaming and offline license challenges. It has no
//! provisioning, offline key restore or license release endpoints; those
//! calls fail with [`Error::Unsupported`].
use std::collections::HashMap;

use base64::Engine;
use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::{CryptoEngine, CryptoHandle, KeyRequest, KeyStatus, KeyType, ProvisionRequest};
use crate::error::{Error, Result};
use crate::scheme::{SchemeData, WIDEVINE_UUID};

const SERVER_MARKER: &str = "pywidevine serve v";
const MINIMUM_SERVER_VERSION: &str = "1.4.3";

/// A content key returned by the remote CDM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKey {
    pub kid: Uuid,
    pub key: Vec<u8>,
    pub key_type: String,
    pub permissions: Vec<String>,
}

/// Remote CDM client exposed as a [`CryptoEngine`].
#[derive(Debug)]
pub struct RemoteEngine {
    host: String,
    secret: String,
    device_name: String,
    expected_device: Option<(u32, u8)>,
    privacy_mode: bool,
    client: Client,
}

impl RemoteEngine {
    /// Connect to a remote CDM and verify the server version.
    ///
    /// The server must advertise a `pywidevine serve vX.Y.Z` header with a
    /// version of at least 1.4.3.
    pub fn connect(
        host: impl Into<String>,
        secret: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Result<Self> {
        let host = host.into().trim_end_matches('/').to_string();
        let secret = secret.into();

        let client = Client::builder()
            .user_agent(concat!("drmsession/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))?;

        let response = client
            .head(&host)
            .header("X-Secret-Key", &secret)
            .send()
            .map_err(|e| Error::Other(format!("Failed to contact server: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Engine(format!(
                "Server did not respond successfully: {}",
                response.status()
            )));
        }

        if let Some(server) = response
            .headers()
            .get("Server")
            .and_then(|h| h.to_str().ok())
        {
            check_server_header(server)?;
        }

        Ok(Self {
            host,
            secret,
            device_name: device_name.into(),
            expected_device: None,
            privacy_mode: false,
            client,
        })
    }

    /// Reject sessions opened on a device with a different system id or security level.
    pub fn expect_device(mut self, system_id: u32, security_level: u8) -> Self {
        self.expected_device = Some((system_id, security_level));
        self
    }

    pub fn with_privacy_mode(mut self, privacy_mode: bool) -> Self {
        self.privacy_mode = privacy_mode;
        self
    }

    /// Content keys loaded into a remote session.
    pub fn keys(&self, session_id: &[u8], key_type: Option<&str>) -> Result<Vec<RemoteKey>> {
        let key_type = key_type.unwrap_or("ALL");
        let data: KeysResponse = self.call(
            self.client
                .post(self.url(&format!("get_keys/{}", key_type)))
                .json(&serde_json::json!({ "session_id": hex::encode(session_id) })),
            "get keys",
        )?;

        data.keys
            .into_iter()
            .map(|k| {
                let kid = hex::decode(&k.key_id)
                    .ok()
                    .and_then(|b| Uuid::from_slice(&b).ok())
                    .unwrap_or_else(Uuid::nil);
                let key = hex::decode(&k.key)
                    .map_err(|e| Error::DecodeError(format!("Invalid key hex: {}", e)))?;
                Ok(RemoteKey {
                    kid,
                    key,
                    key_type: k.r#type,
                    permissions: k.permissions,
                })
            })
            .collect()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.host, self.device_name, path)
    }

    /// Send `request` and check the API status, returning the optional payload.
    fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<Option<T>> {
        let response: ApiResponse<T> = request
            .header("X-Secret-Key", &self.secret)
            .send()
            .map_err(|e| Error::Other(format!("Failed to {}: {}", what, e)))?
            .json()
            .map_err(|e| Error::DecodeError(format!("Invalid {} response: {}", what, e)))?;

        if response.status != 200 {
            return Err(Error::Engine(format!(
                "Cannot {}: {}",
                what, response.message
            )));
        }
        Ok(response.data)
    }

    fn call<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        self.send(request, what)?
            .ok_or_else(|| Error::DecodeError(format!("Missing {} response data", what)))
    }
}

impl CryptoEngine for RemoteEngine {
    fn open_session(&self) -> Result<Vec<u8>> {
        let data: OpenResponse = self.call(self.client.get(self.url("open")), "open session")?;

        if let Some((system_id, security_level)) = self.expected_device {
            if data.device.system_id != system_id || data.device.security_level != security_level {
                return Err(Error::Engine(format!(
                    "Device mismatch: remote reports system id {} at L{}",
                    data.device.system_id, data.device.security_level
                )));
            }
        }

        hex::decode(&data.session_id)
            .map_err(|e| Error::DecodeError(format!("Invalid session id: {}", e)))
    }

    fn close_session(&self, session_id: &[u8]) {
        let closed = self.send::<serde_json::Value>(
            self.client
                .get(self.url(&format!("close/{}", hex::encode(session_id)))),
            "close session",
        );
        if let Err(e) = closed {
            warn!("Failed to close remote session: {}", e);
        }
    }

    fn create_crypto_handle(&self, session_id: &[u8]) -> Result<CryptoHandle> {
        Ok(CryptoHandle {
            scheme: WIDEVINE_UUID,
            session_id: session_id.to_vec(),
            requires_secure_decoder: false,
        })
    }

    fn get_provision_request(&self) -> Result<ProvisionRequest> {
        Err(Error::Unsupported(
            "Remote CDM devices are provisioned server side".to_string(),
        ))
    }

    fn provide_provision_response(&self, _response: &[u8]) -> Result<()> {
        Err(Error::Unsupported(
            "Remote CDM devices are provisioned server side".to_string(),
        ))
    }

    fn get_key_request(
        &self,
        scope: &[u8],
        scheme_data: Option<&[SchemeData]>,
        key_type: KeyType,
        _parameters: &HashMap<String, String>,
    ) -> Result<KeyRequest> {
        if key_type == KeyType::Release {
            return Err(Error::Unsupported(
                "Remote CDM cannot release offline licenses".to_string(),
            ));
        }

        let data = scheme_data
            .unwrap_or_default()
            .iter()
            .find(|d| d.matches(WIDEVINE_UUID) && d.has_data())
            .ok_or_else(|| Error::InvalidInitData("No Widevine scheme data".to_string()))?;
        let pssh = data.pssh()?;

        let response: ChallengeResponse = self.call(
            self.client
                .post(self.url(&format!("get_license_challenge/{}", key_type.as_str())))
                .json(&serde_json::json!({
                    "session_id": hex::encode(scope),
                    "init_data": pssh.to_base64(),
                    "privacy_mode": self.privacy_mode,
                })),
            "get license challenge",
        )?;

        Ok(KeyRequest {
            data: base64::engine::general_purpose::STANDARD.decode(response.challenge_b64)?,
            license_server_url: data.license_server_url.clone().unwrap_or_default(),
        })
    }

    fn provide_key_response(&self, scope: &[u8], response: &[u8]) -> Result<Option<Vec<u8>>> {
        self.send::<serde_json::Value>(
            self.client.post(self.url("parse_license")).json(&serde_json::json!({
                "session_id": hex::encode(scope),
                "license_message": base64::engine::general_purpose::STANDARD.encode(response),
            })),
            "parse license",
        )?;
        // Remote licenses are never persisted, so there is no key-set id.
        Ok(None)
    }

    fn restore_keys(&self, _session_id: &[u8], _key_set_id: &[u8]) -> Result<()> {
        Err(Error::Unsupported(
            "Remote CDM cannot restore offline keys".to_string(),
        ))
    }

    /// Maps every loaded key id (hex) to its key type.
    fn query_key_status(&self, session_id: &[u8]) -> Result<KeyStatus> {
        Ok(self
            .keys(session_id, None)?
            .into_iter()
            .map(|k| (k.kid.simple().to_string(), k.key_type))
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: i32,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct OpenResponse {
    session_id: String,
    device: DeviceInfo,
}

#[derive(Debug, Deserialize)]
struct DeviceInfo {
    system_id: u32,
    security_level: u8,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    challenge_b64: String,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    keys: Vec<KeyResponse>,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    key_id: String,
    key: String,
    r#type: String,
    permissions: Vec<String>,
}

fn check_server_header(server: &str) -> Result<()> {
    let server_lower = server.to_lowercase();
    if !server_lower.contains(SERVER_MARKER) {
        return Err(Error::Unsupported(format!(
            "Remote API does not appear to be pywidevine serve ({})",
            server
        )));
    }
    if let Some(version) = extract_version(&server_lower, SERVER_MARKER) {
        if !version_at_least(&version, MINIMUM_SERVER_VERSION) {
            return Err(Error::Unsupported(format!(
                "Remote API version {} is not supported",
                version
            )));
        }
    }
    Ok(())
}

fn extract_version(server: &str, marker: &str) -> Option<String> {
    server
        .find(marker)
        .map(|idx| server[idx + marker.len()..].trim().to_string())
}

fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |v: &str| {
        v.split('.')
            .filter_map(|s| s.parse::<u32>().ok())
            .collect::<Vec<_>>()
    };
    let v = parse(version);
    let m = parse(minimum);
    for i in 0..m.len().max(v.len()) {
        let a = v.get(i).copied().unwrap_or(0);
        let b = m.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("1.4.3", true)]
    #[case("1.5", true)]
    #[case("2.0.0", true)]
    #[case("1.4.2", false)]
    #[case("0.9.9", false)]
    fn version_check(#[case] version: &str, #[case] ok: bool) {
        assert_eq!(version_at_least(version, MINIMUM_SERVER_VERSION), ok);
    }

    #[test]
    fn server_header_must_name_pywidevine() {
        assert!(check_server_header("pywidevine serve v1.8.0").is_ok());
        assert!(matches!(
            check_server_header("nginx/1.25"),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            check_server_header("pywidevine serve v1.4.0"),
            Err(Error::Unsupported(_))
        ));
    }
}
