//! Request transport for provisioning and key requests.
//!
//! The transport executes opaque request payloads against a license or
//! provisioning server. It runs on the session's request worker, never on
//! the owning context.
use thiserror::Error;
use uuid::Uuid;

use crate::engine::{KeyRequest, ProvisionRequest};

/// Failure raised by a [`RequestTransport`].
///
/// Carries the hints a retry policy needs to classify the failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    /// HTTP status of the final response, if one was received.
    pub status: Option<u16>,
    /// Bytes of the response body read before failing.
    pub bytes_loaded: u64,
    /// Final URI after following redirects.
    pub uri_after_redirects: Option<String>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            bytes_loaded: 0,
            uri_after_redirects: None,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(status: u16, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            message: format!("HTTP {} for URL: {}", status, uri),
            status: Some(status),
            bytes_loaded: 0,
            uri_after_redirects: Some(uri),
        }
    }

    pub fn with_bytes_loaded(mut self, bytes_loaded: u64) -> Self {
        self.bytes_loaded = bytes_loaded;
        self
    }

    /// Checks if this error is worth another attempt.
    ///
    /// Connection level failures (no status) are retryable, as are 5xx,
    /// 408 and 429 responses.
    pub fn is_retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => status >= 500 || status == 429 || status == 408,
        }
    }
}

/// Executes provisioning and key requests for a DRM scheme.
pub trait RequestTransport: Send + Sync {
    fn execute_provision_request(
        &self,
        scheme: Uuid,
        request: &ProvisionRequest,
    ) -> Result<Vec<u8>, TransportError>;

    fn execute_key_request(
        &self,
        scheme: Uuid,
        request: &KeyRequest,
    ) -> Result<Vec<u8>, TransportError>;
}

#[cfg(feature = "remote")]
pub use self::http::HttpTransport;

#[cfg(feature = "remote")]
mod http {
    use std::collections::HashMap;

    use reqwest::blocking::Client;
    use uuid::Uuid;

    use super::{RequestTransport, TransportError};
    use crate::engine::{KeyRequest, ProvisionRequest};
    use crate::error::{Error, Result};
    use crate::scheme::SystemId;

    /// Blocking HTTP transport posting requests to license servers.
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        client: Client,
        default_license_url: Option<String>,
        force_default_license_url: bool,
        headers: HashMap<String, String>,
    }

    impl HttpTransport {
        /// Create a transport falling back to `default_license_url` when the
        /// key request carries no URL.
        pub fn new(default_license_url: Option<String>) -> Result<Self> {
            let client = Client::builder()
                .user_agent("drmsession")
                .build()
                .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))?;
            Ok(Self {
                client,
                default_license_url,
                force_default_license_url: false,
                headers: HashMap::new(),
            })
        }

        /// Always use the default license URL, ignoring the request's.
        pub fn force_default_license_url(mut self, force: bool) -> Self {
            self.force_default_license_url = force;
            self
        }

        /// Add a header sent with every key request.
        pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.headers.insert(name.into(), value.into());
            self
        }

        fn license_url<'a>(&'a self, request: &'a KeyRequest) -> Option<&'a str> {
            if self.force_default_license_url || request.license_server_url.is_empty() {
                self.default_license_url.as_deref()
            } else {
                Some(request.license_server_url.as_str())
            }
        }

        fn post(
            &self,
            url: &str,
            body: Vec<u8>,
            headers: &[(String, String)],
        ) -> std::result::Result<Vec<u8>, TransportError> {
            let mut builder = self.client.post(url).body(body);
            for (name, value) in headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder
                .send()
                .map_err(|e| TransportError::new(format!("Failed to send request: {}", e)))?;

            let final_url = response.url().to_string();
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::http_status(status.as_u16(), final_url));
            }

            let bytes = response.bytes().map_err(|e| TransportError {
                uri_after_redirects: Some(final_url),
                ..TransportError::new(format!("Failed to read response: {}", e))
            })?;
            Ok(bytes.to_vec())
        }
    }

    impl RequestTransport for HttpTransport {
        fn execute_provision_request(
            &self,
            _scheme: Uuid,
            request: &ProvisionRequest,
        ) -> std::result::Result<Vec<u8>, TransportError> {
            let url = format!(
                "{}&signedRequest={}",
                request.default_url,
                String::from_utf8_lossy(&request.data)
            );
            debug!("Executing provisioning request against {}", request.default_url);
            self.post(&url, Vec::new(), &[])
        }

        fn execute_key_request(
            &self,
            scheme: Uuid,
            request: &KeyRequest,
        ) -> std::result::Result<Vec<u8>, TransportError> {
            let url = self
                .license_url(request)
                .ok_or_else(|| TransportError::new("No license server URL for key request"))?;

            let mut headers = Vec::with_capacity(self.headers.len() + 2);
            match SystemId::from_uuid(scheme) {
                Some(SystemId::PlayReady) => {
                    headers.push(("Content-Type".to_string(), "text/xml".to_string()));
                    headers.push((
                        "SOAPAction".to_string(),
                        "http://schemas.microsoft.com/DRM/2007/03/protocols/AcquireLicense"
                            .to_string(),
                    ));
                }
                Some(SystemId::ClearKey) => {
                    headers.push(("Content-Type".to_string(), "application/json".to_string()));
                }
                _ => {
                    headers.push((
                        "Content-Type".to_string(),
                        "application/octet-stream".to_string(),
                    ));
                }
            }
            headers.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

            debug!("Executing key request against {}", url);
            self.post(url, request.data.clone(), &headers)
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::TransportError;

    #[rstest]
    #[case::connection_reset(None, true)]
    #[case::server_error(Some(503), true)]
    #[case::too_many_requests(Some(429), true)]
    #[case::request_timeout(Some(408), true)]
    #[case::forbidden(Some(403), false)]
    #[case::not_found(Some(404), false)]
    fn classifies_retryable_errors(#[case] status: Option<u16>, #[case] retryable: bool) {
        let error = match status {
            Some(status) => TransportError::http_status(status, "https://license.example/"),
            None => TransportError::new("connection reset"),
        };
        assert_eq!(error.is_retryable(), retryable);
    }

    #[test]
    fn http_status_keeps_uri() {
        let error = TransportError::http_status(500, "https://license.example/").with_bytes_loaded(12);
        assert_eq!(error.uri_after_redirects.as_deref(), Some("https://license.example/"));
        assert_eq!(error.bytes_loaded, 12);
        assert!(error.to_string().contains("500"));
    }
}
