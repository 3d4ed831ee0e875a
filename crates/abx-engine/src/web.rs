//! HTTP capability provider.
//!
//! One operation: a synchronous GET with custom headers, returning a
//! [`ServerResponse`] whose transport outcome is one of the enumerated
//! [`NetworkStatus`] codes. The provider never fails; every error condition
//! is folded into the response so workers can hand it to the script callback
//! as data.

use std::time::Duration;

/// Transport-level outcome of a request, separate from the HTTP status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Ok,
    Failure,
    OutOfMemory,
    MalformedUri,
    ConnectionRefused,
    NetTimeout,
    NoContent,
    UnknownProtocol,
    NetReset,
    UnknownHost,
    RedirectLoop,
    UnknownProxyHost,
    NetInterrupt,
    NotInitialized,
}

impl NetworkStatus {
    /// Numeric code handed to scripts. The values are fixed by the existing
    /// script payloads, which compare against them.
    pub fn code(self) -> u32 {
        match self {
            NetworkStatus::Ok => 0,
            NetworkStatus::Failure => 0x8000_4005,
            NetworkStatus::OutOfMemory => 0x8007_000e,
            NetworkStatus::MalformedUri => 0x804b_000a,
            NetworkStatus::ConnectionRefused => 0x804b_000d,
            NetworkStatus::NetTimeout => 0x804b_000e,
            NetworkStatus::NoContent => 0x804b_0011,
            NetworkStatus::UnknownProtocol => 0x804b_0012,
            NetworkStatus::NetReset => 0x804b_0014,
            NetworkStatus::UnknownHost => 0x804b_001e,
            NetworkStatus::RedirectLoop => 0x804b_001f,
            NetworkStatus::UnknownProxyHost => 0x804b_002a,
            NetworkStatus::NetInterrupt => 0x804b_0047,
            NetworkStatus::NotInitialized => 0xc1f3_0001,
        }
    }
}

/// Everything a script callback gets to see about a finished request.
#[derive(Debug, Clone)]
pub struct ServerResponse {
    pub status: NetworkStatus,
    /// HTTP status code, or 0 when the transport failed first.
    pub response_status: u16,
    pub response_text: String,
    /// Header pairs in arrival order, names lower-cased, duplicates kept.
    pub response_headers: Vec<(String, String)>,
}

impl ServerResponse {
    fn failed(status: NetworkStatus) -> Self {
        Self {
            status,
            response_status: 0,
            response_text: String::new(),
            response_headers: Vec::new(),
        }
    }
}

/// Synchronous HTTP GET used by the HTTP worker.
pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str, headers: &[(String, String)]) -> ServerResponse;
}

/// `reqwest::blocking` provider. Follows redirects; a client that failed to
/// construct stays `None` and reports `NotInitialized` on every call.
pub struct DefaultHttpClient {
    client: Option<reqwest::blocking::Client>,
}

impl DefaultHttpClient {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .ok();
        Self { client }
    }
}

impl Default for DefaultHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn status_for(err: &reqwest::Error) -> NetworkStatus {
    if err.is_timeout() {
        NetworkStatus::NetTimeout
    } else if err.is_redirect() {
        NetworkStatus::RedirectLoop
    } else if err.is_builder() || err.is_request() {
        NetworkStatus::MalformedUri
    } else if err.is_connect() {
        NetworkStatus::ConnectionRefused
    } else if err.is_body() || err.is_decode() {
        NetworkStatus::NetReset
    } else {
        NetworkStatus::Failure
    }
}

impl HttpClient for DefaultHttpClient {
    fn get(&self, url: &str, headers: &[(String, String)]) -> ServerResponse {
        let client = match &self.client {
            Some(client) => client,
            None => return ServerResponse::failed(NetworkStatus::NotInitialized),
        };
        let mut request = client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = match request.send() {
            Ok(response) => response,
            Err(err) => return ServerResponse::failed(status_for(&err)),
        };
        let response_status = response.status().as_u16();
        let response_headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        match response.text() {
            Ok(response_text) => ServerResponse {
                status: NetworkStatus::Ok,
                response_status,
                response_text,
                response_headers,
            },
            Err(_) => ServerResponse {
                status: NetworkStatus::NetReset,
                response_status,
                response_text: String::new(),
                response_headers,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(NetworkStatus::Ok.code(), 0);
        assert_eq!(NetworkStatus::Failure.code(), 0x8000_4005);
        assert_eq!(NetworkStatus::NetTimeout.code(), 0x804b_000e);
        assert_eq!(NetworkStatus::ConnectionRefused.code(), 0x804b_000d);
        assert_eq!(NetworkStatus::NotInitialized.code(), 0xc1f3_0001);
    }

    #[test]
    fn malformed_url_becomes_a_status_not_a_panic() {
        let client = DefaultHttpClient::new();
        let response = client.get("not a url", &[]);
        assert_ne!(response.status, NetworkStatus::Ok);
        assert_eq!(response.response_status, 0);
        assert!(response.response_text.is_empty());
    }
}
