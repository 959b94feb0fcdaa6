// Transport adapter boundary.
//
// The session core never opens sockets. The embedder supplies a `Transport`
// and feeds its events into `Connection::{on_reset, on_message,
// on_disconnect}`. Automatic retry with backoff is the transport's job.

use std::net::IpAddr;

use url::Url;

use crate::error::ConnectionError;

/// Coarse transport state, as reported by `Connection::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// Attempting to establish the stream.
    Connecting,
    /// Stream is up.
    Connected,
    /// Gave up permanently (e.g. version negotiation failure).
    Failed,
    /// Between retries.
    Waiting,
    /// Intentionally disconnected.
    Offline,
}

/// Options for a caller- or session-initiated reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectOptions {
    /// Drop the current stream even if it looks healthy.
    pub force: bool,
}

/// Options for a caller- or session-initiated disconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectOptions {
    /// Do not retry; the connection is finished for good.
    pub permanent: bool,
}

/// Abstraction over the reconnecting byte-stream.
///
/// `send` may be called while the stream is down; implementations buffer or
/// drop such messages. The session core resends what matters after a reset.
pub trait Transport {
    fn send(&mut self, text: String);

    fn reconnect(&mut self, options: ReconnectOptions);

    fn disconnect(&mut self, options: DisconnectOptions);

    fn status(&self) -> TransportStatus;
}

/// Endpoint URLs must use wss; plain ws is allowed only for loopback hosts.
pub fn validate_endpoint_url(value: &str) -> Result<(), ConnectionError> {
    let parsed = Url::parse(value)
        .map_err(|source| ConnectionError::InvalidEndpoint { url: value.to_string(), source })?;
    match parsed.scheme() {
        "wss" => Ok(()),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(()),
        _ => Err(ConnectionError::InsecureEndpoint),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_wss_urls() {
        assert!(validate_endpoint_url("wss://app.example.com/ws").is_ok());
    }

    #[test]
    fn accepts_ws_only_for_loopback() {
        assert!(validate_endpoint_url("ws://localhost:3000/ws").is_ok());
        assert!(validate_endpoint_url("ws://127.0.0.1:3000/ws").is_ok());
        assert!(validate_endpoint_url("ws://app.example.com/ws").is_err());
    }

    #[test]
    fn rejects_non_websocket_schemes() {
        assert!(validate_endpoint_url("https://app.example.com").is_err());
    }

    #[test]
    fn rejects_garbage_urls() {
        let error = validate_endpoint_url("not a url").expect_err("should not parse");
        assert!(matches!(error, ConnectionError::InvalidEndpoint { .. }));
    }
}
