//! Upgrade handshake
//!
//! Client side: composes the HTTP/1.1 Upgrade request, validates the
//! server's `Sec-WebSocket-Accept`, and hands back any residual bytes
//! (the upgrade head) for the frame decoder. Server side: an owned
//! descriptor of the already-negotiated upgrade request; the HTTP
//! negotiation itself is the caller's responsibility.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::{Options, SUPPORTED_VERSIONS, WS_GUID};

/// Maximum HTTP header size accepted while parsing the upgrade response
const MAX_HEADER_SIZE: usize = 8192;

/// A parsed `ws://` / `wss://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// Whether the scheme was `wss`
    pub secure: bool,
    /// Host name or address
    pub host: String,
    /// Port (defaulted from the scheme when absent)
    pub port: u16,
    /// Request path including query, `/` when absent
    pub path: String,
}

impl WsUrl {
    /// Host header value: `host` alone on the default port, `host:port`
    /// otherwise
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parse a WebSocket URL
pub fn parse_url(url: &str) -> Result<WsUrl> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or(Error::InvalidUrl("missing scheme"))?;

    let secure = match scheme {
        "ws" => false,
        "wss" => true,
        _ => return Err(Error::InvalidUrl("scheme must be ws or wss")),
    };

    let (host_port, path) = rest
        .find('/')
        .map(|i| (&rest[..i], &rest[i..]))
        .unwrap_or((rest, "/"));

    let (host, port) = if let Some(colon) = host_port.rfind(':') {
        let port = host_port[colon + 1..]
            .parse()
            .map_err(|_| Error::InvalidUrl("invalid port"))?;
        (&host_port[..colon], port)
    } else {
        (host_port, if secure { 443 } else { 80 })
    };

    if host.is_empty() {
        return Err(Error::InvalidUrl("missing host"));
    }

    Ok(WsUrl {
        secure,
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// Compose the session key: base64 of `<version>-<current_millis>`
///
/// Unique per session, which is all the accept computation requires.
pub fn compose_key(version: u16) -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    base64::engine::general_purpose::STANDARD.encode(format!("{}-{}", version, millis))
}

/// Compute the expected `Sec-WebSocket-Accept`: base64(sha1(key + GUID))
pub fn accept_for(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// A prepared client handshake: the request bytes to write and the accept
/// value the response must echo
#[derive(Debug)]
pub struct ClientHandshake {
    /// Serialized upgrade request
    pub request: Bytes,
    /// Session key sent in `Sec-WebSocket-Key`
    pub key: String,
    /// Expected `Sec-WebSocket-Accept` value
    pub accept: String,
}

/// Build the client upgrade request for a parsed URL
///
/// Fails with `UnsupportedVersion` when the requested version is not one
/// this endpoint speaks. Version 13 sends `Origin`; earlier drafts send
/// `Sec-WebSocket-Origin`.
pub fn client_handshake(url: &WsUrl, options: &Options) -> Result<ClientHandshake> {
    if !SUPPORTED_VERSIONS.contains(&options.version) {
        return Err(Error::UnsupportedVersion(options.version));
    }

    let key = compose_key(options.version);
    let accept = accept_for(&key);

    let mut buf = BytesMut::with_capacity(512);
    buf.put_slice(b"GET ");
    buf.put_slice(url.path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(url.host_header().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: ");
    buf.put_slice(options.version.to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(protocol) = &options.sub_protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(protocol.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if let Some(origin) = &options.origin {
        if options.version >= 13 {
            buf.put_slice(b"Origin: ");
        } else {
            buf.put_slice(b"Sec-WebSocket-Origin: ");
        }
        buf.put_slice(origin.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");

    Ok(ClientHandshake {
        request: buf.freeze(),
        key,
        accept,
    })
}

/// Parsed upgrade response headers the client cares about
#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    /// The `Sec-WebSocket-Accept` header, when present
    pub accept: Option<String>,
    /// Sub-protocol selected by the server
    pub protocol: Option<String>,
}

/// Parse the server's upgrade response
///
/// Returns `None` while the response is incomplete; on completion, the
/// parsed headers and the number of bytes consumed (everything past that
/// is the upgrade head).
pub fn parse_response(buf: &[u8]) -> Result<Option<(UpgradeResponse, usize)>> {
    if buf.len() > MAX_HEADER_SIZE {
        return Err(Error::HandshakeFailed("response too large"));
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            if res.code != Some(101) {
                return Err(Error::HandshakeFailed("expected 101 Switching Protocols"));
            }

            let mut accept = None;
            let mut protocol = None;
            for header in res.headers.iter() {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| Error::HandshakeFailed("invalid header value"))?;
                if header.name.eq_ignore_ascii_case("sec-websocket-accept") {
                    accept = Some(value.to_string());
                } else if header.name.eq_ignore_ascii_case("sec-websocket-protocol") {
                    protocol = Some(value.to_string());
                }
            }

            Ok(Some((UpgradeResponse { accept, protocol }, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::HandshakeFailed("failed to parse HTTP response")),
    }
}

/// An already-negotiated upgrade request, as supplied to the server-side
/// adapter
///
/// The session treats this as an opaque peer descriptor; any validation
/// (101 status, accept computation, header checks) happened upstream.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request method
    pub method: String,
    /// Request path
    pub path: String,
    /// Raw headers in arrival order
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Create a descriptor from parts
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
        }
    }

    /// Append a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Look up a header by case-insensitive name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_for_rfc_vector() {
        // Test vector from RFC 6455
        let accept = accept_for("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_compose_key_shape() {
        let key = compose_key(13);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        let decoded = String::from_utf8(decoded).unwrap();
        let (version, millis) = decoded.split_once('-').unwrap();
        assert_eq!(version, "13");
        assert!(millis.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_parse_url() {
        let url = parse_url("ws://example.com/chat?room=1").unwrap();
        assert!(!url.secure);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/chat?room=1");
        assert_eq!(url.host_header(), "example.com");

        let url = parse_url("wss://example.com:8443").unwrap();
        assert!(url.secure);
        assert_eq!(url.port, 8443);
        assert_eq!(url.path, "/");
        assert_eq!(url.host_header(), "example.com:8443");
    }

    #[test]
    fn test_parse_url_rejects() {
        assert!(matches!(
            parse_url("example.com/ws"),
            Err(Error::InvalidUrl("missing scheme"))
        ));
        assert!(matches!(
            parse_url("http://example.com/ws"),
            Err(Error::InvalidUrl("scheme must be ws or wss"))
        ));
        assert!(matches!(
            parse_url("ws:///ws"),
            Err(Error::InvalidUrl("missing host"))
        ));
        assert!(matches!(
            parse_url("ws://example.com:notaport/ws"),
            Err(Error::InvalidUrl("invalid port"))
        ));
    }

    #[test]
    fn test_client_request_headers() {
        let url = parse_url("ws://example.com/ws").unwrap();
        let options = Options::builder()
            .origin("https://example.com")
            .sub_protocol("chat")
            .build();
        let hs = client_handshake(&url, &options).unwrap();
        let text = std::str::from_utf8(&hs.request).unwrap();

        assert!(text.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains(&format!("Sec-WebSocket-Key: {}\r\n", hs.key)));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.contains("Origin: https://example.com\r\n"));
        assert!(!text.contains("Sec-WebSocket-Origin:"));
        assert_eq!(hs.accept, accept_for(&hs.key));
    }

    #[test]
    fn test_draft_8_origin_header() {
        let url = parse_url("ws://example.com/ws").unwrap();
        let options = Options::builder()
            .version(8)
            .origin("https://example.com")
            .build();
        let hs = client_handshake(&url, &options).unwrap();
        let text = std::str::from_utf8(&hs.request).unwrap();

        assert!(text.contains("Sec-WebSocket-Version: 8\r\n"));
        assert!(text.contains("Sec-WebSocket-Origin: https://example.com\r\n"));
    }

    #[test]
    fn test_unsupported_version() {
        let url = parse_url("ws://example.com/ws").unwrap();
        let options = Options::builder().version(76).build();
        assert!(matches!(
            client_handshake(&url, &options),
            Err(Error::UnsupportedVersion(76))
        ));
    }

    #[test]
    fn test_parse_response() {
        let response = b"HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
            Sec-WebSocket-Protocol: chat\r\n\
            \r\nleftover";

        let (parsed, consumed) = parse_response(response).unwrap().unwrap();
        assert_eq!(parsed.accept.as_deref(), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(parsed.protocol.as_deref(), Some("chat"));
        assert_eq!(&response[consumed..], b"leftover");
    }

    #[test]
    fn test_parse_response_partial() {
        assert!(parse_response(b"HTTP/1.1 101 Swit").unwrap().is_none());
    }

    #[test]
    fn test_parse_response_wrong_status() {
        let response = b"HTTP/1.1 400 Bad Request\r\n\r\n";
        assert!(matches!(
            parse_response(response),
            Err(Error::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_upgrade_request_lookup() {
        let request = UpgradeRequest::new("GET", "/ws")
            .header("Sec-WebSocket-Key", "abc")
            .header("Sec-WebSocket-Version", "13");
        assert_eq!(request.get("sec-websocket-key"), Some("abc"));
        assert_eq!(request.get("missing"), None);
    }
}
