//! # hybi-ws: WebSocket session core
//!
//! A HyBi-13 (RFC 6455) WebSocket endpoint with dual roles:
//!
//! - an outbound client that performs the HTTP/1.1 Upgrade handshake, and
//! - a server-side adapter that accepts an already-upgraded transport and
//!   drives the framed session.
//!
//! The crate covers the connection lifecycle state machine, the handshake
//! negotiation, the framed send path (including queued streaming of large
//! payloads), receive dispatch, and the ping/pong/close control protocol.
//! Frame serialization and parsing sit behind the [`codec::FrameSink`] and
//! [`codec::FrameSource`] seams; [`wire`] provides the default pair.
//!
//! ## Example
//!
//! ```ignore
//! use hybi_ws::{Event, Options, WebSocket};
//!
//! let mut ws = WebSocket::connect("ws://example.com/ws", Options::default()).await?;
//! while let Some(event) = ws.next_event().await {
//!     match event {
//!         Event::Open => ws.send_text("hello").await?,
//!         Event::Message { data, flags } => println!("{} bytes (binary={})", data.len(), flags.binary),
//!         Event::Close { code, reason } => break,
//!         _ => {}
//!     }
//! }
//! ```

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod handshake;
pub mod session;
pub mod wire;

pub use codec::{FrameSink, FrameSource, WireEvent};
pub use endpoint::WebSocket;
pub use error::{CloseReason, Error, Result};
pub use events::{Event, EventSink, MessageEvent, MessageFlags};
pub use handshake::UpgradeRequest;
pub use session::{ReadyState, Session};
pub use wire::{WireDecoder, WireEncoder};

/// WebSocket GUID for the handshake accept computation (RFC 6455 §1.3)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol versions this endpoint negotiates
pub const SUPPORTED_VERSIONS: [u16; 2] = [8, 13];

/// Default protocol version (HyBi-13)
pub const DEFAULT_VERSION: u16 = 13;

/// Maximum control frame payload (RFC 6455 §5.5)
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Endpoint role
///
/// Clients mask every outbound frame; servers never do. The rule is fixed
/// per session at construction and has no per-frame override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (masks outbound frames)
    Client,
    /// Server (sends unmasked frames)
    Server,
}

impl Role {
    /// Whether outbound frames from this role carry a mask
    #[inline]
    pub fn masks_output(&self) -> bool {
        matches!(self, Role::Client)
    }
}

/// Configuration for a WebSocket session
///
/// # Example
///
/// ```
/// use hybi_ws::Options;
///
/// let options = Options::builder()
///     .origin("https://example.com")
///     .sub_protocol("chat")
///     .max_message_size(16 * 1024 * 1024)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Origin header sent during the client handshake (`Origin` for
    /// version 13, `Sec-WebSocket-Origin` below)
    pub origin: Option<String>,
    /// Protocol version to negotiate, one of [`SUPPORTED_VERSIONS`]
    pub version: u16,
    /// Sub-protocol to request via `Sec-WebSocket-Protocol`
    pub sub_protocol: Option<String>,
    /// Maximum reassembled message size (default: 64MB)
    pub max_message_size: usize,
    /// Apply the no-delay hint to owned TCP transports (default: true)
    pub no_delay: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            origin: None,
            version: DEFAULT_VERSION,
            sub_protocol: None,
            max_message_size: 64 * 1024 * 1024,
            no_delay: true,
        }
    }
}

impl Options {
    /// Create a new options builder
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::new()
    }
}

/// Builder for session options
#[derive(Debug, Clone)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            options: Options::default(),
        }
    }

    /// Set the handshake origin
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.options.origin = Some(origin.into());
        self
    }

    /// Set the protocol version (8 or 13)
    pub fn version(mut self, version: u16) -> Self {
        self.options.version = version;
        self
    }

    /// Request a sub-protocol
    pub fn sub_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.options.sub_protocol = Some(protocol.into());
        self
    }

    /// Set the maximum reassembled message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.options.max_message_size = size;
        self
    }

    /// Enable or disable the TCP no-delay hint
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.options.no_delay = enabled;
        self
    }

    /// Build the options
    pub fn build(self) -> Options {
        self.options
    }
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::endpoint::WebSocket;
    pub use crate::error::{Error, Result};
    pub use crate::events::{Event, MessageFlags};
    pub use crate::session::{ReadyState, Session};
    pub use crate::{Options, Role};
}
