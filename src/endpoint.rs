//! Async connection driver
//!
//! `WebSocket<S>` ties a [`Session`] to a tokio transport. The client
//! constructor prepares the upgrade request but performs no I/O, so the
//! caller can attach listeners (or close) before the handshake is driven
//! by the first [`WebSocket::next_event`] call. The server constructor
//! adapts an already-upgraded transport.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::Event;
use crate::handshake::{self, ClientHandshake, UpgradeRequest};
use crate::session::{ReadyState, Session};
use crate::wire::{WireDecoder, WireEncoder};
use crate::{Options, Role};

/// Transport read chunk size
const READ_CHUNK: usize = 8 * 1024;

/// Driver phase
enum Phase {
    /// Client upgrade in flight
    Handshake(HandshakeState),
    /// Frames on the wire
    Framed,
    /// Transport gone
    Done,
}

struct HandshakeState {
    handshake: ClientHandshake,
    sent: bool,
    buf: BytesMut,
}

/// A WebSocket connection over an async transport
///
/// # Example
///
/// ```ignore
/// let mut ws = WebSocket::connect("ws://localhost:9001/ws", Options::default()).await?;
/// while let Some(event) = ws.next_event().await {
///     if let Event::Message { data, .. } = event {
///         ws.send_binary(data).await?;
///     }
/// }
/// ```
pub struct WebSocket<S> {
    transport: Option<S>,
    session: Session,
    phase: Phase,
    head: Option<Bytes>,
    url: Option<String>,
    upgrade_request: Option<UpgradeRequest>,
    options: Options,
}

impl WebSocket<TcpStream> {
    /// Connect over TCP and prepare the upgrade
    ///
    /// Applies the no-delay hint from the options. `wss` URLs need an
    /// externally established TLS transport passed to
    /// [`WebSocket::client`] instead.
    pub async fn connect(url: &str, options: Options) -> Result<Self> {
        let parsed = handshake::parse_url(url)?;
        if parsed.secure {
            return Err(Error::HandshakeFailed(
                "wss requires an externally established TLS transport",
            ));
        }
        let transport = TcpStream::connect((parsed.host.as_str(), parsed.port)).await?;
        if options.no_delay {
            let _ = transport.set_nodelay(true);
        }
        Self::client(transport, url, options)
    }
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create an outbound client over an established transport
    ///
    /// Validates the URL and version and composes the upgrade request;
    /// the exchange itself runs when the connection is first driven.
    pub fn client(transport: S, url: &str, options: Options) -> Result<Self> {
        let parsed = handshake::parse_url(url)?;
        let handshake = handshake::client_handshake(&parsed, &options)?;
        debug!(url, version = options.version, "client upgrade prepared");

        Ok(Self {
            transport: Some(transport),
            session: Session::client(options.version),
            phase: Phase::Handshake(HandshakeState {
                handshake,
                sent: false,
                buf: BytesMut::new(),
            }),
            head: None,
            url: Some(url.to_string()),
            upgrade_request: None,
            options,
        })
    }

    /// Adapt an already-upgraded server-side transport
    ///
    /// The caller supplies the parsed upgrade request, any residual bytes
    /// that followed it (the upgrade head), and the negotiated
    /// sub-protocol; the HTTP negotiation happened upstream. The `open`
    /// event fires one turn later so listeners can be attached first.
    pub fn server(
        transport: S,
        request: UpgradeRequest,
        head: impl Into<Bytes>,
        sub_protocol: Option<String>,
        options: Options,
    ) -> Self {
        let head = head.into();
        Self {
            transport: Some(transport),
            session: Session::server(options.version, sub_protocol, options.max_message_size),
            phase: Phase::Framed,
            head: if head.is_empty() { None } else { Some(head) },
            url: None,
            upgrade_request: Some(request),
            options,
        }
    }

    /// Current ready state
    pub fn ready_state(&self) -> ReadyState {
        self.session.state()
    }

    /// The session state machine
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Mutable session access, e.g. for listener registration via
    /// [`Session::sink_mut`]
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Connect URL (client role)
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Upgrade request descriptor (server role)
    pub fn upgrade_request(&self) -> Option<&UpgradeRequest> {
        self.upgrade_request.as_ref()
    }

    /// Sub-protocol negotiated at handshake
    pub fn sub_protocol(&self) -> Option<&str> {
        self.session.sub_protocol()
    }

    /// Drive the connection until the next event
    ///
    /// Runs deferred work, the upgrade exchange, transport reads, and
    /// flushes of replies the session queued (pongs, close frames).
    /// Returns `None` once the session is over and every event has been
    /// delivered.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            self.session.tick();
            if self.session.take_shutdown() {
                self.teardown().await;
            }
            if let Some(event) = self.session.poll_event() {
                return Some(event);
            }

            match self.phase {
                Phase::Handshake(_) => self.drive_handshake().await,
                Phase::Framed => {
                    if let Some(head) = self.head.take() {
                        self.session.receive(&head);
                        self.flush_replies().await;
                        continue;
                    }
                    self.read_more().await;
                }
                Phase::Done => return None,
            }
        }
    }

    /// Send one data message
    pub async fn send(&mut self, data: impl Into<Bytes>, binary: bool) -> Result<()> {
        self.session.send(data, binary)?;
        self.after_op().await
    }

    /// Send a text message
    pub async fn send_text(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.send(data, false).await
    }

    /// Send a binary message
    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.send(data, true).await
    }

    /// Send a ping control frame
    pub async fn ping(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.session.ping(data)?;
        self.after_op().await
    }

    /// Send a pong control frame
    pub async fn pong(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.session.pong(data)?;
        self.after_op().await
    }

    /// Stream one message through a callback pushing fragments
    pub async fn stream<F>(&mut self, binary: bool, cb: F) -> Result<()>
    where
        F: FnOnce(&mut Session) -> Result<()> + Send + 'static,
    {
        self.session.stream(binary, cb)?;
        self.after_op().await
    }

    /// Stream one message from a byte source
    ///
    /// Each chunk goes out as a non-final fragment, yielding to the
    /// scheduler in between; end-of-source emits the zero-length terminal
    /// fragment and schedules the queue release.
    pub async fn send_stream<R>(&mut self, mut reader: R, binary: bool) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        self.session.begin_message(binary)?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await.map_err(Error::Transport)?;
            if n == 0 {
                self.session.push_fragment(Bytes::new(), true)?;
                break;
            }
            self.session
                .push_fragment(Bytes::copy_from_slice(&chunk[..n]), false)?;
            self.flush_op().await?;
            tokio::task::yield_now().await;
        }
        self.after_op().await
    }

    /// Close the session
    ///
    /// From Open this emits a close frame and severs the transport in one
    /// step; the close event carries `code` (1000 when `None`).
    pub async fn close(&mut self, code: Option<u16>, reason: &str) -> Result<()> {
        self.session.close(code, reason)?;
        self.after_op().await
    }

    /// Unconditionally sever the transport
    pub async fn terminate(&mut self) {
        self.session.terminate();
        if self.session.take_shutdown() {
            self.teardown().await;
        }
    }

    async fn after_op(&mut self) -> Result<()> {
        if self.session.take_shutdown() {
            self.teardown().await;
            return Ok(());
        }
        self.flush_op().await
    }

    /// Flush encoded output, returning the write error to the caller
    async fn flush_op(&mut self) -> Result<()> {
        if !self.session.has_output() {
            return Ok(());
        }
        let out = self.session.take_output();
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::NotOpened);
        };
        let result = async {
            transport.write_all(&out).await?;
            transport.flush().await
        }
        .await;

        if let Err(error) = result {
            // The caller gets the error directly; the transport is gone
            self.sever().await;
            self.session.terminate();
            let _ = self.session.take_shutdown();
            self.phase = Phase::Done;
            return Err(Error::Transport(error));
        }
        Ok(())
    }

    /// Flush session-generated replies, surfacing failures as events
    async fn flush_replies(&mut self) {
        if !self.session.has_output() {
            return;
        }
        let out = self.session.take_output();
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let result = async {
            transport.write_all(&out).await?;
            transport.flush().await
        }
        .await;

        if let Err(error) = result {
            warn!(%error, "transport write failed");
            self.sever().await;
            self.session.raise_error(Error::Transport(error));
            self.session.transport_closed();
            self.phase = Phase::Done;
        }
    }

    async fn drive_handshake(&mut self) {
        if self.session.state() == ReadyState::Closed {
            // Closed before upgrade completion: tear down, no error raised
            debug!("session closed before upgrade; dropping transport");
            self.sever().await;
            self.session.transport_closed();
            self.phase = Phase::Done;
            return;
        }

        match self.handshake_step().await {
            Ok(None) => {}
            Ok(Some((protocol, head))) => {
                debug!(?protocol, "client handshake complete");
                self.phase = Phase::Framed;
                self.head = if head.is_empty() { None } else { Some(head) };
                let encoder = WireEncoder::new(Role::Client);
                let decoder = WireDecoder::new(Role::Client, self.options.max_message_size);
                if !self.session.open(encoder, decoder, protocol) {
                    self.sever().await;
                    self.phase = Phase::Done;
                }
            }
            Err(error) => {
                warn!(%error, "client handshake failed");
                self.sever().await;
                self.session.raise_error(error);
                self.session.transport_closed();
                self.phase = Phase::Done;
            }
        }
    }

    /// One step of the upgrade exchange: send the request, read, try to
    /// parse. `Ok(None)` means the response is still incomplete.
    async fn handshake_step(&mut self) -> Result<Option<(Option<String>, Bytes)>> {
        let Phase::Handshake(hs) = &mut self.phase else {
            return Ok(None);
        };
        let transport = self.transport.as_mut().ok_or(Error::NotOpened)?;

        if !hs.sent {
            transport.write_all(&hs.handshake.request).await?;
            transport.flush().await?;
            hs.sent = true;
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = transport.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::HandshakeFailed("connection closed during upgrade"));
        }
        hs.buf.extend_from_slice(&chunk[..n]);

        match handshake::parse_response(&hs.buf)? {
            None => Ok(None),
            Some((response, consumed)) => {
                match response.accept.as_deref() {
                    Some(accept) if accept == hs.handshake.accept => {}
                    _ => return Err(Error::InvalidServerKey),
                }
                let head = Bytes::copy_from_slice(&hs.buf[consumed..]);
                Ok(Some((response.protocol, head)))
            }
        }
    }

    async fn read_more(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            self.session.transport_closed();
            self.phase = Phase::Done;
            return;
        };

        let mut chunk = [0u8; READ_CHUNK];
        match transport.read(&mut chunk).await {
            Ok(0) => {
                debug!("transport ended");
                self.sever().await;
                self.session.transport_closed();
                self.phase = Phase::Done;
            }
            Ok(n) => {
                self.session.receive(&chunk[..n]);
                self.flush_replies().await;
            }
            Err(error) => {
                warn!(%error, "transport read failed");
                self.sever().await;
                self.session.raise_error(Error::Transport(error));
                self.session.transport_closed();
                self.phase = Phase::Done;
            }
        }
    }

    /// Flush whatever the session queued, then sever the transport
    async fn teardown(&mut self) {
        let out = self.session.take_output();
        if let Some(transport) = self.transport.as_mut() {
            if !out.is_empty() {
                let _ = transport.write_all(&out).await;
            }
            let _ = transport.flush().await;
        }
        self.sever().await;
        self.session.transport_closed();
        self.phase = Phase::Done;
    }

    async fn sever(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.shutdown().await;
        }
    }
}

impl<S> std::fmt::Debug for WebSocket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("state", &self.session.state())
            .field("url", &self.url)
            .finish()
    }
}
