//! Session state machine
//!
//! One `Session` per connection. It owns the ready-state machine, the
//! outbound queue gate that serializes multi-frame messages, the bindings
//! from decoder events to application events, and the close protocol.
//!
//! The session performs no I/O: outbound frames accumulate in an internal
//! buffer ([`Session::take_output`]) and inbound bytes arrive through
//! [`Session::receive`]. [`crate::endpoint::WebSocket`] ties a session to
//! a tokio transport; tests drive one directly.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::codec::{FrameSink, FrameSource, WireEvent};
use crate::error::{CloseReason, Error, Result};
use crate::events::{Event, EventSink, MessageFlags};
use crate::wire::{WireDecoder, WireEncoder};
use crate::Role;

/// Connection lifecycle state
///
/// Transitions are monotonic along Connecting → Open → Closing → Closed;
/// early termination may skip forward (Connecting → Closed). Closed is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    /// Handshake not yet complete
    Connecting = 0,
    /// Ready for traffic
    Open = 1,
    /// Close initiated, transport not yet severed
    Closing = 2,
    /// Terminal
    Closed = 3,
}

impl ReadyState {
    /// Browser-compatible numeric constant (0..=3)
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether moving to `next` goes forward along the lifecycle
    #[inline]
    fn can_advance(self, next: ReadyState) -> bool {
        (next as u8) > (self as u8)
    }
}

/// Deferred send-shaped operation, replayed in insertion order when the
/// queue gate releases
enum Action<E, D> {
    Send { payload: Bytes, binary: bool },
    Ping(Bytes),
    Pong(Bytes),
    Stream { binary: bool, cb: StreamFn<E, D> },
}

/// Callback driving a deferred streaming send
pub type StreamFn<E, D> = Box<dyn FnOnce(&mut Session<E, D>) -> Result<()> + Send>;

/// The queue gate: while a multi-frame message is in flight, every other
/// send-shaped operation defers
enum SendMode<E, D> {
    Idle,
    Streaming {
        binary: bool,
        done: bool,
        deferred: VecDeque<Action<E, D>>,
    },
}

/// Work posted to the next turn of the event loop
enum Task {
    /// Server-role open, deferred so the caller can attach listeners first
    Open,
    /// Replay of the deferred queue after a streaming send completes
    ReleaseQueue,
}

/// WebSocket session state machine
///
/// Generic over the frame encoder and decoder so tests can substitute
/// recording or scripted collaborators; defaults to the wire codec.
pub struct Session<E = WireEncoder, D = WireDecoder> {
    role: Role,
    state: ReadyState,
    version: u16,
    sub_protocol: Option<String>,
    encoder: Option<E>,
    decoder: Option<D>,
    out: BytesMut,
    mode: SendMode<E, D>,
    tasks: VecDeque<Task>,
    close_code: Option<u16>,
    close_reason: Option<String>,
    close_fired: bool,
    shutdown: bool,
    sink: EventSink,
}

impl<E: FrameSink, D: FrameSource> Session<E, D> {
    /// Create a session in Connecting with no collaborators attached yet
    ///
    /// The client handshake driver calls [`Session::open`] on success.
    pub fn connecting(role: Role, version: u16) -> Self {
        Self {
            role,
            state: ReadyState::Connecting,
            version,
            sub_protocol: None,
            encoder: None,
            decoder: None,
            out: BytesMut::new(),
            mode: SendMode::Idle,
            tasks: VecDeque::new(),
            close_code: None,
            close_reason: None,
            close_fired: false,
            shutdown: false,
            sink: EventSink::new(),
        }
    }

    /// Create a server-role session over an already-upgraded transport
    ///
    /// The transition to Open is posted to the next event-loop turn so the
    /// caller can attach listeners before `open` fires.
    pub fn server_adapter(
        encoder: E,
        decoder: D,
        version: u16,
        sub_protocol: Option<String>,
    ) -> Self {
        let mut session = Self::connecting(Role::Server, version);
        session.encoder = Some(encoder);
        session.decoder = Some(decoder);
        session.sub_protocol = sub_protocol;
        session.tasks.push_back(Task::Open);
        session
    }

    /// Endpoint role
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current ready state
    #[inline]
    pub fn state(&self) -> ReadyState {
        self.state
    }

    /// Negotiated protocol version
    #[inline]
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Sub-protocol negotiated at handshake, if any
    pub fn sub_protocol(&self) -> Option<&str> {
        self.sub_protocol.as_deref()
    }

    /// Listener registration surface
    pub fn sink_mut(&mut self) -> &mut EventSink {
        &mut self.sink
    }

    /// Pop the next pending event
    pub fn poll_event(&mut self) -> Option<Event> {
        self.sink.poll_event()
    }

    /// Drain encoded frames awaiting a transport write
    pub fn take_output(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    /// Whether encoded output is waiting to be flushed
    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// Consume the pending request to sever the transport
    pub fn take_shutdown(&mut self) -> bool {
        std::mem::take(&mut self.shutdown)
    }

    fn transition(&mut self, next: ReadyState) {
        debug_assert!(self.state.can_advance(next), "{:?} -> {:?}", self.state, next);
        debug!(from = ?self.state, to = ?next, "ready state transition");
        self.state = next;
    }

    /// Complete the client handshake: attach the collaborators and move to
    /// Open
    ///
    /// Returns `false` without opening when the session was closed while
    /// the upgrade was in flight; the pending close event fires instead
    /// and the caller tears the transport down.
    pub fn open(&mut self, encoder: E, decoder: D, sub_protocol: Option<String>) -> bool {
        match self.state {
            ReadyState::Connecting => {
                self.encoder = Some(encoder);
                self.decoder = Some(decoder);
                self.sub_protocol = sub_protocol;
                self.transition(ReadyState::Open);
                self.sink.dispatch(Event::Open);
                true
            }
            ReadyState::Closed => {
                self.emit_close();
                false
            }
            _ => false,
        }
    }

    /// Run deferred work posted to this turn of the event loop
    ///
    /// Drivers call this once per loop iteration; tests call it directly
    /// to advance time deterministically.
    pub fn tick(&mut self) {
        // Only work posted before this turn runs now; anything scheduled
        // while draining waits for the next turn
        let scheduled = self.tasks.len();
        for _ in 0..scheduled {
            let Some(task) = self.tasks.pop_front() else {
                break;
            };
            match task {
                Task::Open => {
                    if self.state == ReadyState::Connecting {
                        self.transition(ReadyState::Open);
                        self.sink.dispatch(Event::Open);
                    }
                }
                Task::ReleaseQueue => self.release_queue(),
            }
        }
    }

    /// Send one data message
    ///
    /// Emits a single frame with `fin = true`, or defers behind an
    /// in-flight streaming send.
    pub fn send(&mut self, payload: impl Into<Bytes>, binary: bool) -> Result<()> {
        let payload = payload.into();
        if self.state != ReadyState::Open {
            return Err(Error::NotOpened);
        }
        if let SendMode::Streaming { deferred, .. } = &mut self.mode {
            deferred.push_back(Action::Send { payload, binary });
            return Ok(());
        }
        let encoder = self.encoder.as_mut().ok_or(Error::NotOpened)?;
        encoder.data(&mut self.out, &payload, binary, true)
    }

    /// Send a ping control frame
    pub fn ping(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if self.state != ReadyState::Open {
            return Err(Error::NotOpened);
        }
        if let SendMode::Streaming { deferred, .. } = &mut self.mode {
            deferred.push_back(Action::Ping(payload));
            return Ok(());
        }
        let encoder = self.encoder.as_mut().ok_or(Error::NotOpened)?;
        encoder.ping(&mut self.out, &payload)
    }

    /// Send a pong control frame
    pub fn pong(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if self.state != ReadyState::Open {
            return Err(Error::NotOpened);
        }
        if let SendMode::Streaming { deferred, .. } = &mut self.mode {
            deferred.push_back(Action::Pong(payload));
            return Ok(());
        }
        let encoder = self.encoder.as_mut().ok_or(Error::NotOpened)?;
        encoder.pong(&mut self.out, &payload)
    }

    /// Begin a multi-frame message, installing the queue gate
    ///
    /// Subsequent send-shaped operations defer until the terminal fragment
    /// is pushed and the queue releases on the next turn.
    pub fn begin_message(&mut self, binary: bool) -> Result<()> {
        if self.state != ReadyState::Open {
            return Err(Error::NotOpened);
        }
        match self.mode {
            SendMode::Streaming { .. } => Err(Error::Encoder("message already in flight")),
            SendMode::Idle => {
                self.mode = SendMode::Streaming {
                    binary,
                    done: false,
                    deferred: VecDeque::new(),
                };
                Ok(())
            }
        }
    }

    /// Push one fragment of the in-flight message
    ///
    /// `fin = true` terminates the message and schedules the queue release
    /// for the next turn. A zero-length terminal fragment is valid. When
    /// the session left Open at a chunk boundary this fails with
    /// `NotOpened` and the queue stays unreleased; the session is
    /// terminal.
    pub fn push_fragment(&mut self, payload: impl Into<Bytes>, fin: bool) -> Result<()> {
        let payload = payload.into();
        if self.state != ReadyState::Open {
            return Err(Error::NotOpened);
        }
        let binary = match &mut self.mode {
            SendMode::Streaming { binary, done, .. } => {
                if *done {
                    return Err(Error::Encoder("message already completed"));
                }
                if fin {
                    *done = true;
                }
                *binary
            }
            SendMode::Idle => return Err(Error::Encoder("no streaming message in flight")),
        };
        let encoder = self.encoder.as_mut().ok_or(Error::NotOpened)?;
        encoder.data(&mut self.out, &payload, binary, fin)?;
        if fin {
            self.tasks.push_back(Task::ReleaseQueue);
        }
        Ok(())
    }

    /// Stream a message through a callback
    ///
    /// The callback receives the session with the queue gate installed and
    /// pushes fragments via [`Session::push_fragment`]; it may return
    /// before the terminal fragment and continue pushing across turns.
    /// Issued while another message is in flight, the whole stream defers.
    pub fn stream<F>(&mut self, binary: bool, cb: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()> + Send + 'static,
    {
        self.stream_boxed(binary, Box::new(cb))
    }

    fn stream_boxed(&mut self, binary: bool, cb: StreamFn<E, D>) -> Result<()> {
        if self.state != ReadyState::Open {
            return Err(Error::NotOpened);
        }
        if let SendMode::Streaming { deferred, .. } = &mut self.mode {
            deferred.push_back(Action::Stream { binary, cb });
            return Ok(());
        }
        self.begin_message(binary)?;
        cb(self)
    }

    /// Replay the deferred queue in insertion order
    ///
    /// A replayed stream reinstalls the gate; anything behind it re-queues
    /// through the normal operation paths, preserving order.
    fn release_queue(&mut self) {
        let deferred = match &mut self.mode {
            SendMode::Streaming { deferred, .. } => std::mem::take(deferred),
            SendMode::Idle => return,
        };
        self.mode = SendMode::Idle;

        for action in deferred {
            if self.state != ReadyState::Open {
                break;
            }
            let result = match action {
                Action::Send { payload, binary } => self.send(payload, binary),
                Action::Ping(payload) => self.ping(payload),
                Action::Pong(payload) => self.pong(payload),
                Action::Stream { binary, cb } => self.stream_boxed(binary, cb),
            };
            if let Err(error) = result {
                self.raise_error(error);
                break;
            }
        }
    }

    /// Close the session
    ///
    /// From Open: records the code and reason, emits a close frame, and
    /// severs in one step without waiting for the peer's acknowledgment.
    /// A reason too long for a control frame still closes the session;
    /// the encoder error is returned and the frame is not sent.
    /// From Connecting: goes straight to Closed without a frame; the
    /// upgrade observer emits the close event. No-op in Closing.
    pub fn close(&mut self, code: Option<u16>, reason: &str) -> Result<()> {
        match self.state {
            ReadyState::Closing => Ok(()),
            ReadyState::Closed => Err(Error::NotOpened),
            ReadyState::Connecting => {
                self.mode = SendMode::Idle;
                self.transition(ReadyState::Closed);
                Ok(())
            }
            ReadyState::Open => {
                self.transition(ReadyState::Closing);
                self.close_code = code;
                self.close_reason = Some(reason.to_string());
                let result = match self.encoder.as_mut() {
                    Some(encoder) => {
                        encoder.close(&mut self.out, code.unwrap_or(CloseReason::NORMAL), reason)
                    }
                    None => Ok(()),
                };
                // The session ends either way; an oversized reason costs
                // the frame, not the lifecycle
                self.terminate();
                result
            }
        }
    }

    /// Unconditionally end the session
    ///
    /// Deferred sends are dropped, the transport-sever request is raised
    /// for the driver, and the close event fires if it has not already.
    pub fn terminate(&mut self) {
        self.shutdown = true;
        self.finish_close();
    }

    /// Record that the transport ended
    pub fn transport_closed(&mut self) {
        self.finish_close();
    }

    fn finish_close(&mut self) {
        self.mode = SendMode::Idle;
        if self.state != ReadyState::Closed {
            self.transition(ReadyState::Closed);
        }
        self.encoder = None;
        self.decoder = None;
        self.emit_close();
    }

    fn emit_close(&mut self) {
        if self.close_fired {
            return;
        }
        self.close_fired = true;
        let code = self.close_code.unwrap_or(CloseReason::NORMAL);
        let reason = self.close_reason.clone().unwrap_or_default();
        self.sink.dispatch(Event::Close { code, reason });
    }

    /// Deliver an asynchronous error
    ///
    /// Any deferred sends are discarded first so nothing replays after the
    /// error event.
    pub fn raise_error(&mut self, error: Error) {
        self.mode = SendMode::Idle;
        warn!(%error, "session error");
        self.sink.dispatch(Event::Error(error));
    }

    /// Feed transport bytes through the decoder and dispatch the results
    ///
    /// A decoder protocol error that carries a close code first reflects
    /// it to the peer via `close(code, "")`, then surfaces the error.
    pub fn receive(&mut self, bytes: &[u8]) {
        if self.state == ReadyState::Closed {
            return;
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };

        let mut events = Vec::new();
        let result = decoder.add(bytes, &mut events);

        for event in events {
            self.handle_wire_event(event);
            if self.state == ReadyState::Closed {
                break;
            }
        }

        if let Err(error) = result {
            if let Some(code) = error.close_code() {
                let _ = self.close(Some(code), "");
            }
            self.raise_error(error);
        }
    }

    fn handle_wire_event(&mut self, event: WireEvent) {
        match event {
            WireEvent::Text(data) => self.sink.dispatch(Event::Message {
                data,
                flags: MessageFlags { binary: false },
            }),
            WireEvent::Binary(data) => self.sink.dispatch(Event::Message {
                data,
                flags: MessageFlags { binary: true },
            }),
            WireEvent::Ping(data) => {
                // Reply is enqueued before the application hears the ping
                if self.state == ReadyState::Open {
                    if let Err(error) = self.pong(data.clone()) {
                        self.raise_error(error);
                        return;
                    }
                }
                self.sink.dispatch(Event::Ping { data });
            }
            WireEvent::Pong(data) => self.sink.dispatch(Event::Pong { data }),
            WireEvent::Close { code, reason } => {
                let _ = self.close(code, &reason);
            }
        }
    }
}

impl Session {
    /// Create a client session awaiting its handshake, using the wire codec
    pub fn client(version: u16) -> Self {
        Self::connecting(Role::Client, version)
    }

    /// Create a server-role session over an upgraded transport, using the
    /// wire codec
    pub fn server(version: u16, sub_protocol: Option<String>, max_message_size: usize) -> Self {
        Self::server_adapter(
            WireEncoder::new(Role::Server),
            WireDecoder::new(Role::Server, max_message_size),
            version,
            sub_protocol,
        )
    }
}

impl<E, D> std::fmt::Debug for Session<E, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("version", &self.version)
            .finish()
    }
}
