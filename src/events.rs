//! Application-visible events
//!
//! The session surfaces activity through two complementary shapes fed by a
//! single dispatch point: optional per-channel listeners, and a pending
//! queue the endpoint drains in order.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;

use crate::error::Error;

/// Flags attached to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFlags {
    /// True iff the message arrived with the binary opcode
    pub binary: bool,
}

/// A session event
#[derive(Debug)]
pub enum Event {
    /// The session transitioned to Open; fires once
    Open,
    /// One complete logical message
    Message {
        /// Message payload
        data: Bytes,
        /// Delivery flags
        flags: MessageFlags,
    },
    /// Ping received from the peer (the pong reply is already on its way)
    Ping {
        /// Ping payload
        data: Bytes,
    },
    /// Pong received from the peer
    Pong {
        /// Pong payload
        data: Bytes,
    },
    /// Asynchronous failure; may fire multiple times, and each firing
    /// discards any deferred sends
    Error(Error),
    /// The session ended; fires at most once
    Close {
        /// Close code (1000 when none was recorded)
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// Browser-style message wrapper: the payload alone, no flags
///
/// Produced by [`EventSink::on_message_event`], which adapts a handler
/// expecting this shape onto the native `(data, flags)` channel.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Message payload
    pub data: Bytes,
}

type OpenFn = Box<dyn FnMut() + Send>;
type MessageFn = Box<dyn FnMut(&Bytes, MessageFlags) + Send>;
type PayloadFn = Box<dyn FnMut(&Bytes) + Send>;
type ErrorFn = Box<dyn FnMut(&Error) + Send>;
type CloseFn = Box<dyn FnMut(u16, &str) + Send>;

/// Listener registry plus the pending-event queue
#[derive(Default)]
pub struct EventSink {
    on_open: Option<OpenFn>,
    on_message: Option<MessageFn>,
    on_ping: Option<PayloadFn>,
    on_pong: Option<PayloadFn>,
    on_error: Option<ErrorFn>,
    on_close: Option<CloseFn>,
    pending: VecDeque<Event>,
}

impl EventSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the open listener
    pub fn on_open(&mut self, f: impl FnMut() + Send + 'static) {
        self.on_open = Some(Box::new(f));
    }

    /// Set the message listener, receiving `(data, flags)`
    pub fn on_message(&mut self, f: impl FnMut(&Bytes, MessageFlags) + Send + 'static) {
        self.on_message = Some(Box::new(f));
    }

    /// Set a browser-style message listener receiving [`MessageEvent`]
    ///
    /// Thin translation layer over [`EventSink::on_message`]; flags are
    /// dropped on the way through.
    pub fn on_message_event(&mut self, mut f: impl FnMut(MessageEvent) + Send + 'static) {
        self.on_message(move |data, _flags| {
            f(MessageEvent { data: data.clone() });
        });
    }

    /// Set the ping listener
    pub fn on_ping(&mut self, f: impl FnMut(&Bytes) + Send + 'static) {
        self.on_ping = Some(Box::new(f));
    }

    /// Set the pong listener
    pub fn on_pong(&mut self, f: impl FnMut(&Bytes) + Send + 'static) {
        self.on_pong = Some(Box::new(f));
    }

    /// Set the error listener
    pub fn on_error(&mut self, f: impl FnMut(&Error) + Send + 'static) {
        self.on_error = Some(Box::new(f));
    }

    /// Set the close listener, receiving `(code, reason)`
    pub fn on_close(&mut self, f: impl FnMut(u16, &str) + Send + 'static) {
        self.on_close = Some(Box::new(f));
    }

    /// Deliver an event: invoke the matching listener, then queue it for
    /// the endpoint
    pub fn dispatch(&mut self, event: Event) {
        match &event {
            Event::Open => {
                if let Some(f) = &mut self.on_open {
                    f();
                }
            }
            Event::Message { data, flags } => {
                if let Some(f) = &mut self.on_message {
                    f(data, *flags);
                }
            }
            Event::Ping { data } => {
                if let Some(f) = &mut self.on_ping {
                    f(data);
                }
            }
            Event::Pong { data } => {
                if let Some(f) = &mut self.on_pong {
                    f(data);
                }
            }
            Event::Error(error) => {
                if let Some(f) = &mut self.on_error {
                    f(error);
                }
            }
            Event::Close { code, reason } => {
                if let Some(f) = &mut self.on_close {
                    f(*code, reason);
                }
            }
        }
        self.pending.push_back(event);
    }

    /// Pop the next pending event, in delivery order
    pub fn poll_event(&mut self) -> Option<Event> {
        self.pending.pop_front()
    }

    /// Number of undelivered events
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_dispatch_invokes_listener_and_queues() {
        let mut sink = EventSink::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        sink.on_message(move |data, flags| {
            assert_eq!(data.as_ref(), b"hi");
            assert!(!flags.binary);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        sink.dispatch(Event::Message {
            data: Bytes::from_static(b"hi"),
            flags: MessageFlags { binary: false },
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(sink.poll_event(), Some(Event::Message { .. })));
        assert!(sink.poll_event().is_none());
    }

    #[test]
    fn test_message_event_adapter() {
        let mut sink = EventSink::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        sink.on_message_event(move |event| {
            assert_eq!(event.data.as_ref(), b"wrapped");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        sink.dispatch(Event::Message {
            data: Bytes::from_static(b"wrapped"),
            flags: MessageFlags { binary: true },
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
