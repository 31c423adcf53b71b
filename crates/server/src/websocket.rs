//! The server side of one WebSocket connection.
//!
//! Inbound events reach a [`WsRequest`] through the [`WsEvents`] sink the
//! transport receives when it accepts the upgrade. Outbound operations go
//! through the transport's [`WsConnection`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use http::{HeaderMap, Uri};
use micro_async::generator::{AsyncGenerator, Emitter, generate};
use tracing::{debug, trace, warn};

use crate::protocol::{ExchangeId, RequestHeader};
use crate::utils::ensure;
use crate::{ServerError, TransportError};

/// The outbound hooks a transport provides for one WebSocket connection.
#[cfg_attr(test, mockall::automock)]
pub trait WsConnection {
    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    fn send_binary(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Refuses the upgrade.
    fn reject(&mut self);

    fn close(&mut self);
}

/// One inbound WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
}

impl WsMessage {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsMessage::Text(text) => Some(text),
            WsMessage::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            WsMessage::Binary(data) => Some(data),
            WsMessage::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Rejected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accepts {
    Text,
    Binary,
    Any,
}

impl Accepts {
    fn matches(self, message: &WsMessage) -> bool {
        match (self, message) {
            (Accepts::Any, _) | (Accepts::Text, WsMessage::Text(_)) | (Accepts::Binary, WsMessage::Binary(_)) => true,
            (Accepts::Text, WsMessage::Binary(_)) | (Accepts::Binary, WsMessage::Text(_)) => false,
        }
    }
}

type MessageCallback = Rc<RefCell<dyn FnMut(WsMessage)>>;
type CloseListener = Box<dyn FnOnce()>;

struct MessageListener {
    accepts: Accepts,
    callback: MessageCallback,
}

struct State {
    phase: Phase,
    exchanged: bool,
    listeners: Vec<MessageListener>,
    /// Messages that arrived while no listener accepted them, in arrival order.
    pending: VecDeque<WsMessage>,
    close_listeners: Vec<CloseListener>,
}

struct Inner {
    id: ExchangeId,
    header: RequestHeader,
    connection: RefCell<Box<dyn WsConnection>>,
    state: RefCell<State>,
}

/// A cheap, clonable handle to one WebSocket connection.
///
/// Listener registration is additive: every registered listener receives
/// every matching message, and every close listener runs exactly once.
/// Messages arriving before a matching listener exists are held for the
/// first one that registers.
#[derive(Clone)]
pub struct WsRequest {
    inner: Rc<Inner>,
}

impl fmt::Debug for WsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("WsRequest")
            .field("id", &self.inner.id)
            .field("uri", self.inner.header.uri())
            .field("phase", &state.phase)
            .finish_non_exhaustive()
    }
}

impl WsRequest {
    pub fn new(header: RequestHeader, connection: Box<dyn WsConnection>) -> Self {
        Self {
            inner: Rc::new(Inner {
                id: ExchangeId::next(),
                header,
                connection: RefCell::new(connection),
                state: RefCell::new(State {
                    phase: Phase::Open,
                    exchanged: false,
                    listeners: Vec::new(),
                    pending: VecDeque::new(),
                    close_listeners: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> ExchangeId {
        self.inner.id
    }

    pub fn uri(&self) -> &Uri {
        self.inner.header.uri()
    }

    pub fn path(&self) -> &str {
        self.inner.header.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.header.headers()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.header.header(name)
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.borrow().phase == Phase::Open
    }

    pub fn is_rejected(&self) -> bool {
        self.inner.state.borrow().phase == Phase::Rejected
    }

    fn ensure_open(&self) -> Result<(), ServerError> {
        ensure!(self.is_open(), ServerError::from(TransportError::ConnectionClosed));
        Ok(())
    }

    pub fn send_text(&self, text: &str) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.inner.connection.borrow_mut().send_text(text)?;
        self.inner.state.borrow_mut().exchanged = true;
        Ok(())
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.inner.connection.borrow_mut().send_binary(data)?;
        self.inner.state.borrow_mut().exchanged = true;
        Ok(())
    }

    /// Sends `text`, logging instead of failing when the connection is gone.
    pub fn send_text_safe(&self, text: &str) {
        if let Err(e) = self.send_text(text) {
            warn!(exchange = %self.inner.id, cause = %e, "failed to send websocket text message");
        }
    }

    /// Sends `data`, logging instead of failing when the connection is gone.
    pub fn send_binary_safe(&self, data: &[u8]) {
        if let Err(e) = self.send_binary(data) {
            warn!(exchange = %self.inner.id, cause = %e, "failed to send websocket binary message");
        }
    }

    /// Refuses the upgrade. Only valid before any message was exchanged.
    pub fn reject(&self) -> Result<(), ServerError> {
        {
            let mut state = self.inner.state.borrow_mut();
            ensure!(
                state.phase == Phase::Open && !state.exchanged,
                ServerError::protocol_state("websocket can only be rejected before any message is exchanged")
            );
            state.phase = Phase::Rejected;
            state.pending.clear();
        }
        debug!(exchange = %self.inner.id, "websocket upgrade rejected");
        self.inner.connection.borrow_mut().reject();
        self.fire_close();
        Ok(())
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) {
        if self.mark_closed() {
            self.inner.connection.borrow_mut().close();
            self.fire_close();
        }
    }

    fn mark_closed(&self) -> bool {
        let mut state = self.inner.state.borrow_mut();
        if state.phase != Phase::Open {
            return false;
        }
        state.phase = Phase::Closed;
        true
    }

    fn fire_close(&self) {
        let listeners = {
            let mut state = self.inner.state.borrow_mut();
            state.listeners.clear();
            std::mem::take(&mut state.close_listeners)
        };
        trace!(exchange = %self.inner.id, listeners = listeners.len(), "websocket closed");
        for listener in listeners {
            listener();
        }
    }

    /// Registers a text message listener.
    ///
    /// Text messages that arrived before any listener accepted them are
    /// delivered to it at once, also when the connection closed since.
    pub fn on_text_message<F>(&self, mut listener: F)
    where
        F: FnMut(String) + 'static,
    {
        self.add_listener(Accepts::Text, move |message| {
            if let WsMessage::Text(text) = message {
                listener(text);
            }
        });
    }

    /// Registers a binary message listener, with the same buffering as
    /// [`on_text_message`](Self::on_text_message).
    pub fn on_binary_message<F>(&self, mut listener: F)
    where
        F: FnMut(Bytes) + 'static,
    {
        self.add_listener(Accepts::Binary, move |message| {
            if let WsMessage::Binary(data) = message {
                listener(data);
            }
        });
    }

    /// Registers a listener for both kinds of message.
    pub fn on_message<F>(&self, listener: F)
    where
        F: FnMut(WsMessage) + 'static,
    {
        self.add_listener(Accepts::Any, listener);
    }

    fn add_listener<F>(&self, accepts: Accepts, listener: F)
    where
        F: FnMut(WsMessage) + 'static,
    {
        let callback: MessageCallback = Rc::new(RefCell::new(listener));
        let backlog = {
            let mut state = self.inner.state.borrow_mut();
            if state.phase == Phase::Open {
                state.listeners.push(MessageListener { accepts, callback: Rc::clone(&callback) });
            }
            let (matching, rest): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut state.pending).into_iter().partition(|m| accepts.matches(m));
            state.pending = rest;
            matching
        };
        if !backlog.is_empty() {
            trace!(exchange = %self.inner.id, messages = backlog.len(), "delivering buffered websocket messages");
        }
        for message in backlog {
            (callback.borrow_mut())(message);
        }
    }

    fn dispatch(&self, message: WsMessage) {
        let callbacks: Vec<MessageCallback> = {
            let mut state = self.inner.state.borrow_mut();
            if state.phase != Phase::Open {
                return;
            }
            state.exchanged = true;
            let callbacks: Vec<_> =
                state.listeners.iter().filter(|l| l.accepts.matches(&message)).map(|l| Rc::clone(&l.callback)).collect();
            if callbacks.is_empty() {
                trace!(exchange = %self.inner.id, "no listener yet, buffering websocket message");
                state.pending.push_back(message);
                return;
            }
            callbacks
        };
        for callback in callbacks {
            // a listener may close the connection
            if !self.is_open() {
                break;
            }
            (callback.borrow_mut())(message.clone());
        }
    }

    /// Registers a close listener. Runs at once if the connection already closed.
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce() + 'static,
    {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.phase == Phase::Open {
                state.close_listeners.push(Box::new(listener));
                return;
            }
        }
        listener();
    }

    pub fn text_message_stream(&self) -> AsyncGenerator<String> {
        generate(|emitter| {
            let messages = emitter.clone();
            self.on_text_message(move |text| {
                messages.emit(text);
            });
            self.close_on_close(emitter);
        })
    }

    pub fn binary_message_stream(&self) -> AsyncGenerator<Bytes> {
        generate(|emitter| {
            let messages = emitter.clone();
            self.on_binary_message(move |data| {
                messages.emit(data);
            });
            self.close_on_close(emitter);
        })
    }

    /// Text and binary messages interleaved in arrival order.
    pub fn any_message_stream(&self) -> AsyncGenerator<WsMessage> {
        generate(|emitter| {
            let messages = emitter.clone();
            self.on_message(move |message| {
                messages.emit(message);
            });
            self.close_on_close(emitter);
        })
    }

    fn close_on_close<T: 'static>(&self, emitter: Emitter<T>) {
        self.on_close(move || emitter.close());
    }

    /// The sink a transport feeds this connection's inbound events through.
    pub fn events(&self) -> WsEvents {
        WsEvents { request: self.clone() }
    }
}

/// Transport side of an accepted WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsEvents {
    request: WsRequest,
}

impl WsEvents {
    /// Delivers a text message to every text listener, or buffers it until
    /// one registers.
    pub fn text(&self, text: String) {
        self.request.dispatch(WsMessage::Text(text));
    }

    /// Delivers a binary message to every binary listener, or buffers it
    /// until one registers.
    pub fn binary(&self, data: Bytes) {
        self.request.dispatch(WsMessage::Binary(data));
    }

    /// Reports that the peer closed the connection.
    pub fn closed(&self) {
        if self.request.mark_closed() {
            self.request.fire_close();
        }
    }
}
