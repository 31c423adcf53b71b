//! The server side of one HTTP exchange.
//!
//! A [`Request`] owns the response lifecycle of an exchange:
//!
//! ```text
//! Created -> HeaderPending -> HeaderSent -> BodyWriting -> Ended
//!                  \______________________________________/
//!                          end() from any earlier stage
//! ```
//!
//! Status and headers may only change while the stage is `HeaderPending`.
//! The first `write` or `end` flushes the headers to the transport exactly
//! once. Everything transport specific sits behind [`HttpExchange`].

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{HeaderMap, Method, StatusCode, Uri};
use micro_async::generator::{AsyncGenerator, generate};
use tracing::trace;

use crate::protocol::{self, ExchangeId, Headers, RequestHeader, reason_phrase};
use crate::utils::ensure;
use crate::{ServerError, TransportError};

/// The outbound hooks a transport provides for one HTTP exchange.
///
/// Calls arrive in lifecycle order: `set_status` any number of times before
/// `send_headers`, which is called exactly once, then `write` zero or more
/// times and finally `end`.
#[cfg_attr(test, mockall::automock)]
pub trait HttpExchange {
    fn set_status(&mut self, status: StatusCode, message: &str);

    fn send_headers(&mut self, headers: &Headers) -> Result<(), TransportError>;

    fn write(&mut self, data: Bytes) -> Result<(), TransportError>;

    fn end(&mut self) -> Result<(), TransportError>;
}

/// Response lifecycle stage of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Created,
    HeaderPending,
    HeaderSent,
    BodyWriting,
    Ended,
}

type DataListener = Rc<RefCell<dyn FnMut(Bytes)>>;
type EndListener = Box<dyn FnOnce()>;

#[derive(Default)]
struct InboundBody {
    pending: Vec<Bytes>,
    finished: bool,
    data_listeners: Vec<DataListener>,
    end_listeners: Vec<EndListener>,
}

struct ResponseState {
    stage: Stage,
    status: StatusCode,
    message: String,
    headers: Headers,
}

struct Inner {
    id: ExchangeId,
    header: RequestHeader,
    response: RefCell<ResponseState>,
    exchange: RefCell<Box<dyn HttpExchange>>,
    body: Rc<RefCell<InboundBody>>,
}

/// A cheap, clonable handle to one HTTP exchange.
///
/// Clones share the same state; a handler may keep one around after it
/// returned, for instance to finish streaming a response from a timer.
#[derive(Clone)]
pub struct Request {
    inner: Rc<Inner>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let response = self.inner.response.borrow();
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("method", self.inner.header.method())
            .field("uri", self.inner.header.uri())
            .field("stage", &response.stage)
            .field("status", &response.status)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Creates the request for an accepted exchange and moves it to `HeaderPending`.
    pub fn new(header: RequestHeader, exchange: Box<dyn HttpExchange>) -> Self {
        let request = Self {
            inner: Rc::new(Inner {
                id: ExchangeId::next(),
                header,
                response: RefCell::new(ResponseState {
                    stage: Stage::Created,
                    status: StatusCode::OK,
                    message: String::from(reason_phrase(StatusCode::OK)),
                    headers: Headers::new(),
                }),
                exchange: RefCell::new(exchange),
                body: Rc::new(RefCell::new(InboundBody::default())),
            }),
        };
        request.transition(Stage::HeaderPending);
        request
    }

    fn transition(&self, stage: Stage) {
        let mut response = self.inner.response.borrow_mut();
        if response.stage != stage {
            trace!(exchange = %self.inner.id, from = ?response.stage, to = ?stage, "request stage changed");
            response.stage = stage;
        }
    }

    pub fn id(&self) -> ExchangeId {
        self.inner.id
    }

    pub fn method(&self) -> &Method {
        self.inner.header.method()
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

    pub fn stage(&self) -> Stage {
        self.inner.response.borrow().stage
    }

    pub fn status(&self) -> StatusCode {
        self.inner.response.borrow().status
    }

    pub fn status_message(&self) -> String {
        self.inner.response.borrow().message.clone()
    }

    pub fn headers_sent(&self) -> bool {
        self.stage() > Stage::HeaderPending
    }

    pub fn is_ended(&self) -> bool {
        self.stage() == Stage::Ended
    }

    /// A snapshot of the response headers set so far.
    pub fn response_headers(&self) -> Headers {
        self.inner.response.borrow().headers.clone()
    }

    /// Sets the response status with its standard reason phrase.
    pub fn set_status(&self, status: StatusCode) -> Result<(), ServerError> {
        self.set_status_with(status, reason_phrase(status))
    }

    /// Sets the response status with a custom reason phrase.
    pub fn set_status_with(&self, status: StatusCode, message: &str) -> Result<(), ServerError> {
        {
            let mut response = self.inner.response.borrow_mut();
            ensure!(response.stage == Stage::HeaderPending, ServerError::headers_already_sent());
            response.status = status;
            message.clone_into(&mut response.message);
        }
        self.inner.exchange.borrow_mut().set_status(status, message);
        Ok(())
    }

    pub fn add_header<N: Into<String>, V: Into<String>>(&self, name: N, value: V) -> Result<(), ServerError> {
        let mut response = self.inner.response.borrow_mut();
        ensure!(response.stage == Stage::HeaderPending, ServerError::headers_already_sent());
        response.headers.add(name, value);
        Ok(())
    }

    pub fn replace_header<N: Into<String>, V: Into<String>>(&self, name: N, value: V) -> Result<(), ServerError> {
        let mut response = self.inner.response.borrow_mut();
        ensure!(response.stage == Stage::HeaderPending, ServerError::headers_already_sent());
        response.headers.replace(name, value);
        Ok(())
    }

    pub fn remove_header(&self, name: &str) -> Result<bool, ServerError> {
        let mut response = self.inner.response.borrow_mut();
        ensure!(response.stage == Stage::HeaderPending, ServerError::headers_already_sent());
        Ok(response.headers.remove(name))
    }

    fn flush_headers(&self) -> Result<(), TransportError> {
        let headers = {
            let mut response = self.inner.response.borrow_mut();
            if response.stage != Stage::HeaderPending {
                return Ok(());
            }
            response.stage = Stage::HeaderSent;
            response.headers.clone()
        };
        trace!(exchange = %self.inner.id, headers = %headers, "flushing response headers");
        self.inner.exchange.borrow_mut().send_headers(&headers)
    }

    /// Writes a body chunk, flushing the headers first if they are still pending.
    pub fn write<B: Into<Bytes>>(&self, data: B) -> Result<(), ServerError> {
        ensure!(!self.is_ended(), ServerError::response_ended());
        self.flush_headers()?;
        self.transition(Stage::BodyWriting);
        self.inner.exchange.borrow_mut().write(data.into())?;
        Ok(())
    }

    /// Completes the response, flushing the headers first if they are still pending.
    ///
    /// The request is `Ended` afterwards even if the transport reports an error.
    pub fn end(&self) -> Result<(), ServerError> {
        ensure!(!self.is_ended(), ServerError::response_ended());
        let flushed = self.flush_headers();
        self.transition(Stage::Ended);
        flushed?;
        self.inner.exchange.borrow_mut().end()?;
        Ok(())
    }

    /// Sets `Content-Length` to the size of `data`, writes it and ends the response.
    pub fn end_with<B: Into<Bytes>>(&self, data: B) -> Result<(), ServerError> {
        let data = data.into();
        self.replace_header(protocol::CONTENT_LENGTH, data.len().to_string())?;
        self.write(data)?;
        self.end()
    }

    /// Ends the response unless it already ended.
    pub fn close(&self) -> Result<(), ServerError> {
        if self.is_ended() {
            return Ok(());
        }
        self.end()
    }

    /// Registers a listener for inbound body chunks.
    ///
    /// Chunks that arrived before the first listener was registered are
    /// delivered to it immediately.
    pub fn on_data<F>(&self, listener: F)
    where
        F: FnMut(Bytes) + 'static,
    {
        let listener: DataListener = Rc::new(RefCell::new(listener));
        let backlog = {
            let mut body = self.inner.body.borrow_mut();
            body.data_listeners.push(Rc::clone(&listener));
            std::mem::take(&mut body.pending)
        };
        for chunk in backlog {
            (listener.borrow_mut())(chunk);
        }
    }

    /// Registers a listener for the end of the inbound body. Runs at once if
    /// the body already ended.
    pub fn on_end<F>(&self, listener: F)
    where
        F: FnOnce() + 'static,
    {
        {
            let mut body = self.inner.body.borrow_mut();
            if !body.finished {
                body.end_listeners.push(Box::new(listener));
                return;
            }
        }
        listener();
    }

    /// The inbound body as a stream of chunks.
    pub fn body_stream(&self) -> AsyncGenerator<Bytes> {
        generate(|emitter| {
            let data = emitter.clone();
            self.on_data(move |chunk| {
                data.emit(chunk);
            });
            self.on_end(move || emitter.close());
        })
    }

    /// Collects the whole inbound body.
    pub async fn read_body(&self) -> Result<Bytes, ServerError> {
        let mut chunks = self.body_stream();
        let mut body = BytesMut::new();
        while let Some(chunk) = chunks.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body.freeze())
    }

    /// The sink a transport feeds this request's inbound body through.
    pub fn body_sink(&self) -> BodySink {
        BodySink { exchange: self.inner.id, body: Rc::clone(&self.inner.body) }
    }
}

/// Transport side of an inbound request body.
#[derive(Clone)]
pub struct BodySink {
    exchange: ExchangeId,
    body: Rc<RefCell<InboundBody>>,
}

impl fmt::Debug for BodySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySink").field("exchange", &self.exchange).finish_non_exhaustive()
    }
}

impl BodySink {
    /// Delivers a chunk to every body listener, or buffers it until one is registered.
    pub fn push(&self, chunk: Bytes) {
        let listeners = {
            let mut body = self.body.borrow_mut();
            if body.finished {
                trace!(exchange = %self.exchange, "dropping body chunk after end of body");
                return;
            }
            if body.data_listeners.is_empty() {
                body.pending.push(chunk);
                return;
            }
            body.data_listeners.clone()
        };
        for listener in listeners {
            (listener.borrow_mut())(chunk.clone());
        }
    }

    /// Marks the end of the inbound body. Idempotent.
    pub fn finish(&self) {
        let listeners = {
            let mut body = self.body.borrow_mut();
            if body.finished {
                return;
            }
            body.finished = true;
            std::mem::take(&mut body.end_listeners)
        };
        for listener in listeners {
            listener();
        }
    }
}
