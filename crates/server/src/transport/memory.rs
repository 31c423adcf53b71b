//! An in-process transport and recording test doubles.
//!
//! [`MemoryTransport`] binds without touching the network. Exchanges are
//! injected with [`MemoryTransport::connect_http`] and
//! [`MemoryTransport::connect_websocket`]; what the server sends back is
//! recorded in a [`FakeResponse`] or [`FakeWsPeer`].
//!
//! ```
//! use micro_async::EventLoop;
//! use micro_server::HttpServer;
//! use micro_server::transport::memory::{FakeRequest, MemoryTransport};
//!
//! let event_loop = EventLoop::virtual_time();
//! let transport = MemoryTransport::new();
//! let server = HttpServer::new(&event_loop, transport.clone());
//! server.start(0, "127.0.0.1").unwrap();
//!
//! let response = transport.connect_http(FakeRequest::get("/missing")).unwrap();
//! assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};
use tracing::debug;

use crate::protocol::{Headers, RequestHeader, reason_phrase};
use crate::request::{BodySink, HttpExchange, Request};
use crate::server::{Acceptor, Transport};
use crate::websocket::{WsConnection, WsEvents, WsMessage, WsRequest};
use crate::TransportError;

const FIRST_EPHEMERAL_PORT: u16 = 49152;

struct MemoryState {
    acceptor: Option<Acceptor>,
    addr: Option<SocketAddr>,
    next_port: u16,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self { acceptor: None, addr: None, next_port: FIRST_EPHEMERAL_PORT }
    }
}

/// A transport whose clients live in the same process.
///
/// Clones share the same binding, so a test keeps one clone to inject
/// exchanges while the server owns another.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Rc<RefCell<MemoryState>>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport").field("addr", &self.state.borrow().addr).finish_non_exhaustive()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        self.state.borrow().addr.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.borrow().addr
    }

    fn acceptor(&self) -> Result<Acceptor, TransportError> {
        self.state.borrow().acceptor.clone().ok_or(TransportError::NotListening)
    }

    /// Offers `request` to the bound server and returns the recording of its response.
    pub fn connect_http(&self, request: FakeRequest) -> Result<FakeResponse, TransportError> {
        let acceptor = self.acceptor()?;
        let (exchange, response) = RecordingExchange::new();
        let (header, body) = request.into_parts();
        let sink = acceptor.accept_http(header, Box::new(exchange))?;
        body.deliver(&sink);
        Ok(response)
    }

    /// Offers a WebSocket upgrade to the bound server.
    pub fn connect_websocket(&self, header: RequestHeader) -> Result<FakeWsPeer, TransportError> {
        let acceptor = self.acceptor()?;
        let state = Rc::new(RefCell::new(PeerState::default()));
        let events = acceptor.accept_websocket(header, Box::new(FakeWsConnection { state: Rc::clone(&state) }))?;
        Ok(FakeWsPeer { events, state })
    }
}

impl Transport for MemoryTransport {
    fn bind(&mut self, addr: SocketAddr, acceptor: Acceptor) -> Result<SocketAddr, TransportError> {
        let mut state = self.state.borrow_mut();
        if state.addr.is_some() {
            return Err(TransportError::AddressInUse { addr });
        }

        let mut bound = addr;
        if bound.port() == 0 {
            bound.set_port(state.next_port);
            state.next_port = state.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
        }
        state.addr = Some(bound);
        state.acceptor = Some(acceptor);
        debug!(address = %bound, "memory transport bound");
        Ok(bound)
    }

    fn unbind(&mut self) {
        let mut state = self.state.borrow_mut();
        state.acceptor = None;
        if let Some(addr) = state.addr.take() {
            debug!(address = %addr, "memory transport unbound");
        }
    }
}

/// One outbound call a [`Request`] made on its exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    Status(StatusCode, String),
    Headers(Headers),
    Write(Bytes),
    End,
}

#[derive(Debug)]
struct Recorded {
    log: Vec<ExchangeEvent>,
    status: StatusCode,
    message: String,
    headers: Option<Headers>,
    body: BytesMut,
    disconnected: bool,
}

struct RecordingExchange {
    state: Rc<RefCell<Recorded>>,
}

impl RecordingExchange {
    fn new() -> (Self, FakeResponse) {
        let state = Rc::new(RefCell::new(Recorded {
            log: Vec::new(),
            status: StatusCode::OK,
            message: String::from(reason_phrase(StatusCode::OK)),
            headers: None,
            body: BytesMut::new(),
            disconnected: false,
        }));
        (Self { state: Rc::clone(&state) }, FakeResponse { state })
    }

    fn connected(&self) -> Result<std::cell::RefMut<'_, Recorded>, TransportError> {
        let state = self.state.borrow_mut();
        if state.disconnected {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(state)
    }
}

impl HttpExchange for RecordingExchange {
    fn set_status(&mut self, status: StatusCode, message: &str) {
        let mut state = self.state.borrow_mut();
        state.status = status;
        message.clone_into(&mut state.message);
        state.log.push(ExchangeEvent::Status(status, message.to_owned()));
    }

    fn send_headers(&mut self, headers: &Headers) -> Result<(), TransportError> {
        let mut state = self.connected()?;
        state.headers = Some(headers.clone());
        state.log.push(ExchangeEvent::Headers(headers.clone()));
        Ok(())
    }

    fn write(&mut self, data: Bytes) -> Result<(), TransportError> {
        let mut state = self.connected()?;
        state.body.extend_from_slice(&data);
        state.log.push(ExchangeEvent::Write(data));
        Ok(())
    }

    fn end(&mut self) -> Result<(), TransportError> {
        let mut state = self.connected()?;
        state.log.push(ExchangeEvent::End);
        Ok(())
    }
}

/// The client side view of a response produced through a [`FakeRequest`].
///
/// Renders as `status:message:headers:body`, e.g.
/// `404:Not Found:{X-Test=1,Content-Length=5}:hello`.
#[derive(Debug, Clone)]
pub struct FakeResponse {
    state: Rc<RefCell<Recorded>>,
}

impl FakeResponse {
    /// Every outbound call in the order it was made.
    pub fn log(&self) -> Vec<ExchangeEvent> {
        self.state.borrow().log.clone()
    }

    pub fn status(&self) -> StatusCode {
        self.state.borrow().status
    }

    pub fn status_message(&self) -> String {
        self.state.borrow().message.clone()
    }

    pub fn status_was_sent(&self) -> bool {
        self.state.borrow().log.iter().any(|event| matches!(event, ExchangeEvent::Status(..)))
    }

    /// The headers as flushed, `None` until the first write or end.
    pub fn headers(&self) -> Option<Headers> {
        self.state.borrow().headers.clone()
    }

    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.borrow().body)
    }

    pub fn end_count(&self) -> usize {
        self.state.borrow().log.iter().filter(|event| **event == ExchangeEvent::End).count()
    }

    pub fn is_ended(&self) -> bool {
        self.end_count() > 0
    }

    /// Makes every later header flush, write or end fail with
    /// [`TransportError::ConnectionClosed`].
    pub fn disconnect(&self) {
        self.state.borrow_mut().disconnected = true;
    }
}

impl fmt::Display for FakeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        let headers = state.headers.clone().unwrap_or_default();
        write!(f, "{}:{}:{}:{}", state.status.as_u16(), state.message, headers, String::from_utf8_lossy(&state.body))
    }
}

struct FakeBody {
    data: Option<Bytes>,
    streaming: bool,
}

impl FakeBody {
    fn deliver(self, sink: &BodySink) {
        if let Some(data) = self.data {
            sink.push(data);
        }
        if !self.streaming {
            sink.finish();
        }
    }
}

/// A client request to feed into a server or straight into a [`Request`].
#[derive(Debug)]
pub struct FakeRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
    streaming: bool,
}

impl FakeRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self { method, uri, headers: HeaderMap::new(), body: None, streaming: false }
    }

    /// # Panics
    ///
    /// Panics if `uri` is not a valid URI, like [`Uri::from_static`].
    pub fn get(uri: &'static str) -> Self {
        Self::new(Method::GET, Uri::from_static(uri))
    }

    /// # Panics
    ///
    /// Panics if `uri` is not a valid URI, like [`Uri::from_static`].
    pub fn post(uri: &'static str) -> Self {
        Self::new(Method::POST, Uri::from_static(uri))
    }

    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Leaves the inbound body open so chunks can be pushed through
    /// [`Request::body_sink`] later.
    #[must_use]
    pub fn streaming_body(mut self) -> Self {
        self.streaming = true;
        self
    }

    fn into_parts(self) -> (RequestHeader, FakeBody) {
        let mut request = http::Request::new(());
        *request.method_mut() = self.method;
        *request.uri_mut() = self.uri;
        *request.headers_mut() = self.headers;
        (RequestHeader::from(request), FakeBody { data: self.body, streaming: self.streaming })
    }

    /// Builds a standalone [`Request`] wired to a recording exchange.
    pub fn into_request(self) -> (Request, FakeResponse) {
        let (exchange, response) = RecordingExchange::new();
        let (header, body) = self.into_parts();
        let request = Request::new(header, Box::new(exchange));
        body.deliver(&request.body_sink());
        (request, response)
    }
}

#[derive(Debug, Default)]
struct PeerState {
    received: Vec<WsMessage>,
    rejected: bool,
    closed_by_server: bool,
    disconnected: bool,
}

struct FakeWsConnection {
    state: Rc<RefCell<PeerState>>,
}

impl FakeWsConnection {
    fn deliver(&self, message: WsMessage) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if state.disconnected {
            return Err(TransportError::ConnectionClosed);
        }
        state.received.push(message);
        Ok(())
    }
}

impl WsConnection for FakeWsConnection {
    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.deliver(WsMessage::Text(text.to_owned()))
    }

    fn send_binary(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.deliver(WsMessage::Binary(Bytes::copy_from_slice(data)))
    }

    fn reject(&mut self) {
        self.state.borrow_mut().rejected = true;
    }

    fn close(&mut self) {
        self.state.borrow_mut().closed_by_server = true;
    }
}

/// The client end of a WebSocket connection.
#[derive(Debug, Clone)]
pub struct FakeWsPeer {
    events: WsEvents,
    state: Rc<RefCell<PeerState>>,
}

impl FakeWsPeer {
    /// Opens a standalone [`WsRequest`] connected to a new peer.
    pub fn connect(header: RequestHeader) -> (WsRequest, FakeWsPeer) {
        let state = Rc::new(RefCell::new(PeerState::default()));
        let request = WsRequest::new(header, Box::new(FakeWsConnection { state: Rc::clone(&state) }));
        let peer = FakeWsPeer { events: request.events(), state };
        (request, peer)
    }

    pub fn send_text(&self, text: &str) {
        self.events.text(text.to_owned());
    }

    pub fn send_binary(&self, data: &[u8]) {
        self.events.binary(Bytes::copy_from_slice(data));
    }

    /// Closes the connection from the client side.
    pub fn close(&self) {
        self.events.closed();
    }

    /// Drops the connection without a close handshake; later server sends fail.
    pub fn disconnect(&self) {
        self.state.borrow_mut().disconnected = true;
    }

    /// Messages the server sent so far.
    pub fn received(&self) -> Vec<WsMessage> {
        self.state.borrow().received.clone()
    }

    pub fn was_rejected(&self) -> bool {
        self.state.borrow().rejected
    }

    pub fn was_closed_by_server(&self) -> bool {
        self.state.borrow().closed_by_server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_the_not_found_trace() {
        let (request, response) = FakeRequest::get("/").into_request();
        request.set_status_with(StatusCode::NOT_FOUND, "Not Found").unwrap();
        request.add_header("X-Test", "1").unwrap();
        request.end_with("hello").unwrap();

        let headers: Headers = [("X-Test", "1"), ("Content-Length", "5")].into_iter().collect();
        assert_eq!(
            response.log(),
            vec![
                ExchangeEvent::Status(StatusCode::NOT_FOUND, String::from("Not Found")),
                ExchangeEvent::Headers(headers),
                ExchangeEvent::Write(Bytes::from_static(b"hello")),
                ExchangeEvent::End,
            ]
        );
    }

    #[test]
    fn untouched_response_renders_defaults() {
        let (_request, response) = FakeRequest::get("/").into_request();
        assert_eq!(response.to_string(), "200:OK:{}:");
        assert!(!response.is_ended());
    }

    #[test]
    fn disconnected_client_fails_writes() {
        let (request, response) = FakeRequest::get("/").into_request();
        request.write("first").unwrap();
        response.disconnect();
        assert!(request.write("second").unwrap_err().is_transport());
        assert_eq!(response.body(), Bytes::from_static(b"first"));
    }

    #[test]
    fn request_headers_reach_the_request() {
        let (request, _response) = FakeRequest::get("/h")
            .header(HeaderName::from_static("x-token"), HeaderValue::from_static("abc"))
            .into_request();
        assert_eq!(request.header("X-Token"), Some("abc"));
        assert_eq!(request.method(), Method::GET);
    }

    #[test]
    fn ephemeral_ports_are_assigned_and_rebinding_fails() {
        let mut transport = MemoryTransport::new();
        let event_loop = micro_async::EventLoop::virtual_time();
        let server = crate::HttpServer::new(&event_loop, transport.clone());
        let addr = server.start(0, "127.0.0.1").unwrap();
        assert_eq!(addr.port(), FIRST_EPHEMERAL_PORT);
        assert_eq!(transport.local_addr(), Some(addr));

        let acceptor = transport.acceptor().unwrap();
        let err = transport.bind(SocketAddr::from(([127, 0, 0, 1], 1)), acceptor).unwrap_err();
        assert!(matches!(err, TransportError::AddressInUse { .. }));

        server.close();
        assert!(!transport.is_bound());
        assert!(matches!(transport.connect_websocket(RequestHeader::new(Method::GET, "/").unwrap()), Err(TransportError::NotListening)));
    }

    #[test]
    fn disconnected_peer_fails_sends() {
        let (ws, peer) = FakeWsPeer::connect(RequestHeader::new(Method::GET, "/").unwrap());
        peer.disconnect();
        assert!(ws.send_text("lost").unwrap_err().is_transport());
        ws.send_text_safe("also lost");
        assert!(peer.received().is_empty());
        ws.close();
        assert!(peer.was_closed_by_server());
    }
}
