//! HTTP and WebSocket server.
//!
//! [`HttpServer`] binds through a [`Transport`], which hands every accepted
//! exchange to the server's [`Acceptor`]. Each exchange is wrapped in a
//! [`Request`] or [`WsRequest`] and dispatched to the registered handler as a
//! task on the server's [`EventLoop`].
//!
//! Without a handler, HTTP requests are answered with `404 Not Found` and
//! WebSocket upgrades are rejected. When a handler fails before the response
//! headers were sent, the client receives `500 Internal Server Error`.

use std::cell::RefCell;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::{Rc, Weak};

use http::StatusCode;
use micro_async::{Deferred, EventLoop, Promise};
use tracing::{debug, error, info, warn};

use crate::handler::{ExchangeAdapter, Handler};
use crate::protocol::{self, RequestHeader, reason_phrase};
use crate::request::{BodySink, HttpExchange};
use crate::utils::ensure;
use crate::websocket::{WsConnection, WsEvents};
use crate::{Request, ServerError, TransportError, WsRequest};

/// A source of inbound exchanges.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Starts accepting on `addr` and returns the address actually bound.
    /// Port `0` lets the transport pick one.
    fn bind(&mut self, addr: SocketAddr, acceptor: Acceptor) -> Result<SocketAddr, TransportError>;

    /// Stops accepting. Exchanges already accepted keep running.
    fn unbind(&mut self);
}

#[derive(Default)]
struct Handlers {
    http: Option<Rc<dyn Handler<Request>>>,
    websocket: Option<Rc<dyn Handler<WsRequest>>>,
}

struct Binding {
    addr: SocketAddr,
    stopped: Deferred<()>,
}

struct ServerInner {
    event_loop: EventLoop,
    default_host: String,
    transport: RefCell<Box<dyn Transport>>,
    handlers: RefCell<Handlers>,
    binding: RefCell<Option<Binding>>,
}

/// A cheap, clonable handle to a server.
#[derive(Clone)]
pub struct HttpServer {
    inner: Rc<ServerInner>,
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = self.inner.binding.borrow();
        f.debug_struct("HttpServer")
            .field("default_host", &self.inner.default_host)
            .field("address", &binding.as_ref().map(|b| b.addr))
            .finish_non_exhaustive()
    }
}

pub struct HttpServerBuilder {
    transport: Box<dyn Transport>,
    event_loop: Option<EventLoop>,
    default_host: String,
}

impl fmt::Debug for HttpServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServerBuilder").field("default_host", &self.default_host).finish_non_exhaustive()
    }
}

impl HttpServerBuilder {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport, event_loop: None, default_host: String::from("127.0.0.1") }
    }

    /// The loop handlers run on. A fresh system-clock loop is created when unset.
    pub fn event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    /// The host [`HttpServer::listen_on`] binds to.
    pub fn default_host<S: Into<String>>(mut self, host: S) -> Self {
        self.default_host = host.into();
        self
    }

    pub fn build(self) -> HttpServer {
        HttpServer {
            inner: Rc::new(ServerInner {
                event_loop: self.event_loop.unwrap_or_default(),
                default_host: self.default_host,
                transport: RefCell::new(self.transport),
                handlers: RefCell::new(Handlers::default()),
                binding: RefCell::new(None),
            }),
        }
    }
}

impl HttpServer {
    pub fn builder<T: Transport + 'static>(transport: T) -> HttpServerBuilder {
        HttpServerBuilder::new(Box::new(transport))
    }

    pub fn new<T: Transport + 'static>(event_loop: &EventLoop, transport: T) -> Self {
        Self::builder(transport).event_loop(event_loop.clone()).build()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Sets the handler for plain HTTP requests, replacing any previous one.
    pub fn http_handler<H: Handler<Request> + 'static>(&self, handler: H) -> &Self {
        self.inner.handlers.borrow_mut().http = Some(Rc::new(handler));
        self
    }

    /// Sets the handler for WebSocket upgrades, replacing any previous one.
    pub fn websocket_handler<H: Handler<WsRequest> + 'static>(&self, handler: H) -> &Self {
        self.inner.handlers.borrow_mut().websocket = Some(Rc::new(handler));
        self
    }

    /// Sets one handler for both kinds of exchange.
    pub fn all_handler<H: Handler<crate::handler::Exchange> + 'static>(&self, handler: H) -> &Self {
        let handler: Rc<dyn Handler<crate::handler::Exchange>> = Rc::new(handler);
        let mut handlers = self.inner.handlers.borrow_mut();
        handlers.http = Some(Rc::new(ExchangeAdapter::new(Rc::clone(&handler))));
        handlers.websocket = Some(Rc::new(ExchangeAdapter::new(handler)));
        self
    }

    /// Binds to `host:port` without waiting for the server to close.
    pub fn start(&self, port: u16, host: &str) -> Result<SocketAddr, ServerError> {
        ensure!(self.inner.binding.borrow().is_none(), ServerError::protocol_state("server is already listening"));
        let addr = SocketAddr::new(parse_host(host)?, port);

        let acceptor = Acceptor { server: Rc::downgrade(&self.inner) };
        let bound = self.inner.transport.borrow_mut().bind(addr, acceptor)?;
        *self.inner.binding.borrow_mut() = Some(Binding { addr: bound, stopped: Deferred::new() });
        info!(address = %bound, "start listening");
        Ok(bound)
    }

    /// Binds to `host:port` and completes once [`close`](Self::close) is called.
    pub async fn listen(&self, port: u16, host: &str) -> Result<(), ServerError> {
        self.start(port, host)?;
        self.closed().await?;
        Ok(())
    }

    /// [`listen`](Self::listen) on the builder's default host.
    pub async fn listen_on(&self, port: u16) -> Result<(), ServerError> {
        let host = self.inner.default_host.clone();
        self.listen(port, &host).await
    }

    /// Completes when the current binding is closed, at once if there is none.
    pub fn closed(&self) -> Promise<()> {
        match self.inner.binding.borrow().as_ref() {
            Some(binding) => binding.stopped.promise(),
            None => Promise::resolved(()),
        }
    }

    /// The bound port, or `0` when not listening.
    pub fn actual_port(&self) -> u16 {
        self.local_addr().map_or(0, |addr| addr.port())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.binding.borrow().as_ref().map(|binding| binding.addr)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.binding.borrow().is_some()
    }

    /// Stops accepting new exchanges and completes pending `listen` calls. Idempotent.
    pub fn close(&self) {
        let Some(binding) = self.inner.binding.borrow_mut().take() else {
            return;
        };
        self.inner.transport.borrow_mut().unbind();
        binding.stopped.resolve(());
        info!(address = %binding.addr, "server closed");
    }
}

fn parse_host(host: &str) -> Result<IpAddr, ServerError> {
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    host.parse::<IpAddr>().map_err(|e| ServerError::invalid_argument(format!("invalid host {host:?}: {e}")))
}

/// The handle a [`Transport`] delivers accepted exchanges through.
///
/// Holds only a weak reference to its server; once the server is closed or
/// dropped every offer fails with [`TransportError::NotListening`].
#[derive(Clone)]
pub struct Acceptor {
    server: Weak<ServerInner>,
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor").field("live", &(self.server.strong_count() > 0)).finish()
    }
}

impl Acceptor {
    fn server(&self) -> Result<Rc<ServerInner>, TransportError> {
        let server = self.server.upgrade().ok_or(TransportError::NotListening)?;
        ensure!(server.binding.borrow().is_some(), TransportError::NotListening);
        Ok(server)
    }

    /// Accepts an HTTP request. The returned sink carries its inbound body.
    pub fn accept_http(&self, header: RequestHeader, exchange: Box<dyn HttpExchange>) -> Result<BodySink, TransportError> {
        let server = self.server()?;
        let request = Request::new(header, exchange);
        debug!(exchange = %request.id(), method = %request.method(), uri = %request.uri(), "http request accepted");

        let body = request.body_sink();
        let handler = server.handlers.borrow().http.clone();
        match handler {
            Some(handler) => {
                let _task = server.event_loop.spawn(async move {
                    if let Err(e) = handler.call(request.clone()).await {
                        error!(exchange = %request.id(), cause = %e, "http handler failed");
                        send_status_response(&request, StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    Ok(())
                });
            }
            None => {
                warn!(exchange = %request.id(), uri = %request.uri(), "no http handler registered");
                send_status_response(&request, StatusCode::NOT_FOUND);
            }
        }
        Ok(body)
    }

    /// Accepts a WebSocket upgrade. The returned sink carries its inbound events.
    pub fn accept_websocket(&self, header: RequestHeader, connection: Box<dyn WsConnection>) -> Result<WsEvents, TransportError> {
        let server = self.server()?;
        let request = WsRequest::new(header, connection);
        debug!(exchange = %request.id(), uri = %request.uri(), "websocket upgrade accepted");

        let events = request.events();
        let handler = server.handlers.borrow().websocket.clone();
        match handler {
            Some(handler) => {
                let _task = server.event_loop.spawn(async move {
                    if let Err(e) = handler.call(request.clone()).await {
                        error!(exchange = %request.id(), cause = %e, "websocket handler failed");
                        request.close();
                    }
                    Ok(())
                });
            }
            None => {
                warn!(exchange = %request.id(), uri = %request.uri(), "no websocket handler registered");
                if let Err(e) = request.reject() {
                    warn!(exchange = %request.id(), cause = %e, "failed to reject websocket upgrade");
                }
            }
        }
        Ok(events)
    }
}

/// Answers with a bare status response, or just ends the response when its
/// headers already went out.
fn send_status_response(request: &Request, status: StatusCode) {
    let result = if request.headers_sent() {
        request.close()
    } else {
        request
            .set_status(status)
            .and_then(|()| request.replace_header(protocol::CONTENT_TYPE, mime::TEXT_PLAIN_UTF_8.as_ref()))
            .and_then(|()| request.end_with(reason_phrase(status)))
    };

    if let Err(e) = result {
        warn!(exchange = %request.id(), status = %status, cause = %e, "failed to send status response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Exchange, make_handler};
    use crate::transport::memory::{FakeRequest, MemoryTransport};
    use bytes::Bytes;
    use micro_async::AsyncError;
    use std::time::Duration;

    fn server_on(event_loop: &EventLoop) -> (HttpServer, MemoryTransport) {
        let transport = MemoryTransport::new();
        (HttpServer::new(event_loop, transport.clone()), transport)
    }

    #[test]
    fn listen_completes_after_close() {
        let event_loop = EventLoop::virtual_time();
        let (server, _transport) = server_on(&event_loop);

        let listening = {
            let server = server.clone();
            event_loop.spawn(async move { Ok(server.listen(0, "127.0.0.1").await?) })
        };
        event_loop.run_until_stalled();
        assert!(server.is_listening());
        assert_ne!(server.actual_port(), 0);
        assert!(!listening.is_settled());

        let closer = server.clone();
        event_loop.set_timeout(Duration::from_millis(50), move || closer.close());
        event_loop.run();
        assert!(listening.outcome().unwrap().is_ok());
        assert_eq!(server.actual_port(), 0);
        server.close();
    }

    #[test]
    fn explicit_port_is_kept() {
        let event_loop = EventLoop::virtual_time();
        let (server, transport) = server_on(&event_loop);
        let addr = server.start(8080, "localhost").unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(server.actual_port(), 8080);
        assert!(transport.is_bound());
    }

    #[test]
    fn malformed_host_is_an_invalid_argument() {
        let event_loop = EventLoop::virtual_time();
        let (server, _transport) = server_on(&event_loop);
        assert!(matches!(server.start(0, "not a host"), Err(ServerError::InvalidArgument { .. })));
        assert!(!server.is_listening());
    }

    #[test]
    fn second_binding_is_refused() {
        let event_loop = EventLoop::virtual_time();
        let (server, _transport) = server_on(&event_loop);
        server.start(0, "127.0.0.1").unwrap();
        assert!(server.start(0, "127.0.0.1").unwrap_err().is_protocol_state());
    }

    #[test]
    fn transport_bind_failure_propagates() {
        let event_loop = EventLoop::virtual_time();
        let mut transport = MockTransport::new();
        transport.expect_bind().returning(|addr, _| Err(TransportError::AddressInUse { addr }));
        transport.expect_unbind().never();

        let server = HttpServer::new(&event_loop, transport);
        let err = server.start(80, "127.0.0.1").unwrap_err();
        assert_eq!(err.to_string(), "transport error: address 127.0.0.1:80 already in use");
        assert!(!server.is_listening());
        server.close();
    }

    #[test]
    fn close_unbinds_once() {
        let event_loop = EventLoop::virtual_time();
        let mut transport = MockTransport::new();
        transport.expect_bind().times(1).returning(|addr, _| Ok(addr));
        transport.expect_unbind().times(1).return_const(());

        let server = HttpServer::new(&event_loop, transport);
        server.start(9000, "127.0.0.1").unwrap();
        server.close();
        server.close();
        assert!(server.closed().is_settled());
    }

    #[test]
    fn unhandled_http_gets_not_found() {
        let event_loop = EventLoop::virtual_time();
        let (server, transport) = server_on(&event_loop);
        server.start(0, "127.0.0.1").unwrap();

        let response = transport.connect_http(FakeRequest::get("/nothing")).unwrap();
        assert_eq!(response.to_string(), "404:Not Found:{Content-Type=text/plain; charset=utf-8,Content-Length=9}:Not Found");
    }

    #[test]
    fn handler_runs_on_the_loop() {
        let event_loop = EventLoop::virtual_time();
        let (server, transport) = server_on(&event_loop);
        server.http_handler(make_handler(|request: Request| async move {
            let body = request.read_body().await?;
            request.add_header("X-Path", request.path())?;
            request.end_with(body)?;
            Ok::<_, ServerError>(())
        }));
        server.start(0, "127.0.0.1").unwrap();

        let response = transport.connect_http(FakeRequest::post("/echo").body("ping")).unwrap();
        assert!(!response.is_ended());
        event_loop.run_until_stalled();
        assert_eq!(response.to_string(), "200:OK:{X-Path=/echo,Content-Length=4}:ping");
    }

    #[test]
    fn failing_handler_yields_internal_server_error() {
        let event_loop = EventLoop::virtual_time();
        let (server, transport) = server_on(&event_loop);
        server.http_handler(make_handler(|request: Request| async move {
            request.add_header("X-Partial", "1")?;
            Err::<(), _>(ServerError::invalid_argument("boom"))
        }));
        server.start(0, "127.0.0.1").unwrap();

        let response = transport.connect_http(FakeRequest::get("/")).unwrap();
        event_loop.run_until_stalled();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.body(), Bytes::from_static(b"Internal Server Error"));
    }

    #[test]
    fn failing_handler_after_headers_only_ends_the_response() {
        let event_loop = EventLoop::virtual_time();
        let (server, transport) = server_on(&event_loop);
        server.http_handler(make_handler(|request: Request| async move {
            request.write("partial")?;
            Err::<(), _>(ServerError::invalid_argument("boom"))
        }));
        server.start(0, "127.0.0.1").unwrap();

        let response = transport.connect_http(FakeRequest::get("/")).unwrap();
        event_loop.run_until_stalled();
        assert_eq!(response.to_string(), "200:OK:{}:partial");
        assert!(response.is_ended());
    }

    #[test]
    fn handler_may_finish_the_response_later() {
        let event_loop = EventLoop::virtual_time();
        let (server, transport) = server_on(&event_loop);
        let el = event_loop.clone();
        server.http_handler(make_handler(move |request: Request| {
            let el = el.clone();
            async move {
                request.write("tick ")?;
                el.sleep(Duration::from_millis(100)).await?;
                request.write("done")?;
                request.end()?;
                Ok::<_, ServerError>(())
            }
        }));
        server.start(0, "127.0.0.1").unwrap();

        let response = transport.connect_http(FakeRequest::get("/slow")).unwrap();
        event_loop.run_until_stalled();
        assert!(!response.is_ended());
        event_loop.run();
        assert_eq!(event_loop.now(), Duration::from_millis(100));
        assert_eq!(response.body(), Bytes::from_static(b"tick done"));
    }

    #[test]
    fn unhandled_websocket_is_rejected() {
        let event_loop = EventLoop::virtual_time();
        let (server, transport) = server_on(&event_loop);
        server.start(0, "127.0.0.1").unwrap();

        let peer = transport.connect_websocket(RequestHeader::new(http::Method::GET, "/ws").unwrap()).unwrap();
        assert!(peer.was_rejected());
    }

    #[test]
    fn all_handler_sees_both_kinds() {
        let event_loop = EventLoop::virtual_time();
        let (server, transport) = server_on(&event_loop);
        server.all_handler(make_handler(|exchange: Exchange| async move {
            match exchange {
                Exchange::Http(request) => request.end_with("http")?,
                Exchange::WebSocket(ws) => ws.send_text("ws")?,
            }
            Ok::<_, ServerError>(())
        }));
        server.start(0, "127.0.0.1").unwrap();

        let response = transport.connect_http(FakeRequest::get("/")).unwrap();
        let peer = transport.connect_websocket(RequestHeader::new(http::Method::GET, "/ws").unwrap()).unwrap();
        event_loop.run_until_stalled();
        assert_eq!(response.body(), Bytes::from_static(b"http"));
        assert_eq!(peer.received(), vec![crate::WsMessage::Text(String::from("ws"))]);
    }

    #[test]
    fn websocket_echo_until_peer_closes() {
        let event_loop = EventLoop::virtual_time();
        let (server, transport) = server_on(&event_loop);
        server.websocket_handler(make_handler(|ws: WsRequest| async move {
            use futures::StreamExt;
            let mut messages = ws.text_message_stream();
            while let Some(text) = messages.next().await {
                ws.send_text_safe(&text?.to_uppercase());
            }
            Ok::<_, AsyncError>(())
        }));
        server.start(0, "127.0.0.1").unwrap();

        let peer = transport.connect_websocket(RequestHeader::new(http::Method::GET, "/echo").unwrap()).unwrap();
        event_loop.run_until_stalled();
        peer.send_text("hi");
        event_loop.run_until_stalled();
        peer.send_text("again");
        event_loop.run_until_stalled();
        peer.close();
        event_loop.run_until_stalled();

        let received: Vec<_> = peer.received().into_iter().filter_map(|m| m.as_text().map(str::to_owned)).collect();
        assert_eq!(received, vec!["HI", "AGAIN"]);
        assert_eq!(event_loop.pending_tasks(), 0);
    }

    #[test]
    fn websocket_messages_sent_before_the_handler_runs_are_kept() {
        let event_loop = EventLoop::virtual_time();
        let (server, transport) = server_on(&event_loop);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        server.websocket_handler(make_handler(move |ws: WsRequest| {
            let sink = Rc::clone(&sink);
            async move {
                use futures::StreamExt;
                let mut messages = ws.text_message_stream();
                while let Some(text) = messages.next().await {
                    sink.borrow_mut().push(text?);
                }
                Ok::<_, AsyncError>(())
            }
        }));
        server.start(0, "127.0.0.1").unwrap();

        let peer = transport.connect_websocket(RequestHeader::new(http::Method::GET, "/early").unwrap()).unwrap();
        peer.send_text("first");
        event_loop.run_until_stalled();
        peer.send_text("second");
        peer.close();
        event_loop.run_until_stalled();

        assert_eq!(*seen.borrow(), vec!["first", "second"]);
        assert_eq!(event_loop.pending_tasks(), 0);
    }

    #[test]
    fn closed_server_refuses_exchanges() {
        let event_loop = EventLoop::virtual_time();
        let (server, transport) = server_on(&event_loop);
        server.start(0, "127.0.0.1").unwrap();
        server.close();
        assert!(matches!(transport.connect_http(FakeRequest::get("/")), Err(TransportError::NotListening)));
    }
}
