//! Request handlers.
//!
//! A handler receives one accepted exchange and runs as a task on the
//! server's event loop. Plain async closures become handlers through
//! [`make_handler`].
//!
//! ```no_run
//! use micro_server::handler::make_handler;
//! use micro_server::{Request, ServerError};
//!
//! let hello = make_handler(|request: Request| async move {
//!     request.add_header("Content-Type", "text/plain")?;
//!     request.end_with("hello")?;
//!     Ok::<_, ServerError>(())
//! });
//! # let _ = hello;
//! ```

use std::error::Error;
use std::rc::Rc;

use async_trait::async_trait;
use http::{HeaderMap, Uri};

use crate::protocol::ExchangeId;
use crate::{Request, WsRequest};

/// The error type handlers report failures with.
pub type HandlerError = Box<dyn Error + Send + Sync>;

#[async_trait(?Send)]
pub trait Handler<Req> {
    async fn call(&self, req: Req) -> Result<(), HandlerError>;
}

#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait(?Send)]
impl<Req, Err, F, Fut> Handler<Req> for HandlerFn<F>
where
    Req: 'static,
    F: Fn(Req) -> Fut,
    Err: Into<HandlerError>,
    Fut: Future<Output = Result<(), Err>> + 'static,
{
    async fn call(&self, req: Req) -> Result<(), HandlerError> {
        (self.f)(req).await.map_err(Into::into)
    }
}

pub fn make_handler<F, Req, Err, Ret>(f: F) -> HandlerFn<F>
where
    Err: Into<HandlerError>,
    Ret: Future<Output = Result<(), Err>>,
    F: Fn(Req) -> Ret,
{
    HandlerFn { f }
}

/// Either kind of accepted exchange, for handlers registered with
/// [`HttpServer::all_handler`](crate::HttpServer::all_handler).
#[derive(Debug, Clone)]
pub enum Exchange {
    Http(Request),
    WebSocket(WsRequest),
}

impl Exchange {
    pub fn id(&self) -> ExchangeId {
        match self {
            Exchange::Http(request) => request.id(),
            Exchange::WebSocket(request) => request.id(),
        }
    }

    pub fn uri(&self) -> &Uri {
        match self {
            Exchange::Http(request) => request.uri(),
            Exchange::WebSocket(request) => request.uri(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri().path()
    }

    pub fn headers(&self) -> &HeaderMap {
        match self {
            Exchange::Http(request) => request.headers(),
            Exchange::WebSocket(request) => request.headers(),
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Exchange::WebSocket(_))
    }
}

/// Routes one kind of exchange to a handler of [`Exchange`].
pub(crate) struct ExchangeAdapter {
    handler: Rc<dyn Handler<Exchange>>,
}

impl ExchangeAdapter {
    pub(crate) fn new(handler: Rc<dyn Handler<Exchange>>) -> Self {
        Self { handler }
    }
}

#[async_trait(?Send)]
impl Handler<Request> for ExchangeAdapter {
    async fn call(&self, req: Request) -> Result<(), HandlerError> {
        self.handler.call(Exchange::Http(req)).await
    }
}

#[async_trait(?Send)]
impl Handler<WsRequest> for ExchangeAdapter {
    async fn call(&self, req: WsRequest) -> Result<(), HandlerError> {
        self.handler.call(Exchange::WebSocket(req)).await
    }
}
