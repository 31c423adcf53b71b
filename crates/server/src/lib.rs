//! Transport independent HTTP and WebSocket serving on top of `micro-async`
//!
//! This crate implements the server side lifecycle of HTTP requests and
//! WebSocket connections as state machines that a transport drives through
//! small capability traits.
//!
//! # Features
//!
//! - Response lifecycle enforced at runtime: status and headers only before
//!   the first write, headers flushed exactly once
//! - Inbound bodies and WebSocket messages as pull-based streams
//! - Additive WebSocket listeners with a close notification that fires once
//! - Handlers run as tasks on an [`EventLoop`](micro_async::EventLoop)
//! - An in-memory transport with recording doubles for tests
//!
//! # Example
//!
//! ```
//! use micro_async::EventLoop;
//! use micro_server::handler::make_handler;
//! use micro_server::transport::memory::{FakeRequest, MemoryTransport};
//! use micro_server::{HttpServer, Request, ServerError};
//!
//! let event_loop = EventLoop::virtual_time();
//! let transport = MemoryTransport::new();
//! let server = HttpServer::new(&event_loop, transport.clone());
//! server.http_handler(make_handler(|request: Request| async move {
//!     request.add_header("X-Test", "1")?;
//!     request.end_with("hello")?;
//!     Ok::<_, ServerError>(())
//! }));
//! server.start(0, "127.0.0.1").unwrap();
//!
//! let response = transport.connect_http(FakeRequest::get("/")).unwrap();
//! event_loop.run_until_stalled();
//! assert_eq!(response.to_string(), "200:OK:{X-Test=1,Content-Length=5}:hello");
//! ```
//!
//! # Architecture
//!
//! - [`server`]: [`HttpServer`], its builder and the [`Transport`](transport::Transport) seam
//! - [`request`]: the HTTP [`Request`] state machine
//! - [`websocket`]: the WebSocket [`WsRequest`]
//! - [`handler`]: handler traits and closure adapters
//! - [`transport`]: capability traits and the in-memory transport

mod error;
mod side_table;
mod utils;

pub mod handler;
pub mod protocol;
pub mod request;
pub mod server;
pub mod transport;
pub mod websocket;

pub use error::{ServerError, TransportError};
pub use request::{Request, Stage};
pub use server::{HttpServer, HttpServerBuilder};
pub use side_table::SideTable;
pub use websocket::{WsMessage, WsRequest};
