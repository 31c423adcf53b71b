//! Transports deliver accepted exchanges to an [`HttpServer`](crate::HttpServer).
//!
//! A transport implements [`Transport`] to be bound by a server, and
//! [`HttpExchange`] / [`WsConnection`] for the outbound side of each exchange
//! it accepts. Inbound data flows back through the [`BodySink`] and
//! [`WsEvents`] the [`Acceptor`] returns.

pub mod memory;

pub use crate::request::{BodySink, HttpExchange};
pub use crate::server::{Acceptor, Transport};
pub use crate::websocket::{WsConnection, WsEvents};
