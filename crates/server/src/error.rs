use std::io;
use std::net::SocketAddr;

use micro_async::AsyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("protocol state error: {reason}")]
    ProtocolState { reason: &'static str },

    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: TransportError,
    },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("async error: {source}")]
    Async {
        #[from]
        source: AsyncError,
    },
}

impl ServerError {
    pub fn protocol_state(reason: &'static str) -> Self {
        Self::ProtocolState { reason }
    }

    pub fn headers_already_sent() -> Self {
        Self::protocol_state("headers already sent")
    }

    pub fn response_ended() -> Self {
        Self::protocol_state("response already ended")
    }

    pub fn invalid_argument<S: ToString>(str: S) -> Self {
        Self::InvalidArgument { reason: str.to_string() }
    }

    pub fn is_protocol_state(&self) -> bool {
        matches!(self, Self::ProtocolState { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Lets server calls be awaited inside loop tasks with `?`.
impl From<ServerError> for AsyncError {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::Async { source } => source,
            ServerError::InvalidArgument { reason } => AsyncError::InvalidArgument { reason },
            other => AsyncError::failed(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("server is not listening")]
    NotListening,

    #[error("address {addr} already in use")]
    AddressInUse { addr: SocketAddr },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl TransportError {
    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
