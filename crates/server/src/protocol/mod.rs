//! Protocol level types shared by the request state machines and transports.
//!
//! - [`RequestHeader`]: the inbound request line and headers
//! - [`Headers`]: the ordered outbound header list of a response
//! - [`ExchangeId`]: identity of one accepted exchange

mod headers;
mod request;

pub use headers::{CONTENT_LENGTH, CONTENT_TYPE, Headers};
pub use request::RequestHeader;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use http::StatusCode;

/// Identifies one accepted HTTP or WebSocket exchange for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(u64);

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

impl ExchangeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The standard reason phrase for `status`, or an empty string for codes without one.
pub fn reason_phrase(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = ExchangeId::next();
        let b = ExchangeId::next();
        assert!(b > a);
        assert_eq!(format!("{a}"), format!("#{}", a.as_u64()));
    }

    #[test]
    fn standard_reason_phrases() {
        assert_eq!(reason_phrase(StatusCode::NOT_FOUND), "Not Found");
        assert_eq!(reason_phrase(StatusCode::OK), "OK");
        assert_eq!(reason_phrase(StatusCode::from_u16(599).unwrap()), "");
    }
}
