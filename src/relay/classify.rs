//! Closed-condition classification for transport errors.
//!
//! A read or write error either ends the connection ([`RelayError::ConnectionClosed`])
//! or is transient and the loop carries on ([`RelayError::TransientIo`]). The
//! transport hides its concrete error type behind `axum::Error`, so the
//! classifier walks the `source()` chain looking for an `io::Error` kind it
//! recognizes, and falls back to matching the error text.

use std::error::Error as StdError;
use std::io;

use axum::extract::ws::CloseFrame;
use tracing::warn;

use crate::error::RelayError;

/// Error text fragments that indicate the socket is gone.
const CLOSED_PATTERNS: &[&str] = &[
    "broken pipe",
    "reset by peer",
    "connection reset",
    "connection aborted",
    "unexpected eof",
    "use of closed network connection",
    "closed connection",
    "connection closed",
    "already closed",
    "sending after closing",
    "i/o timeout",
    "timed out",
];

/// Windows socket error codes that mean the connection is unusable.
#[cfg_attr(not(windows), allow(dead_code))]
const WSA_CLOSED_CODES: &[i32] = &[
    10013, // WSAEACCES
    10035, // WSAEWOULDBLOCK
    10039, // WSAEDESTADDRREQ
    10040, // WSAEMSGSIZE
    10050, // WSAENETDOWN
    10051, // WSAENETUNREACH
    10052, // WSAENETRESET
    10053, // WSAECONNABORTED
    10054, // WSAECONNRESET
    10058, // WSAESHUTDOWN
    10060, // WSAETIMEDOUT
    10064, // WSAEHOSTDOWN
    10065, // WSAEHOSTUNREACH
    10091, // WSASYSNOTREADY
    10101, // WSAEDISCON
];

/// Whether `err` (or anything in its source chain) indicates a closed socket.
pub fn is_closed(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_kind_is_closed(io_err) {
                return true;
            }
        }
        let text = e.to_string().to_ascii_lowercase();
        if CLOSED_PATTERNS.iter().any(|p| text.contains(p)) {
            return true;
        }
        current = e.source();
    }
    false
}

fn io_kind_is_closed(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    #[cfg(windows)]
    if let Some(code) = err.raw_os_error() {
        if WSA_CLOSED_CODES.contains(&code) {
            warn!(code, error = %err, "windows socket error");
            return true;
        }
    }
    false
}

/// Turn a transport error into the relay taxonomy.
pub fn classify(err: &(dyn StdError + 'static)) -> RelayError {
    if is_closed(err) {
        RelayError::ConnectionClosed(err.to_string())
    } else {
        warn!(error = %err, "unclassified transport error");
        RelayError::TransientIo(err.to_string())
    }
}

/// Describe a received close frame as a terminal error.
pub fn close_frame_error(frame: Option<&CloseFrame>) -> RelayError {
    match frame {
        Some(f) if f.reason.as_str().is_empty() => {
            RelayError::ConnectionClosed(format!("close {}", f.code))
        }
        Some(f) => RelayError::ConnectionClosed(format!("close {}: {}", f.code, f.reason.as_str())),
        None => RelayError::ConnectionClosed("close frame without status".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kinds_are_closed() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::TimedOut,
        ] {
            let err = io::Error::new(kind, "x");
            assert!(is_closed(&err), "{kind:?} should be closed");
        }
    }

    #[test]
    fn test_wrapped_io_error_is_found_through_source_chain() {
        let inner = io::Error::new(io::ErrorKind::ConnectionReset, "peer went away");
        let wrapped = axum::Error::new(inner);
        assert!(is_closed(&wrapped));
        assert!(matches!(classify(&wrapped), RelayError::ConnectionClosed(_)));
    }

    #[test]
    fn test_text_patterns_are_closed() {
        let err = axum::Error::new(io::Error::other("write: Broken Pipe"));
        assert!(is_closed(&err));
        let err = axum::Error::new(io::Error::other("Trying to work with closed connection"));
        assert!(is_closed(&err));
        let err = axum::Error::new(io::Error::other("read tcp: i/o timeout"));
        assert!(is_closed(&err));
    }

    #[test]
    fn test_unknown_error_is_transient() {
        let err = axum::Error::new(io::Error::other("invalid utf-8 sequence"));
        assert!(!is_closed(&err));
        assert!(matches!(classify(&err), RelayError::TransientIo(_)));
    }

    #[test]
    fn test_close_frame_description() {
        let frame = CloseFrame {
            code: 1000,
            reason: "bye".into(),
        };
        assert_eq!(
            close_frame_error(Some(&frame)),
            RelayError::ConnectionClosed("close 1000: bye".to_string())
        );
        assert!(close_frame_error(None).is_terminal());
    }
}
