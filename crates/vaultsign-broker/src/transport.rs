//! Transport port the broker drives.
//!
//! The USB gadget exposes a byte-oriented bidirectional pipe. Errors are
//! split into two classes: retryable conditions that endpoints produce
//! while (re)binding or while the host reopens the device, and fatal ones
//! that tear the broker down.

use async_trait::async_trait;
use std::io;
use thiserror::Error;

/// A cancellable, byte-oriented duplex pipe.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes. A return of `Ok(0)` means the peer
    /// briefly went away (treated like a retryable EOF by the broker).
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write a prefix of `buf`, returning the number of bytes accepted.
    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError>;
}

/// Transport failure, classified for the broker's retry policy.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transient condition; the caller should retry the operation.
    #[error("retryable transport error: {0}")]
    Retryable(#[source] io::Error),

    /// Unrecoverable; the broker shuts down.
    #[error("fatal transport error: {0}")]
    Fatal(#[source] io::Error),
}

impl TransportError {
    /// Classify a raw I/O error.
    ///
    /// USB endpoints bounce during (re)bind and host opens, so the usual
    /// endpoint errnos are retryable.
    pub fn classify(err: io::Error) -> Self {
        if is_retryable(&err) {
            TransportError::Retryable(err)
        } else {
            TransportError::Fatal(err)
        }
    }

    /// True for the retryable class.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Retryable(_))
    }
}

fn is_retryable(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::Interrupted
        | io::ErrorKind::TimedOut => return true,
        _ => {}
    }
    matches!(
        err.raw_os_error(),
        Some(
            libc::EAGAIN
                | libc::EINTR
                | libc::EIO
                | libc::ENODEV
                | libc::EPROTO
                | libc::ESHUTDOWN
                | libc::EBADMSG
                | libc::ETIMEDOUT
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        for errno in [
            libc::EAGAIN,
            libc::EINTR,
            libc::EIO,
            libc::ENODEV,
            libc::EPROTO,
            libc::ESHUTDOWN,
            libc::EBADMSG,
            libc::ETIMEDOUT,
        ] {
            let err = TransportError::classify(io::Error::from_raw_os_error(errno));
            assert!(err.is_retryable(), "errno {} should be retryable", errno);
        }

        let err = TransportError::classify(io::Error::from_raw_os_error(libc::EACCES));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_eof_kinds_are_retryable() {
        let err = TransportError::classify(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_broken_pipe_is_fatal() {
        let err = TransportError::classify(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(!err.is_retryable());
    }
}
