use std::io;
use std::net::IpAddr;

use thiserror::Error;

use crate::packet::IcmpKind;

/// Everything that can go wrong while watching a host. Resolution and
/// transport failures are fatal to starting a watcher; the rest are
/// per-cycle and reported through the error callback while the loop keeps
/// going.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("address resolution failed: {0}")]
    Resolve(String),

    #[error("opening icmp channel failed: {0}")]
    Transport(#[source] io::Error),

    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("read timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed reply: {0}")]
    Decode(String),

    #[error("got {kind} from {peer}, want echo reply")]
    UnexpectedReply { kind: IcmpKind, peer: IpAddr },
}

impl WatchError {
    /// Fatal errors abort startup; the caller never enters the probe loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WatchError::Resolve(_) | WatchError::Transport(_))
    }

    /// Map a receive failure, distinguishing an expired read deadline from
    /// other I/O trouble. Blocking sockets report an expired SO_RCVTIMEO as
    /// either WouldBlock or TimedOut depending on platform.
    pub(crate) fn from_recv(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => WatchError::Timeout,
            _ => WatchError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_errors_map_to_timeout() {
        let e = WatchError::from_recv(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(matches!(e, WatchError::Timeout));
        let e = WatchError::from_recv(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(e, WatchError::Timeout));
        let e = WatchError::from_recv(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(matches!(e, WatchError::Io(_)));
    }

    #[test]
    fn fatality_split() {
        assert!(WatchError::Resolve("x".into()).is_fatal());
        assert!(WatchError::Transport(io::Error::from(io::ErrorKind::PermissionDenied)).is_fatal());
        assert!(!WatchError::Timeout.is_fatal());
        assert!(!WatchError::ShortWrite { written: 1, expected: 2 }.is_fatal());
    }
}
