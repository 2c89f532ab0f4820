use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::time::Duration;

/// ConnectError separates "this candidate is gone, try the next one" from failures that say
/// something is wrong with us rather than with the candidate.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectError {
    #[error("Member @ {0} is unreachable: {1}")]
    Unreachable(SocketAddr, io::Error),
    #[error("Connect to {0} timed out")]
    TimedOut(SocketAddr),
    #[error("Unexpected failure connecting to {0}: {1}")]
    Fatal(SocketAddr, io::Error),
}

impl ConnectError {
    /// True if the caller should move on to the next succession candidate.
    pub(crate) fn is_retryable(&self) -> bool {
        !matches!(self, ConnectError::Fatal(..))
    }
}

pub(crate) async fn connect_with_timeout(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, ConnectError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            // Frames are small and latency matters more than throughput.
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(classify(addr, e)),
        Err(_elapsed) => Err(ConnectError::TimedOut(addr)),
    }
}

fn classify(addr: SocketAddr, e: io::Error) -> ConnectError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::TimedOut
        | io::ErrorKind::AddrNotAvailable => ConnectError::Unreachable(addr, e),
        _ => ConnectError::Fatal(addr, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        // Grab a free port, then close the listener so nothing is there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_with_timeout(addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_retryable(), "{:?}", err);
    }

    #[tokio::test]
    async fn connects_to_listening_member() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect_with_timeout(addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[test]
    fn unexpected_errors_are_fatal() {
        let addr = "127.0.0.1:1".parse().unwrap();
        let err = classify(addr, io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(!err.is_retryable());
    }
}
