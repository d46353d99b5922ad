//! Socket endpoint introspection and outbound connect.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

/// Default timeout applied to an outbound connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Address family of a socket end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    V4,
    V6,
}

impl std::fmt::Display for AddrFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddrFamily::V4 => write!(f, "ipv4"),
            AddrFamily::V6 => write!(f, "ipv6"),
        }
    }
}

/// Peer and local address of an established connection, resolved once at
/// accept time and cached by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub peer_ip: IpAddr,
    pub peer_port: u16,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub family: AddrFamily,
}

impl Endpoint {
    /// Resolve both ends of a connected TCP stream.
    pub fn from_tcp(stream: &TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        Ok(Self {
            peer_ip: peer.ip(),
            peer_port: peer.port(),
            local_ip: local.ip(),
            local_port: local.port(),
            family: if peer.is_ipv4() {
                AddrFamily::V4
            } else {
                AddrFamily::V6
            },
        })
    }

    pub fn peer(&self) -> String {
        format!("{}:{}", self.peer_ip, self.peer_port)
    }

    pub fn local(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }
}

/// Connect to `host:port`, trying every resolved candidate (IPv4 and IPv6)
/// with a per-attempt timeout. Returns the first stream that connects.
pub async fn connect_with_timeout(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err: Option<io::Error> = None;

    for candidate in lookup_host(addr).await? {
        match tokio::time::timeout(timeout, TcpStream::connect(candidate)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!(%candidate, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
            Err(_) => {
                debug!(%candidate, "connect attempt timed out");
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {candidate} timed out"),
                ));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {addr}"))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect_with_timeout(&addr.to_string(), CONNECT_TIMEOUT)
            .await
            .unwrap();
        let endpoint = Endpoint::from_tcp(&stream).unwrap();
        assert_eq!(endpoint.peer_port, addr.port());
        assert_eq!(endpoint.family, AddrFamily::V4);
        assert_eq!(endpoint.peer(), addr.to_string());
    }

    #[tokio::test]
    async fn refused_connect_reports_error() {
        // Bind then drop to find a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_with_timeout(&addr.to_string(), CONNECT_TIMEOUT).await;
        assert!(err.is_err());
    }
}
