//! Transport creation seam.
//!
//! The client never opens sockets directly; it asks a [`Connector`]. Tests
//! inject connectors that count attempts or fail on purpose, and embedders
//! can route connections through whatever transport they need.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A factory that creates one transport per connection attempt.
pub trait Connector: Send + Sync + 'static {
    /// The byte stream produced by this connector.
    type Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a transport to the given peer.
    fn connect(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = io::Result<Self::Transport>> + Send;
}

/// The default [`Connector`]: plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    /// Create a TCP connector; `nodelay` disables Nagle's algorithm on
    /// every socket it opens.
    pub fn new(nodelay: bool) -> Self {
        Self { nodelay }
    }
}

impl Connector for TcpConnector {
    type Transport = TcpStream;

    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}
