//! The connector seam: how the client obtains a byte stream to a hub.
//!
//! Production code connects real TCP sockets; tests inject a
//! [`crate::virtual_net::VirtualConnector`] that hands out scripted in-memory
//! sockets instead.  The seam is an explicit factory passed to the session
//! constructor — there is no global socket substitution point.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A bidirectional byte stream to a hub.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Factory for hub connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Connection>>;
}

/// The production connector: plain TCP with Nagle disabled, since the
/// request/reply exchanges are small and latency-bound.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Connection>> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true).ok();
        debug!("tcp connection established to {host}:{port}");
        Ok(Box::new(stream))
    }
}
