//! Transport boundary: an opaque duplex byte stream plus a way to open one.

use super::endpoint::Endpoint;
use futures_util::future::BoxFuture;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{error, info};

/// TCP connection timeout for the component listener.
///
/// Without this the OS default applies, which on some platforms is 30-120 seconds for
/// unreachable hosts. 15 seconds is generous for high-latency links but still gives
/// timely failure feedback.
pub const TCP_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// A connected byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Opens transports. The component calls it once per (re)connection attempt.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<Box<dyn Transport>>>;
}

/// Plain TCP connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<Box<dyn Transport>>> {
        Box::pin(async move {
            let address = endpoint.to_string();
            let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&address))
                .await
                .map_err(|_| {
                    error!(
                        host = %endpoint.host, port = endpoint.port,
                        timeout_secs = TCP_CONNECT_TIMEOUT.as_secs(),
                        "TCP connect timed out"
                    );
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!(
                            "TCP connect timed out after {}s to {}",
                            TCP_CONNECT_TIMEOUT.as_secs(),
                            address
                        ),
                    )
                })?
                .map_err(|e| {
                    error!(
                        host = %endpoint.host, port = endpoint.port,
                        error = %e, error_kind = ?e.kind(),
                        "TCP connect failed"
                    );
                    e
                })?;
            stream.set_nodelay(true)?;
            info!(host = %endpoint.host, port = endpoint.port, "Connected (TCP)");
            Ok(Box::new(stream) as Box<dyn Transport>)
        })
    }
}
