//! Outbound delivery of a single frame to a single endpoint.
//!
//! [`TcpTransport`] opens a fresh connection per frame, writes it, and closes
//! the connection.  There is no acknowledgement and no retry: a frame is
//! delivered at most once.

use std::time::Duration;

use async_trait::async_trait;
use fleetlink_types::{DeliveryError, Endpoint};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Bounded waits applied to every network operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Maximum time to establish an outbound connection.
    pub connect: Duration,
    /// Maximum time to write and flush one outbound frame.
    pub send: Duration,
    /// Maximum time an inbound connection may take to deliver its frame.
    pub read: Duration,
    /// Maximum time the listener waits for in-flight connections on shutdown.
    pub drain: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(3),
            send: Duration::from_secs(3),
            read: Duration::from_secs(5),
            drain: Duration::from_secs(2),
        }
    }
}

/// Delivers one already-encoded frame to one endpoint.
///
/// Implementations must treat every call independently: a failure for one
/// endpoint must not affect later calls for other endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, endpoint: &Endpoint, frame: &[u8]) -> Result<(), DeliveryError>;
}

/// Connect-send-close TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeouts: Timeouts) -> Self {
        Self {
            connect_timeout: timeouts.connect,
            send_timeout: timeouts.send,
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Timeouts::default())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn deliver(&self, endpoint: &Endpoint, frame: &[u8]) -> Result<(), DeliveryError> {
        let connect = TcpStream::connect((endpoint.address.as_str(), endpoint.port));
        let mut stream = match timeout(self.connect_timeout, connect).await {
            Err(_) => return Err(DeliveryError::Timeout(millis(self.connect_timeout))),
            Ok(Err(e)) => {
                return Err(DeliveryError::Connect {
                    endpoint: endpoint.to_string(),
                    details: e.to_string(),
                });
            }
            Ok(Ok(stream)) => stream,
        };

        let send = async {
            stream.write_all(frame).await?;
            stream.shutdown().await
        };
        match timeout(self.send_timeout, send).await {
            Err(_) => Err(DeliveryError::Timeout(millis(self.send_timeout))),
            Ok(Err(e)) => Err(DeliveryError::Io(e.to_string())),
            Ok(Ok(())) => Ok(()),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
