//! Pool-owned connection wrapper.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use dep2p_core::{
    BandwidthCounter, ConnRealmContext, ConnType, Connection, DynConnection, DynStream, NodeId,
    PeerAddr, Stream, TransportError,
};

/// Which side initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by a listener.
    Inbound,
    /// Established by a dial.
    Outbound,
}

/// A connection owned by the engine's pool.
///
/// Wraps the raw transport connection with pool bookkeeping and optional
/// bandwidth accounting; everything else, including the realm context,
/// delegates to the inner connection.
pub struct SwarmConn {
    inner: DynConnection,
    direction: Direction,
    opened_at: Instant,
    bandwidth: Option<Arc<dyn BandwidthCounter>>,
}

impl std::fmt::Debug for SwarmConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmConn")
            .field("inner", &self.inner)
            .field("direction", &self.direction)
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

impl SwarmConn {
    /// Wrap a raw connection.
    pub fn new(
        inner: DynConnection,
        direction: Direction,
        bandwidth: Option<Arc<dyn BandwidthCounter>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            direction,
            opened_at: Instant::now(),
            bandwidth,
        })
    }

    fn wrap_stream(&self, stream: DynStream) -> DynStream {
        match &self.bandwidth {
            Some(counter) => Box::new(CountedStream {
                inner: stream,
                peer: self.inner.remote_peer(),
                counter: counter.clone(),
            }),
            None => stream,
        }
    }

    /// The raw transport connection.
    pub fn inner(&self) -> &DynConnection {
        &self.inner
    }

    /// Who initiated the connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// How long the connection has been in the pool.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

#[async_trait]
impl Connection for SwarmConn {
    fn remote_peer(&self) -> NodeId {
        self.inner.remote_peer()
    }

    fn remote_addr(&self) -> PeerAddr {
        self.inner.remote_addr()
    }

    fn conn_type(&self) -> ConnType {
        self.inner.conn_type()
    }

    async fn open_stream(&self, protocol: &str) -> Result<DynStream, TransportError> {
        let stream = self.inner.open_stream(protocol).await?;
        Ok(self.wrap_stream(stream))
    }

    async fn accept_stream(&self) -> Result<DynStream, TransportError> {
        let stream = self.inner.accept_stream().await?;
        Ok(self.wrap_stream(stream))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    async fn graceful_close(&self, timeout: Duration) -> Result<(), TransportError> {
        self.inner.graceful_close(timeout).await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn realm_context(&self) -> Option<ConnRealmContext> {
        self.inner.realm_context()
    }

    fn set_realm_context(&self, ctx: ConnRealmContext) {
        self.inner.set_realm_context(ctx);
    }
}

/// Stream wrapper reporting transferred bytes to the bandwidth counter.
struct CountedStream {
    inner: DynStream,
    peer: NodeId,
    counter: Arc<dyn BandwidthCounter>,
}

impl std::fmt::Debug for CountedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountedStream")
            .field("inner", &self.inner)
            .field("peer", &self.peer)
            .finish()
    }
}

impl Stream for CountedStream {
    fn protocol(&self) -> &str {
        self.inner.protocol()
    }
}

impl AsyncRead for CountedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let read = buf.filled().len() - before;
            if read > 0 {
                self.counter.log_recv(self.peer, read as u64);
            }
        }
        result
    }
}

impl AsyncWrite for CountedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &result {
            if *written > 0 {
                self.counter.log_sent(self.peer, *written as u64);
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
