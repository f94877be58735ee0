//! Transport that can be upgraded to TLS in place

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Client connection, plain or TLS
pub enum ImapStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    /// Transient state while a handshake owns the inner stream
    Upgrading,
}

impl<S> ImapStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the TLS handshake over the plain stream. Any failure leaves the
    /// stream unusable and the connection must be dropped.
    pub async fn upgrade(self, acceptor: &TlsAcceptor) -> io::Result<Self> {
        match self {
            ImapStream::Plain(inner) => {
                let tls = acceptor.accept(inner).await?;
                Ok(ImapStream::Tls(Box::new(tls)))
            }
            ImapStream::Tls(_) => Err(io::Error::new(
                io::ErrorKind::Other,
                "TLS already active",
            )),
            ImapStream::Upgrading => Err(upgrading()),
        }
    }
}

fn upgrading() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream is being upgraded")
}

impl<S> AsyncRead for ImapStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            ImapStream::Upgrading => Poll::Ready(Err(upgrading())),
        }
    }
}

impl<S> AsyncWrite for ImapStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            ImapStream::Upgrading => Poll::Ready(Err(upgrading())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            ImapStream::Upgrading => Poll::Ready(Err(upgrading())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            ImapStream::Upgrading => Poll::Ready(Ok(())),
        }
    }
}
