//! Accepted connection that is either plain TCP or TLS over TCP

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub enum ForwardingStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ForwardingStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ForwardingStream::Tls(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            ForwardingStream::Plain(s) => s,
            ForwardingStream::Tls(s) => s.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.tcp().set_nodelay(nodelay)
    }

    /// Whether the client presented a (verified) certificate chain
    pub fn has_client_certificate(&self) -> bool {
        match self {
            ForwardingStream::Plain(_) => false,
            ForwardingStream::Tls(s) => s
                .get_ref()
                .1
                .peer_certificates()
                .is_some_and(|chain| !chain.is_empty()),
        }
    }

    fn io(self: Pin<&mut Self>) -> Pin<&mut dyn Io> {
        match self.get_mut() {
            ForwardingStream::Plain(s) => Pin::new(s),
            ForwardingStream::Tls(s) => Pin::new(s.as_mut()),
        }
    }
}

impl AsyncRead for ForwardingStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.io().poll_read(cx, buf)
    }
}

impl AsyncWrite for ForwardingStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.io().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.io().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.io().poll_shutdown(cx)
    }
}
