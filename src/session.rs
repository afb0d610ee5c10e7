use std::{
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use russh::{
    ChannelStream, Disconnect,
    server::{Handle, Msg},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::http::TunnelDialer;

pub(crate) type SshTunnelStream = TunnelStream<ChannelStream<Msg>>;

// One registered forward: the server-side record created by a successful
// `tcpip-forward` request. Never mutated after creation; only the registry
// mapping around it changes.
pub(crate) struct TunnelSession {
    // Bind address requested by the client, verbatim.
    pub(crate) subdomain: String,
    // Username presented at SSH authentication. Informational only.
    pub(crate) user: String,
    // Bind port echoed back to the client (a requested 0 becomes 80).
    pub(crate) bind_port: u16,
    // Peer address of the owning SSH connection, its identity for teardown.
    pub(crate) peer: SocketAddr,
    pub(crate) created_at: DateTime<Local>,
    // Handle to the owning SSH connection, used to open tunneling channels.
    handle: Handle,
}

impl TunnelSession {
    pub(crate) fn new(
        subdomain: String,
        user: String,
        bind_port: u16,
        peer: SocketAddr,
        handle: Handle,
    ) -> Self {
        TunnelSession {
            subdomain,
            user,
            bind_port,
            peer,
            created_at: Local::now(),
            handle,
        }
    }

    /// Disconnects the SSH connection that owns this session.
    pub(crate) async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "".into(), "English".into())
            .await;
    }
}

#[async_trait]
impl TunnelDialer<SshTunnelStream> for TunnelSession {
    async fn dial(&self, ip: IpAddr, port: u16) -> color_eyre::Result<SshTunnelStream> {
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(
                self.subdomain.clone(),
                self.bind_port.into(),
                ip.to_string(),
                port.into(),
            )
            .await?;
        Ok(TunnelStream::new(channel.into_stream()))
    }
}

/// Byte stream over a single `forwarded-tcpip` channel, carrying exactly one
/// HTTP exchange. Deadline setters are accepted to satisfy the usual
/// connection shape, but are no-ops: SSH channels expose no per-channel
/// socket deadlines. The channel is closed by dropping the stream.
pub(crate) struct TunnelStream<S> {
    inner: S,
}

impl<S> TunnelStream<S> {
    pub(crate) fn new(inner: S) -> Self {
        TunnelStream { inner }
    }
}

#[allow(dead_code)]
impl<S> TunnelStream<S> {
    pub(crate) fn set_deadline(&self, _deadline: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn set_read_deadline(&self, _deadline: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn set_write_deadline(&self, _deadline: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TunnelStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TunnelStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
