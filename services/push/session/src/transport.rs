//! TCP and TLS transport for the broker connection.
//!
//! This module provides both plain TCP and TLS transport. The broker is always
//! reached over TLS in production; plain TCP is used against local brokers.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

/// Observed state of an idle socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamActivity {
    /// Bytes are waiting to be read
    Readable,
    /// Peer closed the connection
    Closed,
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Underlying TCP stream
    pub fn tcp_stream(&self) -> &TcpStream {
        match self {
            IoStream::Plain(stream) => stream,
            IoStream::TlsClient(stream) => stream.get_ref().0,
        }
    }

    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp_stream().peer_addr()
    }

    /// Wait until the socket is readable or the peer hangs up.
    ///
    /// Peeks at the raw TCP stream so no bytes are consumed; TLS records stay
    /// intact for whoever reads the stream next.
    pub async fn wait_for_activity(&self) -> std::io::Result<StreamActivity> {
        let mut probe = [0u8; 1];
        let read = self.tcp_stream().peek(&mut probe).await?;
        Ok(if read == 0 {
            StreamActivity::Closed
        } else {
            StreamActivity::Readable
        })
    }
}

/// Connect to a broker by host name and port
pub async fn connect_tcp(host: &str, port: u16) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// TLS transport layer for the broker connection
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;
    use tracing::{debug, info};

    /// Create a TLS client configuration trusting the public web PKI, plus
    /// any extra CA certificates given as PEM
    pub fn make_client_config(extra_ca_pem: Option<&str>) -> Result<ClientConfig> {
        info!("Creating TLS client configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(ca_pem) = extra_ca_pem {
            let ca_results: Result<Vec<_>, _> =
                rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
            let ca_certs = ca_results.context("Failed to parse CA certificates")?;

            if ca_certs.is_empty() {
                anyhow::bail!("No certificates found in CA bundle");
            }

            for ca_cert in ca_certs {
                roots
                    .add(CertificateDer::from(ca_cert))
                    .context("Failed to add CA certificate to root store")?;
            }
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        info!("TLS client configuration created successfully");
        Ok(config)
    }

    /// Perform the TLS handshake over an established TCP stream
    pub async fn connect_tls(
        config: Arc<ClientConfig>,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> Result<IoStream> {
        let peer_addr = tcp_stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!("Connecting via TLS to {} (SNI: {})", peer_addr, sni);

        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", sni))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {} (SNI: {})", peer_addr, sni))?;

        debug!("TLS connection established to {}", peer_addr);
        Ok(IoStream::TlsClient(tls_stream))
    }
}
