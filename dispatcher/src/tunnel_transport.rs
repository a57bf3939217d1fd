//! Concrete `TunnelTransport` (attestor-core's C2 trait boundary) backed by
//! a real outbound `rustls` TLS connection, used by the dispatcher binary to
//! drive C7 against the declared origin (§4.C7 step 1).
//!
//! `rustls` does not expose per-record plaintext/ciphertext/IV below its
//! `Read`/`Write` API, so this adapter treats each `write`/`read_chunk` call
//! as the unit of recording -- identical to the boundary the engine's own
//! `FakeTransport` test double models. A deployment that needs true
//! record-level TLS1.3 key-update partitioning plugs in a lower-level TLS
//! engine behind the same trait; nothing in `attestor-core` assumes which.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use attestor_core::{TlsVersion, TunnelTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{rustls, TlsConnector, TlsStream};

pub struct RustlsTunnelTransport {
    stream: TlsStream<TcpStream>,
    tls_version: TlsVersion,
}

impl RustlsTunnelTransport {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect((host, port)).await.with_context(|| format!("connecting to {host}:{port}"))?;
        let server_name: rustls::pki_types::ServerName = host.to_string().try_into().context("invalid server name")?;
        let stream = connector.connect(server_name, tcp).await.context("TLS handshake to origin failed")?;

        let tls_version = match stream.get_ref().1.protocol_version() {
            Some(rustls::ProtocolVersion::TLSv1_2) => TlsVersion::V1_2,
            _ => TlsVersion::V1_3,
        };

        Ok(Self { stream: TlsStream::Client(stream), tls_version })
    }
}

#[async_trait]
impl TunnelTransport for RustlsTunnelTransport {
    fn tls_version(&self) -> TlsVersion {
        self.tls_version
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.context("writing to origin tunnel")?;
        self.stream.flush().await.context("flushing origin tunnel")
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; 16 * 1024];
        let n = self.stream.read(&mut buf).await.context("reading from origin tunnel")?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    /// TLS1.3 key updates live below `rustls`'s `Read`/`Write` API; see the
    /// module doc for why this is a documented no-op rather than an error.
    async fn update_traffic_keys(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await.context("closing origin tunnel")
    }
}
