use super::{run_stream, InboundSender, Transport};
use crate::config::TransportKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CEILING: Duration = Duration::from_secs(30);

/// TLS client connection to the signaling server, same shape as the TCP
/// transport with a rustls handshake on top. Trust anchors come from the
/// CA bundle named in the configuration.
pub struct TlsTransport {
    server: SocketAddr,
    local: Arc<Mutex<SocketAddr>>,
    out_tx: mpsc::UnboundedSender<Bytes>,
}

impl TlsTransport {
    pub async fn connect(
        server: SocketAddr,
        server_name: String,
        ca_file: &str,
        inbound: InboundSender,
        token: CancellationToken,
    ) -> Result<Arc<Self>> {
        let connector = build_connector(ca_file)?;
        let name = ServerName::try_from(server_name.clone())
            .map_err(|e| Error::Network(format!("bad tls server name {}: {}", server_name, e)))?;

        let stream = dial(server, &connector, &name).await?;
        let local = Arc::new(Mutex::new(stream.get_ref().0.local_addr()?));
        info!(%server, server_name, "tls transport connected");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        let shared_local = local.clone();
        tokio::spawn(async move {
            let mut current = Some(stream);
            let mut backoff = RECONNECT_BASE;
            loop {
                let stream = match current.take() {
                    Some(s) => s,
                    None => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        match dial(server, &connector, &name).await {
                            Ok(s) => {
                                backoff = RECONNECT_BASE;
                                if let Ok(addr) = s.get_ref().0.local_addr() {
                                    *shared_local.lock().unwrap() = addr;
                                }
                                info!(%server, "tls transport reconnected");
                                s
                            }
                            Err(e) => {
                                warn!("tls reconnect {}: {}", server, e);
                                backoff = std::cmp::min(backoff * 2, RECONNECT_CEILING);
                                continue;
                            }
                        }
                    }
                };
                match run_stream(stream, &mut out_rx, &inbound, server, &token).await {
                    Ok(()) => break,
                    Err(e) => warn!("tls stream error: {}", e),
                }
                if token.is_cancelled() {
                    break;
                }
            }
        });

        Ok(Arc::new(Self {
            server,
            local,
            out_tx,
        }))
    }
}

async fn dial(
    server: SocketAddr,
    connector: &TlsConnector,
    name: &ServerName<'static>,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(server)
        .await
        .map_err(|e| Error::Network(format!("tcp connect {}: {}", server, e)))?;
    connector
        .connect(name.clone(), tcp)
        .await
        .map_err(|e| Error::Network(format!("tls handshake with {}: {}", server, e)))
}

fn build_connector(ca_file: &str) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    let file = File::open(ca_file)
        .map_err(|e| Error::Network(format!("tls ca bundle {}: {}", ca_file, e)))?;
    let mut reader = BufReader::new(file);
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| Error::Network(format!("tls ca bundle {}: {}", ca_file, e)))?;
        roots
            .add(cert)
            .map_err(|e| Error::Network(format!("tls ca bundle {}: {}", ca_file, e)))?;
    }
    if roots.is_empty() {
        return Err(Error::Network(format!(
            "tls ca bundle {} holds no certificates",
            ca_file
        )));
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

#[async_trait]
impl Transport for TlsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    fn local_addr(&self) -> SocketAddr {
        *self.local.lock().unwrap()
    }

    async fn send(&self, data: Bytes, _destination: SocketAddr) -> Result<()> {
        self.out_tx
            .send(data)
            .map_err(|_| Error::Network(format!("tls connection to {} is gone", self.server)))
    }
}
