use super::{run_stream, InboundSender, Transport};
use crate::config::TransportKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CEILING: Duration = Duration::from_secs(30);

/// One persistent client connection to the signaling server. Outbound
/// messages are queued through a channel so the signaling task never waits
/// on the socket; a broken connection is redialed with backoff.
pub struct TcpTransport {
    server: SocketAddr,
    local: Arc<Mutex<SocketAddr>>,
    out_tx: mpsc::UnboundedSender<Bytes>,
}

impl TcpTransport {
    pub async fn connect(
        server: SocketAddr,
        inbound: InboundSender,
        token: CancellationToken,
    ) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(server)
            .await
            .map_err(|e| Error::Network(format!("tcp connect {}: {}", server, e)))?;
        let local = Arc::new(Mutex::new(stream.local_addr()?));
        info!(%server, local = %stream.local_addr()?, "tcp transport connected");

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
                        match TcpStream::connect(server).await {
                            Ok(s) => {
                                backoff = RECONNECT_BASE;
                                if let Ok(addr) = s.local_addr() {
                                    *shared_local.lock().unwrap() = addr;
                                }
                                info!(%server, "tcp transport reconnected");
                                s
                            }
                            Err(e) => {
                                warn!("tcp reconnect {}: {}", server, e);
                                backoff = std::cmp::min(backoff * 2, RECONNECT_CEILING);
                                continue;
                            }
                        }
                    }
                };
                match run_stream(stream, &mut out_rx, &inbound, server, &token).await {
                    Ok(()) => break,
                    Err(e) => warn!("tcp stream error: {}", e),
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

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        *self.local.lock().unwrap()
    }

    async fn send(&self, data: Bytes, _destination: SocketAddr) -> Result<()> {
        // Connected transport: everything rides the server connection.
        self.out_tx
            .send(data)
            .map_err(|_| Error::Network(format!("tcp connection to {} is gone", self.server)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn sends_and_receives_framed_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            // Echo a response back over the same connection.
            stream
                .write_all(b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            buf.truncate(n);
            buf
        });

        let transport = TcpTransport::connect(server_addr, inbound_tx, token.clone())
            .await
            .unwrap();
        transport
            .send(
                Bytes::from_static(b"OPTIONS sip:s SIP/2.0\r\nContent-Length: 0\r\n\r\n"),
                server_addr,
            )
            .await
            .unwrap();

        let received = accept.await.unwrap();
        assert!(received.starts_with(b"OPTIONS"));
        let (response, source) = inbound_rx.recv().await.unwrap();
        assert!(response.starts_with(b"SIP/2.0 200 OK"));
        assert_eq!(source, server_addr);
        token.cancel();
    }
}
