use super::{InboundSender, Transport};
use crate::config::TransportKind;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(
        addr: SocketAddr,
        inbound: InboundSender,
        token: CancellationToken,
    ) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        debug!(%local, "udp transport bound");

        let reader = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = reader.recv_from(&mut buf) => {
                        match received {
                            Ok((n, source)) => {
                                if n == 0 {
                                    continue;
                                }
                                let data = Bytes::copy_from_slice(&buf[..n]);
                                if inbound.send((data, source)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("udp recv error: {}", e);
                            }
                        }
                    }
                }
            }
            debug!("udp reader stopped");
        });

        Ok(Arc::new(Self { socket, local }))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn send(&self, data: Bytes, destination: SocketAddr) -> Result<()> {
        self.socket
            .send_to(&data, destination)
            .await
            .map_err(|e| Error::Network(format!("udp send to {}: {}", destination, e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn round_trip_between_two_sockets() {
        let token = CancellationToken::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), tx_a, token.clone())
            .await
            .unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), tx_b, token.clone())
            .await
            .unwrap();

        b.send(Bytes::from_static(b"OPTIONS sip:a@b SIP/2.0\r\n\r\n"), a.local_addr())
            .await
            .unwrap();
        let (data, source) = rx_a.recv().await.unwrap();
        assert!(data.starts_with(b"OPTIONS"));
        assert_eq!(source, b.local_addr());
        token.cancel();
    }
}
