//! Wire transports. Each implementation decodes inbound traffic into whole
//! SIP messages and hands them to the signaling task through a channel; the
//! engine never reads sockets itself.

mod tcp;
mod tls;
mod udp;

pub use tcp::TcpTransport;
pub use tls::TlsTransport;
pub use udp::UdpTransport;

use crate::config::TransportKind;
use crate::error::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A decoded inbound message and where it came from.
pub type Inbound = (Bytes, SocketAddr);
pub type InboundSender = mpsc::UnboundedSender<Inbound>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;
    fn local_addr(&self) -> SocketAddr;
    /// Queue a message for the wire. Never blocks on the peer.
    async fn send(&self, data: Bytes, destination: SocketAddr) -> Result<()>;
}

/// Accumulates stream bytes and cuts them into SIP messages at the header
/// terminator plus Content-Length.
pub struct StreamFramer {
    buf: BytesMut,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_message(&mut self) -> Option<Bytes> {
        // Keep-alive CRLFs between messages are legal; skip them.
        while self.buf.starts_with(b"\r\n") {
            let _ = self.buf.split_to(2);
        }
        let header_end = find_header_end(&self.buf)?;
        let content_length = parse_content_length(&self.buf[..header_end]).unwrap_or(0);
        let total = header_end + content_length;
        if self.buf.len() < total {
            return None;
        }
        Some(self.buf.split_to(total).freeze())
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4)
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        if name == "content-length" || name == "l" {
            return value.trim().parse().ok();
        }
    }
    None
}

/// Drive one connected stream: write queued messages, frame inbound bytes.
/// Returns when the stream dies or the token fires.
pub(crate) async fn run_stream<S>(
    mut stream: S,
    out_rx: &mut mpsc::UnboundedReceiver<Bytes>,
    inbound: &InboundSender,
    peer: SocketAddr,
    token: &CancellationToken,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framer = StreamFramer::new();
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            maybe = out_rx.recv() => {
                match maybe {
                    Some(data) => stream.write_all(&data).await?,
                    None => return Ok(()),
                }
            }
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ));
                }
                framer.push(&buf[..n]);
                while let Some(message) = framer.next_message() {
                    if inbound.send((message, peer)).is_err() {
                        debug!("inbound channel closed, dropping stream");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE: &[u8] = b"MESSAGE sip:a@b SIP/2.0\r\nCall-ID: x\r\nContent-Length: 5\r\n\r\nhello";

    #[test]
    fn framer_cuts_message_with_body() {
        let mut framer = StreamFramer::new();
        framer.push(MESSAGE);
        let msg = framer.next_message().unwrap();
        assert_eq!(&msg[..], MESSAGE);
        assert!(framer.next_message().is_none());
    }

    #[test]
    fn framer_waits_for_full_body() {
        let mut framer = StreamFramer::new();
        let (head, tail) = MESSAGE.split_at(MESSAGE.len() - 3);
        framer.push(head);
        assert!(framer.next_message().is_none());
        framer.push(tail);
        assert!(framer.next_message().is_some());
    }

    #[test]
    fn framer_splits_pipelined_messages_and_keepalives() {
        let mut framer = StreamFramer::new();
        framer.push(b"\r\n\r\n");
        framer.push(MESSAGE);
        framer.push(MESSAGE);
        assert_eq!(&framer.next_message().unwrap()[..], MESSAGE);
        assert_eq!(&framer.next_message().unwrap()[..], MESSAGE);
        assert!(framer.next_message().is_none());
    }

    #[test]
    fn content_length_is_case_insensitive() {
        assert_eq!(
            parse_content_length(b"Via: x\r\ncontent-LENGTH:  12\r\n"),
            Some(12)
        );
        assert_eq!(parse_content_length(b"l: 3\r\n"), Some(3));
        assert_eq!(parse_content_length(b"Via: x\r\n"), None);
    }
}
