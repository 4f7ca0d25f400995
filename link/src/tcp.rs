//! TCP connector for FallWatch
//!
//! Speaks newline-delimited JSON frames over a plain TCP stream.

use crate::{frame, Connector, Link, LinkError};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Longest accepted frame line, newline excluded
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

enum Line {
    Complete,
    Oversized,
    Eof,
}

/// Read one newline-terminated line into `buf`, never buffering more than
/// [`MAX_FRAME_BYTES`]. An oversized line is consumed up to its newline and
/// reported as [`Line::Oversized`].
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Line> {
    buf.clear();
    let n = (&mut *reader).take(MAX_FRAME_BYTES as u64 + 1).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() == Some(&b'\n') || buf.len() <= MAX_FRAME_BYTES {
        return Ok(Line::Complete);
    }

    loop {
        buf.clear();
        let n = (&mut *reader).take(MAX_FRAME_BYTES as u64).read_until(b'\n', buf).await?;
        if n == 0 || buf.last() == Some(&b'\n') {
            break;
        }
    }
    buf.clear();
    Ok(Line::Oversized)
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &buf[..end]
}

/// Connects to a live-data source over TCP
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: &str) -> Self {
        Self { addr: addr.to_string() }
    }
}

impl Connector for TcpConnector {
    fn endpoint(&self) -> &str {
        &self.addr
    }

    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Link, LinkError>> + Send + '_>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| LinkError::ConnectFailed(format!("{}: {}", self.addr, e)))?;
            stream.set_nodelay(true)?;

            tracing::info!("TCP link open: {}", self.addr);

            let (read_half, mut write_half) = stream.into_split();
            let (link, mut outbound_rx, inbound_tx) = Link::pair();

            // Reader: one frame per line, malformed lines are passed up as errors
            let endpoint = self.addr.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(read_half);
                let mut buf = Vec::with_capacity(1024);

                loop {
                    let item = match read_line(&mut reader, &mut buf).await {
                        Ok(Line::Complete) => match std::str::from_utf8(trim_line(&buf)) {
                            Ok(line) if line.trim().is_empty() => continue,
                            Ok(line) => frame::decode(line),
                            Err(e) => Err(LinkError::Decode(format!("invalid UTF-8: {}", e))),
                        },
                        Ok(Line::Oversized) => {
                            tracing::warn!("Dropping frame over {} bytes from {}", MAX_FRAME_BYTES, endpoint);
                            Err(LinkError::Decode(format!("frame exceeds {} bytes", MAX_FRAME_BYTES)))
                        }
                        Ok(Line::Eof) => {
                            tracing::info!("TCP link closed by remote: {}", endpoint);
                            break;
                        }
                        Err(e) => {
                            let _ = inbound_tx.send(Err(LinkError::Io(e))).await;
                            break;
                        }
                    };

                    if inbound_tx.send(item).await.is_err() {
                        break;
                    }
                }
            });

            // Writer: exits when the local side drops the outbound sender
            tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    let line = match frame::encode(&frame) {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::error!("Failed to encode {} frame: {}", frame.kind(), e);
                            continue;
                        }
                    };

                    if let Err(e) = write_half.write_all(line.as_bytes()).await {
                        tracing::warn!("TCP write failed: {}", e);
                        break;
                    }
                }
                let _ = write_half.shutdown().await;
            });

            Ok(link)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InboundFrame, OutboundFrame};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn exchanges_frames_with_a_line_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let first = lines.next_line().await.unwrap().unwrap();
            write_half.write_all(b"not a frame\n").await.unwrap();
            write_half.write_all(b"{\"type\":\"pong\",\"nonce\":1}\n").await.unwrap();
            first
        });

        let connector = TcpConnector::new(&addr);
        let mut link = connector.connect().await.unwrap();
        link.outbound.send(OutboundFrame::Ping { nonce: 1 }).await.unwrap();

        let malformed = link.inbound.recv().await.unwrap();
        assert!(matches!(malformed, Err(LinkError::Decode(_))));

        let pong = link.inbound.recv().await.unwrap().unwrap();
        assert_eq!(pong, InboundFrame::Pong { nonce: 1 });

        let received = server.await.unwrap();
        assert_eq!(received, r#"{"type":"ping","nonce":1}"#);

        // Remote closed the socket when the task ended
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn bad_bytes_and_oversized_lines_keep_the_link_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"\xff\xfe garbage\n").await.unwrap();
            let mut oversized = vec![b'a'; MAX_FRAME_BYTES + 10];
            oversized.push(b'\n');
            socket.write_all(&oversized).await.unwrap();
            socket.write_all(b"{\"type\":\"pong\",\"nonce\":7}\r\n").await.unwrap();
        });

        let mut link = TcpConnector::new(&addr).connect().await.unwrap();

        assert!(matches!(link.inbound.recv().await, Some(Err(LinkError::Decode(_)))));
        assert!(matches!(link.inbound.recv().await, Some(Err(LinkError::Decode(_)))));
        assert_eq!(link.inbound.recv().await.unwrap().unwrap(), InboundFrame::Pong { nonce: 7 });
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpConnector::new(&addr).connect().await;
        assert!(matches!(result, Err(LinkError::ConnectFailed(_))));
    }
}
