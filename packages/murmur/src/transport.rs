//! Physical transports. Both carry the same logical byte stream: raw TCP
//! directly, WebSocket as a sequence of binary frames bridged onto an
//! in-memory duplex pipe.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_tungstenite::tungstenite;
use tracing::debug;

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Size of the in-memory pipe behind a WebSocket connection.
const BRIDGE_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    /// Full `ws://` or `wss://` URL.
    WebSocket(String),
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(addr) = url.strip_prefix("tcp://") {
            if addr.is_empty() {
                bail!("missing address in {url}");
            }
            return Ok(Self::Tcp(addr.trim_end_matches('/').to_string()));
        }
        if url.starts_with("ws://") || url.starts_with("wss://") {
            return Ok(Self::WebSocket(url.to_string()));
        }
        bail!("unsupported server URL {url} (expected tcp:// or ws://)")
    }
}

pub async fn connect(endpoint: &Endpoint) -> Result<(BoxedRead, BoxedWrite)> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = tokio::net::TcpStream::connect(addr)
                .await
                .with_context(|| format!("failed to connect to {addr}"))?;
            stream.set_nodelay(true)?;
            let (read, write) = stream.into_split();
            Ok((Box::new(read), Box::new(write)))
        }
        Endpoint::WebSocket(url) => {
            let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .with_context(|| format!("failed to connect to {url}"))?;
            let io = bridge(ws, tungstenite::Message::Binary, |msg| match msg {
                tungstenite::Message::Binary(data) => Frame::Data(data),
                tungstenite::Message::Close(_) => Frame::Close,
                _ => Frame::Skip,
            });
            let (read, write) = tokio::io::split(io);
            Ok((Box::new(read), Box::new(write)))
        }
    }
}

pub(crate) enum Frame {
    Data(Bytes),
    Skip,
    Close,
}

/// Run a WebSocket as a byte stream. Returns the application's end of a
/// duplex pipe; a background task pumps bytes between the pipe and the
/// socket until either side closes.
pub(crate) fn bridge<S, M, E>(
    ws: S,
    wrap: fn(Bytes) -> M,
    unwrap: fn(M) -> Frame,
) -> DuplexStream
where
    S: Stream<Item = Result<M, E>> + Sink<M> + Send + Unpin + 'static,
    M: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (app, pump) = tokio::io::duplex(BRIDGE_BUFFER);
    let (mut pump_read, mut pump_write) = tokio::io::split(pump);
    let (mut sink, mut stream) = ws.split();

    let inbound = async move {
        while let Some(frame) = stream.next().await {
            match frame.map(unwrap) {
                Ok(Frame::Data(data)) => {
                    if pump_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Skip) => {}
                Ok(Frame::Close) => break,
                Err(e) => {
                    debug!("websocket read ended: {}", e);
                    break;
                }
            }
        }
        let _ = pump_write.shutdown().await;
    };

    let outbound = async move {
        let mut buf = vec![0u8; BRIDGE_BUFFER];
        loop {
            match pump_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = wrap(Bytes::copy_from_slice(&buf[..n]));
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    };

    tokio::spawn(async move {
        tokio::select! {
            _ = inbound => {}
            _ = outbound => {}
        }
    });

    app
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoints() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:4790").unwrap(),
            Endpoint::Tcp("127.0.0.1:4790".into())
        );
        assert_eq!(
            Endpoint::parse("ws://chat.example.org:4791/ws").unwrap(),
            Endpoint::WebSocket("ws://chat.example.org:4791/ws".into())
        );
        assert!(Endpoint::parse("tcp://").is_err());
        assert!(Endpoint::parse("http://example.org").is_err());
    }

    #[tokio::test]
    async fn bridge_carries_bytes_both_ways() {
        // A channel pair stands in for the socket: frames the app writes
        // show up on `to_peer`, frames pushed on `from_peer` reach the app.
        let (to_peer_tx, mut to_peer) = futures::channel::mpsc::unbounded::<Bytes>();
        let (from_peer_tx, from_peer) = futures::channel::mpsc::unbounded::<Result<Bytes, String>>();
        let sink = to_peer_tx.sink_map_err(|e| e.to_string());
        let ws = Duplex { sink, stream: from_peer };

        let mut io = bridge(ws, |b| b, Frame::Data);

        io.write_all(b"hello").await.unwrap();
        io.flush().await.unwrap();
        let frame = to_peer.next().await.unwrap();
        assert_eq!(&frame[..], b"hello");

        from_peer_tx.unbounded_send(Ok(Bytes::from_static(b"world"))).unwrap();
        drop(from_peer_tx);
        let mut got = Vec::new();
        io.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"world");
    }

    /// Glue a sink and a stream into one value, the shape a WebSocket has.
    struct Duplex<Si, St> {
        sink: Si,
        stream: St,
    }

    impl<Si: Unpin, St: Stream + Unpin> Stream for Duplex<Si, St> {
        type Item = St::Item;
        fn poll_next(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Self::Item>> {
            self.stream.poll_next_unpin(cx)
        }
    }

    impl<Si: Sink<Bytes> + Unpin, St: Unpin> Sink<Bytes> for Duplex<Si, St> {
        type Error = Si::Error;
        fn poll_ready(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            self.sink.poll_ready_unpin(cx)
        }
        fn start_send(mut self: std::pin::Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
            self.sink.start_send_unpin(item)
        }
        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            self.sink.poll_flush_unpin(cx)
        }
        fn poll_close(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            self.sink.poll_close_unpin(cx)
        }
    }
}
