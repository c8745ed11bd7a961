//! I/O forwarders.
//!
//! A forwarder listens on an ephemeral local port, holds one connection to a
//! destination, and multiplexes every client that connects onto that single
//! destination connection. Clients are the stdout/stderr relays of launched
//! processes: each opens with one stream-type byte and then sends raw output.
//!
//! # Frame Format
//!
//! ```text
//! +----------------------------+-------------+-------------------+
//! | Length (4 bytes, BE)       | Stream (1)  | Payload (Length)  |
//! +----------------------------+-------------+-------------------+
//! ```
//!
//! A frame with an empty payload marks the end of one client's stream.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::SinkExt;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{Decoder, Encoder, FramedWrite};
use tracing::{debug, info, warn};

/// Stream-type byte for standard output.
pub const STREAM_STDOUT: u8 = 1;

/// Stream-type byte for standard error.
pub const STREAM_STDERR: u8 = 2;

/// Maximum concurrently connected clients per forwarder.
pub const MAX_CLIENTS: usize = 64;

/// Largest payload accepted by the decoder.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Size of one read from a client.
const CHUNK_SIZE: usize = 4096;

/// Frames buffered between client readers and the destination writer.
const FRAME_QUEUE: usize = 256;

/// How long `create` waits for the destination to accept.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwarder errors.
#[derive(Debug, Error)]
pub enum ForwarderError {
    /// The target was not `host:port`.
    #[error("invalid forward target: {target}")]
    InvalidTarget {
        /// Rejected target.
        target: String,
    },

    /// The destination refused the connection.
    #[error("failed to connect to {dest}: {source}")]
    Connect {
        /// Destination address.
        dest: String,
        /// Underlying error.
        source: io::Error,
    },

    /// The destination did not answer in time.
    #[error("timed out connecting to {dest} after {timeout:?}")]
    Timeout {
        /// Destination address.
        dest: String,
        /// Configured limit.
        timeout: Duration,
    },

    /// The local listening socket could not be opened.
    #[error("failed to open forwarder port: {0}")]
    Bind(#[from] io::Error),
}

/// One chunk of client output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Whether this frame marks the end of a client stream.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Codec for the length-prefixed forwarder frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardFrameCodec;

impl Encoder<Frame> for ForwardFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u32::try_from(frame.payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame payload too large"))?;
        dst.reserve(5 + frame.payload.len());
        dst.put_u32(len);
        dst.put_u8(frame.stream);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for ForwardFrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        // Check BEFORE allocation.
        if len > MAX_FRAME_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {len} bytes exceeds maximum {MAX_FRAME_PAYLOAD} bytes"),
            ));
        }
        if src.len() < 5 + len {
            src.reserve(5 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let stream = src.get_u8();
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { stream, payload }))
    }
}

/// How a forwarder should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Stop accepting and exit once connected clients finish.
    Drain,
    /// Exit immediately.
    Abort,
}

#[derive(Debug)]
struct ForwarderHandle {
    dest: String,
    control: mpsc::UnboundedSender<StopMode>,
}

type Registry = Arc<Mutex<BTreeMap<u16, ForwarderHandle>>>;

/// Forwarders running on this node, keyed by local port.
#[derive(Debug, Clone)]
pub struct ForwarderRegistry {
    inner: Registry,
    connect_timeout: Duration,
}

impl Default for ForwarderRegistry {
    fn default() -> Self {
        Self {
            inner: Registry::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ForwarderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connects to `dest` (`host:port`), opens a local port and starts the
    /// relay. Returns the local port.
    ///
    /// # Errors
    ///
    /// Returns an error if `dest` is malformed, unreachable or silent for
    /// longer than the connect timeout, or the local port cannot be opened.
    pub async fn create(&self, dest: &str) -> Result<u16, ForwarderError> {
        let valid = dest
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid {
            return Err(ForwarderError::InvalidTarget {
                target: dest.to_string(),
            });
        }

        let destination = tokio::time::timeout(self.connect_timeout, TcpStream::connect(dest))
            .await
            .map_err(|_| ForwarderError::Timeout {
                dest: dest.to_string(),
                timeout: self.connect_timeout,
            })?
            .map_err(|source| ForwarderError::Connect {
                dest: dest.to_string(),
                source,
            })?;
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();

        let (control, control_rx) = mpsc::unbounded_channel();
        self.inner.lock().expect("lock poisoned").insert(
            port,
            ForwarderHandle {
                dest: dest.to_string(),
                control,
            },
        );
        info!(port, dest, "forwarder created");
        tokio::spawn(relay(
            listener,
            destination,
            control_rx,
            Arc::clone(&self.inner),
            port,
        ));
        Ok(port)
    }

    /// Signals the forwarder on `port` to stop. Returns `false` if there is
    /// none.
    pub fn stop(&self, port: u16, mode: StopMode) -> bool {
        let mut forwarders = self.inner.lock().expect("lock poisoned");
        match mode {
            StopMode::Abort => forwarders.remove(&port).is_some_and(|handle| {
                let _ = handle.control.send(StopMode::Abort);
                true
            }),
            StopMode::Drain => forwarders
                .get(&port)
                .is_some_and(|handle| handle.control.send(StopMode::Drain).is_ok()),
        }
    }

    /// Aborts every forwarder. Returns how many were stopped.
    pub fn abort_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.inner.lock().expect("lock poisoned"));
        for handle in drained.values() {
            let _ = handle.control.send(StopMode::Abort);
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "aborted all forwarders");
        }
        drained.len()
    }

    /// `(port, destination)` pairs, ordered by port.
    #[must_use]
    pub fn list(&self) -> Vec<(u16, String)> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(port, handle)| (*port, handle.dest.clone()))
            .collect()
    }

    /// `port:dest` entries joined by `,`.
    #[must_use]
    pub fn describe(&self) -> String {
        self.list()
            .iter()
            .map(|(port, dest)| format!("{port}:{dest}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn relay(
    listener: TcpListener,
    destination: TcpStream,
    mut control: mpsc::UnboundedReceiver<StopMode>,
    registry: Registry,
    port: u16,
) {
    let mut sink = FramedWrite::new(destination, ForwardFrameCodec);
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE);
    let mut clients: JoinSet<io::Result<()>> = JoinSet::new();
    let mut draining = false;

    let flush_remaining = loop {
        if draining && clients.is_empty() {
            break true;
        }
        tokio::select! {
            accepted = listener.accept(), if !draining => match accepted {
                Ok((stream, peer)) if clients.len() < MAX_CLIENTS => {
                    debug!(port, %peer, "forwarder client connected");
                    clients.spawn(read_client(stream, frame_tx.clone()));
                },
                Ok((_, peer)) => warn!(port, %peer, "forwarder full, rejecting client"),
                Err(e) => warn!(port, error = %e, "forwarder accept failed"),
            },
            Some(frame) = frame_rx.recv() => {
                if let Err(e) = sink.send(frame).await {
                    warn!(port, error = %e, "forwarder destination closed");
                    break false;
                }
            },
            Some(joined) = clients.join_next(), if !clients.is_empty() => {
                if let Ok(Err(e)) = joined {
                    debug!(port, error = %e, "forwarder client ended with error");
                }
            },
            mode = control.recv() => match mode {
                Some(StopMode::Drain) => {
                    debug!(port, clients = clients.len(), "forwarder draining");
                    draining = true;
                },
                Some(StopMode::Abort) | None => break false,
            },
        }
    };

    if flush_remaining {
        while let Ok(frame) = frame_rx.try_recv() {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    }
    clients.abort_all();
    if let Err(e) = SinkExt::<Frame>::close(&mut sink).await {
        debug!(port, error = %e, "closing forwarder destination");
    }
    registry.lock().expect("lock poisoned").remove(&port);
    info!(port, "forwarder stopped");
}

async fn read_client(mut stream: TcpStream, frames: mpsc::Sender<Frame>) -> io::Result<()> {
    let mut kind = [0u8; 1];
    if stream.read(&mut kind).await? == 0 {
        return Ok(());
    }
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    loop {
        buf.reserve(CHUNK_SIZE);
        let n = stream.read_buf(&mut buf).await?;
        let frame = Frame {
            stream: kind[0],
            payload: buf.split().freeze(),
        };
        if frames.send(frame).await.is_err() || n == 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    use super::*;

    #[test]
    fn codec_round_trip_and_partial_frames() {
        let mut codec = ForwardFrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame {
                    stream: STREAM_STDERR,
                    payload: Bytes::from_static(b"oops"),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..5], &[0, 0, 0, 4, 2]);

        let mut partial = buf.split_to(6);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.stream, STREAM_STDERR);
        assert_eq!(&frame.payload[..], b"oops");
    }

    #[test]
    fn decoder_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_u8(1);
        assert!(ForwardFrameCodec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn invalid_target_is_rejected() {
        let registry = ForwarderRegistry::new();
        assert!(matches!(
            registry.create("no-port").await,
            Err(ForwarderError::InvalidTarget { .. })
        ));
    }

    #[tokio::test]
    async fn multiplexes_clients_onto_destination() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap().to_string();

        let registry = ForwarderRegistry::new();
        let port = registry.create(&dest_addr).await.unwrap();
        let (dest_conn, _) = dest.accept().await.unwrap();
        let mut frames = FramedRead::new(dest_conn, ForwardFrameCodec);
        assert_eq!(registry.list(), vec![(port, dest_addr.clone())]);
        assert_eq!(registry.describe(), format!("{port}:{dest_addr}"));

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(&[STREAM_STDOUT]).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let mut payload = Vec::new();
        loop {
            let frame = frames.next().await.unwrap().unwrap();
            assert_eq!(frame.stream, STREAM_STDOUT);
            if frame.is_eof() {
                break;
            }
            payload.extend_from_slice(&frame.payload);
        }
        assert_eq!(payload, b"hello");

        assert!(registry.stop(port, StopMode::Drain));
        assert!(frames.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_empty());
        assert!(!registry.stop(port, StopMode::Abort));
    }

    #[tokio::test]
    async fn abort_all_clears_registry() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap().to_string();
        let registry = ForwarderRegistry::new();
        registry.create(&dest_addr).await.unwrap();
        registry.create(&dest_addr).await.unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.abort_all(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unreachable_destination_fails() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap().to_string();
        drop(unused);
        let registry = ForwarderRegistry::new();
        assert!(matches!(
            registry.create(&addr).await,
            Err(ForwarderError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn silent_destination_gives_up() {
        let registry = ForwarderRegistry::new().with_connect_timeout(Duration::from_millis(200));
        // TEST-NET-1 is never routed, so the connect either hangs or fails.
        let result = tokio::time::timeout(Duration::from_secs(5), registry.create("192.0.2.1:9"))
            .await
            .expect("create should not outlive its connect timeout");
        assert!(matches!(
            result,
            Err(ForwarderError::Timeout { .. } | ForwarderError::Connect { .. })
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn drain_waits_for_connected_clients() {
        let dest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap().to_string();
        let registry = ForwarderRegistry::new();
        let port = registry.create(&dest_addr).await.unwrap();
        let (dest_conn, _) = dest.accept().await.unwrap();
        let mut frames = FramedRead::new(dest_conn, ForwardFrameCodec);

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(&[STREAM_STDERR]).await.unwrap();
        client.write_all(b"early").await.unwrap();
        let mut payload = Vec::new();
        while payload.len() < 5 {
            let frame = frames.next().await.unwrap().unwrap();
            assert_eq!(frame.stream, STREAM_STDERR);
            payload.extend_from_slice(&frame.payload);
        }
        assert_eq!(payload, b"early");

        assert!(registry.stop(port, StopMode::Drain));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.len(), 1);

        client.write_all(b"late").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let mut payload = Vec::new();
        loop {
            let frame = frames.next().await.unwrap().unwrap();
            if frame.is_eof() {
                break;
            }
            payload.extend_from_slice(&frame.payload);
        }
        assert_eq!(payload, b"late");
        assert!(frames.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_empty());
    }
}
