//! Packet Forwarder
//!
//! Relays IP packets between the virtual interface and the secure channel
//! with two independent workers, one per direction. Both are joined before
//! [`PacketForwarder::run`] returns; the channel and interface are then
//! shut down and dropped exactly once.
//!
//! Two wire framings are supported:
//! - `raw`: one packet per write, no delimiters on the stream
//! - `length-prefixed`: 2-byte big-endian length before each packet

use std::fmt;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Largest packet the forwarder reads or writes in one operation
pub const MAX_PACKET_SIZE: usize = 2048;

/// Packet delimiting on the channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    Raw,
    LengthPrefixed,
}

/// Forwarding direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Interface to channel
    Outbound,
    /// Channel to interface
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "interface -> channel"),
            Direction::Inbound => write!(f, "channel -> interface"),
        }
    }
}

/// Why a worker stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The source returned end of stream
    SourceClosed,
    /// Shutdown was requested
    Cancelled,
    /// A read or write failed
    Failed(String),
}

/// Per-direction counters and exit cause
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub direction: Direction,
    pub packets: u64,
    pub bytes: u64,
    pub exit: WorkerExit,
}

impl WorkerReport {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            packets: 0,
            bytes: 0,
            exit: WorkerExit::Cancelled,
        }
    }

    fn record(&mut self, len: usize) {
        self.packets += 1;
        self.bytes += len as u64;
    }

    fn finish(mut self, exit: WorkerExit) -> Self {
        match &exit {
            WorkerExit::Failed(reason) => {
                tracing::warn!("Forwarding {} stopped: {}", self.direction, reason)
            }
            other => tracing::debug!("Forwarding {} stopped: {:?}", self.direction, other),
        }
        self.exit = exit;
        self
    }
}

/// Outcome of a forwarding session
#[derive(Debug, Clone)]
pub struct ForwardReport {
    pub outbound: WorkerReport,
    pub inbound: WorkerReport,
}

impl ForwardReport {
    /// The peer closed the channel
    pub fn peer_closed(&self) -> bool {
        self.inbound.exit == WorkerExit::SourceClosed
    }
}

/// Bidirectional relay between a packet device and a byte stream
#[derive(Debug, Clone)]
pub struct PacketForwarder {
    buffer_size: usize,
    framing: Framing,
}

impl PacketForwarder {
    pub fn new(framing: Framing) -> Self {
        Self {
            buffer_size: MAX_PACKET_SIZE,
            framing,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Forward until both workers exit.
    ///
    /// Cancelling `shutdown` stops both workers. Losing the channel (end of
    /// stream, a read error or a write error) stops both as well; an
    /// interface failure stops only the worker that hit it.
    pub async fn run<I, C>(&self, interface: I, channel: C, shutdown: CancellationToken) -> ForwardReport
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let stop = shutdown.child_token();
        let (interface_rx, interface_tx) = tokio::io::split(interface);
        let (channel_rx, channel_tx) = tokio::io::split(channel);

        tracing::info!("Forwarding packets ({:?} framing)", self.framing);

        let outbound = tokio::spawn(outbound(
            interface_rx,
            channel_tx,
            self.framing,
            self.buffer_size,
            stop.clone(),
        ));
        let inbound = tokio::spawn(inbound(
            channel_rx,
            interface_tx,
            self.framing,
            self.buffer_size,
            stop.clone(),
        ));

        let (outbound, inbound) = tokio::join!(outbound, inbound);

        let (outbound, interface_rx, channel_tx) = match outbound {
            Ok((report, rx, tx)) => (report, Some(rx), Some(tx)),
            Err(e) => (WorkerReport::new(Direction::Outbound).finish(WorkerExit::Failed(e.to_string())), None, None),
        };
        let (inbound, channel_rx, interface_tx) = match inbound {
            Ok((report, rx, tx)) => (report, Some(rx), Some(tx)),
            Err(e) => (WorkerReport::new(Direction::Inbound).finish(WorkerExit::Failed(e.to_string())), None, None),
        };

        if let (Some(rx), Some(tx)) = (channel_rx, channel_tx) {
            let mut channel = rx.unsplit(tx);
            if let Err(e) = channel.shutdown().await {
                tracing::debug!("Channel shutdown: {}", e);
            }
        }
        if let (Some(rx), Some(tx)) = (interface_rx, interface_tx) {
            drop(rx.unsplit(tx));
        }

        tracing::info!(
            "Forwarding finished: {} packets out ({} bytes), {} packets in ({} bytes)",
            outbound.packets,
            outbound.bytes,
            inbound.packets,
            inbound.bytes
        );
        ForwardReport { outbound, inbound }
    }
}

fn codec(max_frame: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(max_frame)
        .new_codec()
}

/// Interface to channel. A failed channel write ends the session.
async fn outbound<I, C>(
    mut interface: ReadHalf<I>,
    channel: WriteHalf<C>,
    framing: Framing,
    buffer_size: usize,
    stop: CancellationToken,
) -> (WorkerReport, ReadHalf<I>, WriteHalf<C>)
where
    I: AsyncRead + AsyncWrite,
    C: AsyncRead + AsyncWrite,
{
    let mut report = WorkerReport::new(Direction::Outbound);
    let mut buf = vec![0u8; buffer_size];

    let (exit, channel_lost, channel) = match framing {
        Framing::Raw => {
            let mut channel = channel;
            let (exit, channel_lost) = loop {
                let n = tokio::select! {
                    _ = stop.cancelled() => break (WorkerExit::Cancelled, false),
                    read = interface.read(&mut buf) => match read {
                        Ok(0) => break (WorkerExit::SourceClosed, false),
                        Ok(n) => n,
                        Err(e) => break (WorkerExit::Failed(format!("interface read: {}", e)), false),
                    },
                };
                let written = async {
                    channel.write_all(&buf[..n]).await?;
                    channel.flush().await
                };
                tokio::select! {
                    _ = stop.cancelled() => break (WorkerExit::Cancelled, false),
                    result = written => {
                        if let Err(e) = result {
                            break (WorkerExit::Failed(format!("channel write: {}", e)), true);
                        }
                    }
                }
                report.record(n);
            };
            (exit, channel_lost, channel)
        }
        Framing::LengthPrefixed => {
            let mut sink = FramedWrite::new(channel, codec(buffer_size));
            let (exit, channel_lost) = loop {
                let n = tokio::select! {
                    _ = stop.cancelled() => break (WorkerExit::Cancelled, false),
                    read = interface.read(&mut buf) => match read {
                        Ok(0) => break (WorkerExit::SourceClosed, false),
                        Ok(n) => n,
                        Err(e) => break (WorkerExit::Failed(format!("interface read: {}", e)), false),
                    },
                };
                tokio::select! {
                    _ = stop.cancelled() => break (WorkerExit::Cancelled, false),
                    result = sink.send(Bytes::copy_from_slice(&buf[..n])) => {
                        if let Err(e) = result {
                            break (WorkerExit::Failed(format!("channel write: {}", e)), true);
                        }
                    }
                }
                report.record(n);
            };
            (exit, channel_lost, sink.into_inner())
        }
    };

    if channel_lost {
        stop.cancel();
    }
    (report.finish(exit), interface, channel)
}

/// Channel to interface. End of stream or a read error here means the
/// peer is gone, which stops the other direction too.
async fn inbound<C, I>(
    channel: ReadHalf<C>,
    mut interface: WriteHalf<I>,
    framing: Framing,
    buffer_size: usize,
    stop: CancellationToken,
) -> (WorkerReport, ReadHalf<C>, WriteHalf<I>)
where
    C: AsyncRead + AsyncWrite,
    I: AsyncRead + AsyncWrite,
{
    let mut report = WorkerReport::new(Direction::Inbound);

    let (exit, channel_lost, channel) = match framing {
        Framing::Raw => {
            let mut channel = channel;
            let mut buf = vec![0u8; buffer_size];
            let (exit, channel_lost) = loop {
                let n = tokio::select! {
                    _ = stop.cancelled() => break (WorkerExit::Cancelled, false),
                    read = channel.read(&mut buf) => match read {
                        Ok(0) => break (WorkerExit::SourceClosed, true),
                        Ok(n) => n,
                        Err(e) => break (WorkerExit::Failed(format!("channel read: {}", e)), true),
                    },
                };
                tokio::select! {
                    _ = stop.cancelled() => break (WorkerExit::Cancelled, false),
                    result = interface.write_all(&buf[..n]) => {
                        if let Err(e) = result {
                            break (WorkerExit::Failed(format!("interface write: {}", e)), false);
                        }
                    }
                }
                report.record(n);
            };
            (exit, channel_lost, channel)
        }
        Framing::LengthPrefixed => {
            let mut frames = FramedRead::new(channel, codec(buffer_size));
            let (exit, channel_lost) = loop {
                let packet = tokio::select! {
                    _ = stop.cancelled() => break (WorkerExit::Cancelled, false),
                    frame = frames.next() => match frame {
                        None => break (WorkerExit::SourceClosed, true),
                        Some(Ok(packet)) => packet,
                        Some(Err(e)) => break (WorkerExit::Failed(format!("channel read: {}", e)), true),
                    },
                };
                tokio::select! {
                    _ = stop.cancelled() => break (WorkerExit::Cancelled, false),
                    result = interface.write_all(&packet) => {
                        if let Err(e) = result {
                            break (WorkerExit::Failed(format!("interface write: {}", e)), false);
                        }
                    }
                }
                report.record(packet.len());
            };
            (exit, channel_lost, frames.into_inner())
        }
    };

    if channel_lost {
        if exit == WorkerExit::SourceClosed {
            tracing::info!("Peer closed the tunnel");
        }
        stop.cancel();
    }
    (report.finish(exit), channel, interface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, ReadBuf};
    use tokio::task::JoinHandle;

    /// Packet device that records each write and never yields a packet
    #[derive(Clone, Default)]
    struct RecordingDevice {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        /// Report end of stream on read instead of blocking
        closed: bool,
        /// Never complete a write
        stuck: bool,
    }

    impl RecordingDevice {
        async fn wait_for(&self, count: usize) -> Vec<Vec<u8>> {
            for _ in 0..200 {
                if self.writes.lock().unwrap().len() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.writes.lock().unwrap().clone()
        }
    }

    impl AsyncRead for RecordingDevice {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            if self.closed {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        }
    }

    impl AsyncWrite for RecordingDevice {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            if self.stuck {
                return Poll::Pending;
            }
            self.writes.lock().unwrap().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Channel whose reads or writes fail, and otherwise stay idle
    #[derive(Default)]
    struct BrokenChannel {
        read_error: Option<io::ErrorKind>,
        write_error: Option<io::ErrorKind>,
    }

    impl AsyncRead for BrokenChannel {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            match self.read_error {
                Some(kind) => Poll::Ready(Err(io::Error::new(kind, "connection lost"))),
                None => Poll::Pending,
            }
        }
    }

    impl AsyncWrite for BrokenChannel {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            match self.write_error {
                Some(kind) => Poll::Ready(Err(io::Error::new(kind, "connection lost"))),
                None => Poll::Ready(Ok(buf.len())),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn packet(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn spawn<I, C>(framing: Framing, interface: I, channel: C) -> (CancellationToken, JoinHandle<ForwardReport>)
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let token = CancellationToken::new();
        let forwarder = PacketForwarder::new(framing);
        let shutdown = token.clone();
        let handle = tokio::spawn(async move { forwarder.run(interface, channel, shutdown).await });
        (token, handle)
    }

    #[tokio::test]
    async fn test_round_trip_up_to_max_packet() {
        let (mut device, interface) = duplex(64 * 1024);
        let (mut peer, channel) = duplex(64 * 1024);
        let (token, handle) = spawn(Framing::Raw, interface, channel);

        for len in [1, 2, 20, 576, 1500, MAX_PACKET_SIZE - 1, MAX_PACKET_SIZE] {
            let sent = packet(len);

            device.write_all(&sent).await.unwrap();
            let mut received = vec![0u8; len];
            peer.read_exact(&mut received).await.unwrap();
            assert_eq!(received, sent, "outbound {} bytes", len);

            peer.write_all(&sent).await.unwrap();
            let mut received = vec![0u8; len];
            device.read_exact(&mut received).await.unwrap();
            assert_eq!(received, sent, "inbound {} bytes", len);
        }

        token.cancel();
        let report = handle.await.unwrap();
        assert_eq!(report.outbound.exit, WorkerExit::Cancelled);
        assert_eq!(report.inbound.exit, WorkerExit::Cancelled);
        assert_eq!(report.outbound.packets, 7);
        assert_eq!(report.inbound.bytes, report.outbound.bytes);
    }

    #[tokio::test]
    async fn test_oversized_chunk_split_in_order() {
        let device = RecordingDevice::default();
        let (mut peer, channel) = duplex(64 * 1024);
        let (token, handle) = spawn(Framing::Raw, device.clone(), channel);

        let sent = packet(MAX_PACKET_SIZE + 1);
        peer.write_all(&sent).await.unwrap();

        let writes = device.wait_for(2).await;
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].len(), MAX_PACKET_SIZE);
        assert_eq!(writes[1].len(), 1);
        assert_eq!(writes.concat(), sent);

        token.cancel();
        let report = handle.await.unwrap();
        assert_eq!(report.inbound.packets, 2);
    }

    #[tokio::test]
    async fn test_outbound_chunk_over_max_arrives_in_order() {
        let (mut device, interface) = duplex(64 * 1024);
        let (mut peer, channel) = duplex(64 * 1024);
        let (token, handle) = spawn(Framing::Raw, interface, channel);

        let sent = packet(MAX_PACKET_SIZE + 1);
        device.write_all(&sent).await.unwrap();
        let mut received = vec![0u8; sent.len()];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, sent);

        token.cancel();
        assert_eq!(handle.await.unwrap().outbound.bytes, sent.len() as u64);
    }

    #[tokio::test]
    async fn test_length_prefixed_framing() {
        let device = RecordingDevice::default();
        let (mut peer, channel) = duplex(64 * 1024);
        let (token, handle) = spawn(Framing::LengthPrefixed, device.clone(), channel);

        // Two frames in one write still reach the device as two packets
        let mut wire = Vec::new();
        for len in [3usize, 40] {
            wire.extend_from_slice(&(len as u16).to_be_bytes());
            wire.extend_from_slice(&packet(len));
        }
        peer.write_all(&wire).await.unwrap();

        let writes = device.wait_for(2).await;
        assert_eq!(writes, vec![packet(3), packet(40)]);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_length_prefixed_outbound() {
        let (mut device, interface) = duplex(64 * 1024);
        let (mut peer, channel) = duplex(64 * 1024);
        let (token, handle) = spawn(Framing::LengthPrefixed, interface, channel);

        let sent = packet(1500);
        device.write_all(&sent).await.unwrap();

        let mut len = [0u8; 2];
        peer.read_exact(&mut len).await.unwrap();
        assert_eq!(u16::from_be_bytes(len), 1500);
        let mut received = vec![0u8; 1500];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, sent);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_session() {
        let (_device, interface) = duplex(64 * 1024);
        let (mut peer, channel) = duplex(64 * 1024);
        let (_token, handle) = spawn(Framing::LengthPrefixed, interface, channel);

        peer.write_all(&(MAX_PACKET_SIZE as u16 + 1).to_be_bytes()).await.unwrap();
        peer.write_all(&packet(MAX_PACKET_SIZE + 1)).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(matches!(report.inbound.exit, WorkerExit::Failed(_)));
        assert_eq!(report.outbound.exit, WorkerExit::Cancelled);
        assert!(!report.peer_closed());
    }

    #[tokio::test]
    async fn test_channel_read_error_ends_session() {
        // A TLS peer that vanishes without close_notify reads as UnexpectedEof
        let channel = BrokenChannel {
            read_error: Some(io::ErrorKind::UnexpectedEof),
            ..Default::default()
        };
        let (_token, handle) = spawn(Framing::Raw, RecordingDevice::default(), channel);

        let report = tokio::time::timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
        assert!(matches!(report.inbound.exit, WorkerExit::Failed(_)));
        assert_eq!(report.outbound.exit, WorkerExit::Cancelled);
    }

    #[tokio::test]
    async fn test_channel_write_error_ends_session() {
        let channel = BrokenChannel {
            write_error: Some(io::ErrorKind::BrokenPipe),
            ..Default::default()
        };
        let (mut device, interface) = duplex(64 * 1024);
        let (_token, handle) = spawn(Framing::Raw, interface, channel);

        device.write_all(&packet(60)).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
        assert!(matches!(report.outbound.exit, WorkerExit::Failed(_)));
        assert_eq!(report.inbound.exit, WorkerExit::Cancelled);
        assert_eq!(report.outbound.packets, 0);
    }

    #[tokio::test]
    async fn test_shutdown_not_held_by_blocked_interface_write() {
        let device = RecordingDevice {
            stuck: true,
            ..Default::default()
        };
        let (mut peer, channel) = duplex(64 * 1024);
        let (token, handle) = spawn(Framing::Raw, device, channel);

        peer.write_all(&packet(40)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let report = tokio::time::timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
        assert_eq!(report.inbound.exit, WorkerExit::Cancelled);
        assert_eq!(report.inbound.packets, 0);
    }

    #[tokio::test]
    async fn test_peer_close_stops_both_directions() {
        let (_device, interface) = duplex(64 * 1024);
        let (peer, channel) = duplex(64 * 1024);
        let (_token, handle) = spawn(Framing::Raw, interface, channel);

        drop(peer);
        let report = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(report.peer_closed());
        assert_eq!(report.outbound.exit, WorkerExit::Cancelled);
    }

    #[tokio::test]
    async fn test_interface_close_keeps_inbound() {
        let device = RecordingDevice {
            closed: true,
            ..Default::default()
        };
        let (mut peer, channel) = duplex(64 * 1024);
        let (token, handle) = spawn(Framing::Raw, device.clone(), channel);

        // Closed interface ends outbound only; inbound still delivers
        peer.write_all(&packet(8)).await.unwrap();
        assert_eq!(device.wait_for(1).await, vec![packet(8)]);
        assert!(!handle.is_finished());

        token.cancel();
        let report = handle.await.unwrap();
        assert_eq!(report.outbound.exit, WorkerExit::SourceClosed);
        assert_eq!(report.inbound.exit, WorkerExit::Cancelled);
    }
}
