//! Direct or relayed tunnel to a fixed address.
//!
//! Control frames travel over TCP. When a UDP port is configured, media
//! frames are sent as one datagram each; otherwise they share the stream.

use super::{EVENT_CHANNEL_CAPACITY, Transport, TransportEvent, TunnelHandle};
use crate::config::DirectTunnelParams;
use crate::error::TunnelError;
use crate::framing::{FrameDecoder, encode_frame};
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use vipcore::parser::Channel;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

pub struct DirectTunnel {
    writer: Mutex<Option<OwnedWriteHalf>>,
    media: Option<Arc<UdpSocket>>,
    connected: AtomicBool,
}

impl DirectTunnel {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for DirectTunnel {
    async fn send_frame(&self, channel: Channel, payload: &[u8]) -> Result<(), anyhow::Error> {
        let frame = encode_frame(channel, payload)?;

        if channel == Channel::Media
            && let Some(socket) = &self.media
        {
            socket.send(&frame).await?;
            return Ok(());
        }

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Tunnel is closed"))?;
        trace!(target: "Tunnel/Direct", "--> {channel} frame: {} bytes", payload.len());
        writer.write_all(&frame).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::Relaxed)
            && let Some(mut writer) = self.writer.lock().await.take()
        {
            let _ = writer.shutdown().await;
        }
    }
}

/// Opens a tunnel, failing with [`TunnelError::Timeout`] when the TCP
/// connection is not up within `params.timeout`.
pub async fn connect(params: &DirectTunnelParams) -> Result<TunnelHandle, TunnelError> {
    let addr = SocketAddr::new(params.ip_address, params.tcp_port);
    info!(target: "Tunnel/Direct", "Dialing {addr}");

    let stream = timeout(params.timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::Timeout)??;
    stream.set_nodelay(true)?;

    let media = match params.udp_port {
        Some(port) => {
            let bind: SocketAddr = match params.ip_address {
                IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect((params.ip_address, port)).await?;
            debug!(target: "Tunnel/Direct", "Media datagrams to {}:{port}", params.ip_address);
            Some(Arc::new(socket))
        }
        None => None,
    };

    let (reader, writer) = stream.into_split();
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    tokio::spawn(read_pump(reader, event_tx.clone()));
    if let Some(socket) = &media {
        tokio::spawn(datagram_pump(socket.clone(), event_tx.clone()));
    }
    let _ = event_tx.send(TransportEvent::Connected).await;

    let tunnel = Arc::new(DirectTunnel {
        writer: Mutex::new(Some(writer)),
        media,
        connected: AtomicBool::new(true),
    });
    Ok((tunnel, event_rx))
}

async fn read_pump(mut reader: OwnedReadHalf, event_tx: mpsc::Sender<TransportEvent>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!(target: "Tunnel/Direct", "Tunnel closed by peer");
                let _ = event_tx.send(TransportEvent::Disconnected(None)).await;
                return;
            }
            Ok(n) => {
                decoder.feed(&buf[..n]);
                while let Some(frame) = decoder.decode_frame() {
                    if event_tx
                        .send(TransportEvent::FrameReceived(frame))
                        .await
                        .is_err()
                    {
                        debug!(target: "Tunnel/Direct", "Event receiver dropped, stopping read pump");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(target: "Tunnel/Direct", "Tunnel read failed: {e}");
                let _ = event_tx
                    .send(TransportEvent::Disconnected(Some(e.to_string())))
                    .await;
                return;
            }
        }
    }
}

/// Decodes one frame per datagram.
async fn datagram_pump(socket: Arc<UdpSocket>, event_tx: mpsc::Sender<TransportEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                debug!(target: "Tunnel/Direct", "Media socket closed: {e}");
                return;
            }
        };
        let mut decoder = FrameDecoder::new();
        decoder.feed(&buf[..len]);
        while let Some(frame) = decoder.decode_frame() {
            if event_tx
                .send(TransportEvent::FrameReceived(frame))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}
