//! Tunnels to remote units.
//!
//! A tunnel is a bidirectional frame channel (see [`crate::framing`]). It is
//! opened either directly to a fixed address ([`direct::connect`]) or by ICE
//! negotiation over a signaling exchange ([`negotiator::P2pNegotiator`]).
//! Both hand back a [`Transport`] for sending and a receiver of
//! [`TransportEvent`]s fed by a background read pump.

pub mod direct;
pub mod ice;
pub mod negotiator;
pub mod signaling;
pub mod stun;
pub mod turn;

use crate::framing::Frame;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use vipcore::parser::Channel;

pub use direct::DirectTunnel;
pub use negotiator::P2pNegotiator;

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 100;

/// An event produced by a tunnel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    FrameReceived(Frame),
    /// The tunnel was lost, with the reason when one is known.
    Disconnected(Option<String>),
}

/// An open tunnel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one frame on `channel`.
    async fn send_frame(&self, channel: Channel, payload: &[u8]) -> Result<(), anyhow::Error>;

    /// Closes the tunnel.
    async fn disconnect(&self);
}

pub type TunnelHandle = (Arc<dyn Transport>, mpsc::Receiver<TransportEvent>);
