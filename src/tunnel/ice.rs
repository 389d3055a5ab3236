//! ICE connectivity checks and the datagram tunnel over the chosen pair.
//!
//! Nomination is aggressive: the controlling agent sets USE-CANDIDATE on
//! every check and takes the first pair that answers. The controlled agent
//! takes the pair of the first authenticated check carrying USE-CANDIDATE.
//!
//! A relayed local candidate sends through its TURN allocation, both for the
//! checks and for the tunnel afterwards; datagrams the server relays to us
//! are unwrapped before the checks or the tunnel look at them.

use super::stun::{StunMessage, StunMessageType, is_stun_packet, new_transaction_id};
use super::turn::{RELAY_REFRESH_INTERVAL, RelayInbound, TurnRelay};
use super::{EVENT_CHANNEL_CAPACITY, Transport, TransportEvent, TunnelHandle};
use crate::error::TunnelError;
use crate::framing::{FrameDecoder, encode_frame};
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use vipcore::p2p::{Candidate, IceRole, SessionDescription};
use vipcore::parser::Channel;

/// Pacing between two checks (Ta).
const CHECK_PACING: Duration = Duration::from_millis(50);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// The pair is considered lost after this long without any datagram.
const CONSENT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Local ICE credentials for one negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn generate() -> Self {
        Self {
            ufrag: random_token(4),
            pwd: random_token(22),
        }
    }
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Both halves of the exchanged session, as seen by the local agent.
#[derive(Debug, Clone)]
pub struct IceSession {
    pub local: IceCredentials,
    pub role: IceRole,
    pub tie_breaker: u64,
    pub remote_ufrag: String,
    pub remote_pwd: String,
}

impl IceSession {
    pub fn new(local: IceCredentials, role: IceRole, remote: &SessionDescription) -> Self {
        Self {
            local,
            role,
            tie_breaker: rand::rng().random(),
            remote_ufrag: remote.ufrag.clone(),
            remote_pwd: remote.pwd.clone(),
        }
    }

    fn outgoing_check(&self, priority: u32) -> StunMessage {
        let username = format!("{}:{}", self.remote_ufrag, self.local.ufrag);
        let check = StunMessage::binding_request(new_transaction_id())
            .with_username(username.as_bytes())
            .with_priority(priority)
            .with_ice_role(self.role, self.tie_breaker)
            .with_integrity_key(self.remote_pwd.as_bytes());
        match self.role {
            IceRole::Controlling => check.with_use_candidate(),
            IceRole::Controlled => check,
        }
    }

    /// Authenticates an inbound check: it must name our ufrag first and be
    /// signed with our password.
    fn accepts_check(&self, data: &[u8], msg: &StunMessage) -> bool {
        let expected = format!("{}:", self.local.ufrag);
        msg.msg_type == StunMessageType::BindingRequest
            && msg
                .username()
                .is_some_and(|u| u.starts_with(expected.as_bytes()))
            && StunMessage::verify_integrity(data, self.local.pwd.as_bytes())
    }

    fn check_response(&self, msg: &StunMessage, from: SocketAddr) -> Vec<u8> {
        StunMessage::binding_success(msg.transaction_id, from)
            .with_integrity_key(self.local.pwd.as_bytes())
            .encode()
    }
}

/// How a local candidate reaches peers.
#[derive(Debug, Clone)]
pub enum Route {
    /// Straight from the media socket (host and server-reflexive).
    Direct,
    /// Through the TURN allocation (relayed).
    Relayed(Arc<TurnRelay>),
}

impl Route {
    pub fn is_relayed(&self) -> bool {
        matches!(self, Self::Relayed(_))
    }

    async fn send_to(&self, socket: &UdpSocket, data: &[u8], peer: SocketAddr) -> std::io::Result<()> {
        match self {
            Self::Direct => socket.send_to(data, peer).await.map(drop),
            Self::Relayed(relay) => relay.send_to(socket, data, peer).await,
        }
    }
}

/// A local candidate as the checks use it.
#[derive(Debug, Clone)]
pub struct LocalPath {
    pub route: Route,
    pub priority: u32,
}

impl LocalPath {
    pub fn direct(priority: u32) -> Self {
        Self {
            route: Route::Direct,
            priority,
        }
    }

    pub fn relayed(relay: Arc<TurnRelay>, priority: u32) -> Self {
        Self {
            route: Route::Relayed(relay),
            priority,
        }
    }
}

/// The pair the checks settled on.
#[derive(Debug, Clone)]
pub struct Nominated {
    pub remote: SocketAddr,
    pub route: Route,
}

/// A datagram after relay unwrapping.
enum Inbound<'a> {
    Peer {
        data: Cow<'a, [u8]>,
        from: SocketAddr,
        route: Route,
    },
    Relay(StunMessage),
}

fn relay_of(paths: &[LocalPath]) -> Option<Arc<TurnRelay>> {
    paths.iter().find_map(|path| match &path.route {
        Route::Relayed(relay) => Some(relay.clone()),
        Route::Direct => None,
    })
}

fn classify<'a>(relay: Option<&Arc<TurnRelay>>, data: &'a [u8], from: SocketAddr) -> Inbound<'a> {
    match relay.and_then(|r| r.inbound(data, from).map(|inbound| (r, inbound))) {
        Some((relay, RelayInbound::Data { peer, data })) => Inbound::Peer {
            data: Cow::Owned(data),
            from: peer,
            route: Route::Relayed(relay.clone()),
        },
        Some((_, RelayInbound::Control(msg))) => Inbound::Relay(msg),
        None => Inbound::Peer {
            data: Cow::Borrowed(data),
            from,
            route: Route::Direct,
        },
    }
}

/// Runs checks on every pair of `local` path and `remote` candidate and
/// returns the nominated pair. Relayed paths first get permissions for all
/// remote candidates. Runs until a pair is nominated; callers bound it with
/// their negotiation timeout.
pub async fn run_checks(
    socket: &UdpSocket,
    session: &IceSession,
    remote: &[Candidate],
    local: &[LocalPath],
) -> Result<Nominated, TunnelError> {
    let local_is_v6 = socket.local_addr()?.is_ipv6();
    let targets: Vec<&Candidate> = remote
        .iter()
        .filter(|c| c.address.is_ipv6() == local_is_v6)
        .collect();
    if targets.is_empty() || local.is_empty() {
        return Err(TunnelError::NoCandidates);
    }

    let relay = relay_of(local);
    if let Some(relay) = &relay {
        let peers: Vec<SocketAddr> = targets.iter().map(|c| c.address).collect();
        relay.create_permission(socket, &peers).await?;
    }

    // (path, target), best pair first.
    let mut pairs: Vec<(&LocalPath, SocketAddr, u32, u32)> = local
        .iter()
        .flat_map(|path| {
            targets
                .iter()
                .map(move |c| (path, c.address, path.priority.min(c.priority), path.priority.max(c.priority)))
        })
        .collect();
    pairs.sort_by(|a, b| (b.2, b.3).cmp(&(a.2, a.3)));

    info!(
        target: "Tunnel/Ice",
        "Checking {} pair(s) as {:?}",
        pairs.len(),
        session.role
    );

    let mut pending: HashMap<[u8; 12], usize> = HashMap::new();
    let mut pacing = interval(CHECK_PACING);
    pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut next = 0usize;
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = pacing.tick() => {
                let index = next % pairs.len();
                next += 1;
                let (path, target, ..) = pairs[index];
                let check = session.outgoing_check(path.priority);
                pending.insert(check.transaction_id, index);
                trace!(target: "Tunnel/Ice", "--> check to {target} (relayed: {})", path.route.is_relayed());
                if let Err(e) = path.route.send_to(socket, &check.encode(), target).await {
                    debug!(target: "Tunnel/Ice", "Check to {target} failed: {e}");
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                let (data, from, route) = match classify(relay.as_ref(), &buf[..len], from) {
                    Inbound::Peer { data, from, route } => (data, from, route),
                    Inbound::Relay(msg) => {
                        trace!(target: "Tunnel/Ice", "Ignoring relay control {:?}", msg.msg_type);
                        continue;
                    }
                };
                if !is_stun_packet(&data) {
                    continue;
                }
                let msg = match StunMessage::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(target: "Tunnel/Ice", "Dropping malformed STUN from {from}: {e}");
                        continue;
                    }
                };

                if msg.msg_type == StunMessageType::BindingRequest {
                    if !session.accepts_check(&data, &msg) {
                        debug!(target: "Tunnel/Ice", "Rejecting unauthenticated check from {from}");
                        continue;
                    }
                    route.send_to(socket, &session.check_response(&msg, from), from).await?;
                    if session.role == IceRole::Controlled && msg.has_use_candidate() {
                        info!(target: "Tunnel/Ice", "Peer nominated {from} (relayed: {})", route.is_relayed());
                        return Ok(Nominated { remote: from, route });
                    }
                    continue;
                }

                if msg.is_success()
                    && let Some(index) = pending.remove(&msg.transaction_id)
                    && StunMessage::verify_integrity(&data, session.remote_pwd.as_bytes())
                    && session.role == IceRole::Controlling
                {
                    let (path, target, ..) = pairs[index];
                    info!(target: "Tunnel/Ice", "Nominated {target} (relayed: {})", path.route.is_relayed());
                    return Ok(Nominated {
                        remote: target,
                        route: path.route.clone(),
                    });
                }
            }
        }
    }
}

/// Tunnel over the nominated pair; one frame per datagram.
pub struct IceTunnel {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    route: Route,
    connected: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl IceTunnel {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_relayed(&self) -> bool {
        self.route.is_relayed()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for IceTunnel {
    async fn send_frame(&self, channel: Channel, payload: &[u8]) -> Result<(), anyhow::Error> {
        if !self.is_connected() {
            return Err(anyhow::anyhow!("Tunnel is closed"));
        }
        let frame = encode_frame(channel, payload)?;
        trace!(target: "Tunnel/Ice", "--> {channel} frame: {} bytes", payload.len());
        self.route.send_to(&self.socket, &frame, self.remote).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            for task in self
                .tasks
                .lock()
                .expect("Mutex should not be poisoned")
                .drain(..)
            {
                task.abort();
            }
        }
    }
}

/// Wraps the checked socket into a tunnel and starts its pumps.
pub async fn open_tunnel(
    socket: Arc<UdpSocket>,
    session: IceSession,
    nominated: Nominated,
) -> TunnelHandle {
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let _ = event_tx.send(TransportEvent::Connected).await;

    let Nominated { remote, route } = nominated;
    let session = Arc::new(session);
    let mut tasks = vec![
        tokio::spawn(datagram_pump(
            socket.clone(),
            session.clone(),
            remote,
            route.clone(),
            event_tx,
        )),
        tokio::spawn(keepalive(socket.clone(), session, remote, route.clone())),
    ];
    if let Route::Relayed(relay) = &route {
        tasks.push(tokio::spawn(refresh_relay(socket.clone(), relay.clone())));
    }

    let tunnel = Arc::new(IceTunnel {
        socket,
        remote,
        route,
        connected: AtomicBool::new(true),
        tasks: std::sync::Mutex::new(tasks),
    });
    (tunnel, event_rx)
}

async fn keepalive(socket: Arc<UdpSocket>, session: Arc<IceSession>, remote: SocketAddr, route: Route) {
    let mut ticker = interval(KEEPALIVE_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let check = session.outgoing_check(0);
        if route.send_to(&socket, &check.encode(), remote).await.is_err() {
            return;
        }
    }
}

async fn refresh_relay(socket: Arc<UdpSocket>, relay: Arc<TurnRelay>) {
    let mut ticker = interval(RELAY_REFRESH_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for request in relay.refresh_requests() {
            if let Err(e) = socket.send_to(&request, relay.server()).await {
                warn!(target: "Tunnel/Turn", "Relay refresh failed: {e}");
                return;
            }
        }
    }
}

async fn datagram_pump(
    socket: Arc<UdpSocket>,
    session: Arc<IceSession>,
    remote: SocketAddr,
    route: Route,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let relay = match &route {
        Route::Relayed(relay) => Some(relay.clone()),
        Route::Direct => None,
    };
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match timeout(CONSENT_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                warn!(target: "Tunnel/Ice", "Socket failed: {e}");
                let _ = event_tx
                    .send(TransportEvent::Disconnected(Some(e.to_string())))
                    .await;
                return;
            }
            Err(_) => {
                info!(target: "Tunnel/Ice", "No traffic from {remote}, tunnel lost");
                let _ = event_tx
                    .send(TransportEvent::Disconnected(Some("consent expired".into())))
                    .await;
                return;
            }
        };
        let (data, from, arrived_on) = match classify(relay.as_ref(), &buf[..len], from) {
            Inbound::Peer { data, from, route } => (data, from, route),
            Inbound::Relay(msg) => {
                if let Some(relay) = &relay
                    && let Some(retry) = relay.on_control(&msg)
                {
                    let _ = socket.send_to(&retry, relay.server()).await;
                }
                continue;
            }
        };

        if is_stun_packet(&data) {
            // Late checks and keepalives from the peer still need answers.
            if let Ok(msg) = StunMessage::decode(&data)
                && session.accepts_check(&data, &msg)
            {
                let _ = arrived_on
                    .send_to(&socket, &session.check_response(&msg, from), from)
                    .await;
            }
            continue;
        }
        if from != remote {
            debug!(target: "Tunnel/Ice", "Ignoring datagram from unexpected {from}");
            continue;
        }

        let mut decoder = FrameDecoder::new();
        decoder.feed(&data);
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
