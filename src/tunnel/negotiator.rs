//! P2P tunnel negotiation: gather candidates, exchange descriptions,
//! run connectivity checks, open the tunnel.
//!
//! A failed attempt posts `ConnectionError` on the unit and returns
//! [`TunnelError::NegotiationFailed`]. Nothing is retried here; the caller
//! decides whether to try again.

use super::TunnelHandle;
use super::ice::{IceCredentials, IceSession, LocalPath, open_tunnel, run_checks};
use super::signaling::{MqttClient, SdpExchange, Unauthorized, exchange_for};
use super::stun;
use super::turn::TurnRelay;
use crate::error::TunnelError;
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UdpSocket, lookup_host};
use tokio::time::{sleep, timeout};
use vipcore::net::HttpClient;
use vipcore::p2p::{
    Candidate, CandidateType, IceRole, P2pParameters, SessionDescription, filter_candidates,
};
use vipcore::types::{ConnError, UnitKey};
use vipcore::{CoreEventBus, Event, EventPayload};

/// Upper bound for one STUN or TURN server while gathering.
const GATHER_TIMEOUT: Duration = Duration::from_secs(2);

/// Gathered candidates, plus the allocation behind the relayed one.
#[derive(Debug, Default)]
pub struct LocalCandidates {
    pub candidates: Vec<Candidate>,
    pub relay: Option<Arc<TurnRelay>>,
}

impl LocalCandidates {
    /// One check path per usable candidate: a direct path at the best
    /// direct priority and one through the relay.
    pub fn paths(&self) -> Vec<LocalPath> {
        let mut paths = Vec::new();
        if let Some(priority) = self
            .candidates
            .iter()
            .filter(|c| !c.is_relayed())
            .map(|c| c.priority)
            .max()
        {
            paths.push(LocalPath::direct(priority));
        }
        if let Some(relay) = &self.relay
            && let Some(candidate) = self.candidates.iter().find(|c| c.is_relayed())
        {
            paths.push(LocalPath::relayed(relay.clone(), candidate.priority));
        }
        paths
    }
}

pub struct P2pNegotiator {
    params: P2pParameters,
    bus: CoreEventBus,
    http: Arc<dyn HttpClient>,
    mqtt: Option<Arc<dyn MqttClient>>,
    exchange: Option<Arc<dyn SdpExchange>>,
    bind: Option<SocketAddr>,
}

impl P2pNegotiator {
    pub fn new(params: P2pParameters, bus: CoreEventBus, http: Arc<dyn HttpClient>) -> Self {
        Self {
            params,
            bus,
            http,
            mqtt: None,
            exchange: None,
            bind: None,
        }
    }

    /// Client used when the parameters select MQTT signaling.
    pub fn with_mqtt(mut self, client: Arc<dyn MqttClient>) -> Self {
        self.mqtt = Some(client);
        self
    }

    /// Uses `exchange` instead of building one from the parameters.
    pub fn with_exchange(mut self, exchange: Arc<dyn SdpExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Local address for the media socket. Defaults to the unspecified
    /// address of the configured family.
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(addr);
        self
    }

    pub fn params(&self) -> &P2pParameters {
        &self.params
    }

    /// Negotiates a tunnel for `unit`. `session` names the rendezvous on
    /// the signaling transport.
    pub async fn negotiate(&self, unit: UnitKey, session: &str) -> Result<TunnelHandle, TunnelError> {
        let delay = self.params.rem_nego_delay();
        if !delay.is_zero() {
            debug!(target: "Tunnel/Ice", "Delaying negotiation for {unit} by {delay:?}");
            sleep(delay).await;
        }

        let result = match timeout(self.params.negotiation_timeout(), self.attempt(session)).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Timeout),
        };

        result.map_err(|e| {
            let error = conn_error_for(&e);
            warn!(target: "Tunnel/Ice", "Negotiation for {unit} failed: {e}");
            self.bus.post(Event::unit(
                unit.sys_id,
                unit.unit_id,
                EventPayload::ConnectionError { error },
            ));
            match e {
                TunnelError::Unauthorized => e,
                _ => TunnelError::NegotiationFailed(error),
            }
        })
    }

    async fn attempt(&self, session: &str) -> Result<TunnelHandle, TunnelError> {
        let role = self.params.ice_role();
        let socket = Arc::new(UdpSocket::bind(self.bind_address()).await?);
        let gathered = self.gather(&socket).await?;
        let local_candidates = &gathered.candidates;
        let credentials = IceCredentials::generate();
        let local = SessionDescription {
            ufrag: credentials.ufrag.clone(),
            pwd: credentials.pwd.clone(),
            role,
            candidates: local_candidates.clone(),
        };

        let exchange = match &self.exchange {
            Some(exchange) => exchange.clone(),
            None => {
                exchange_for(
                    self.params.sdp_transport(),
                    role,
                    session,
                    self.http.clone(),
                    self.mqtt.clone(),
                )
                .await?
            }
        };
        exchange.publish(&local).await.map_err(signaling_error)?;
        let remote = exchange.receive().await.map_err(signaling_error)?;
        if remote.role != role.opposite() {
            return Err(TunnelError::Signaling(format!(
                "peer also claims role {:?}",
                remote.role
            )));
        }

        let remote_candidates = self.prune(remote.candidates.clone());
        info!(
            target: "Tunnel/Ice",
            "{} local / {} remote candidate(s) after filtering",
            local_candidates.len(),
            remote_candidates.len()
        );
        if remote_candidates.is_empty() {
            return Err(TunnelError::NoCandidates);
        }

        let ice = IceSession::new(credentials, role, &remote);
        let nominated = run_checks(&socket, &ice, &remote_candidates, &gathered.paths()).await?;
        Ok(open_tunnel(socket, ice, nominated).await)
    }

    /// Applies the candidate filter and the IPv6-only restriction.
    pub fn prune(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        filter_candidates(candidates, self.params.filter(), self.params.ipv6_only())
    }

    fn bind_address(&self) -> SocketAddr {
        self.bind.unwrap_or_else(|| {
            if self.params.ipv6_only() {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            }
        })
    }

    /// Host, server-reflexive and, with a TURN server, relayed candidates
    /// for `socket`, pruned by the filter strategy. A server that does not
    /// answer only costs its own candidate. The relay is kept only while
    /// its candidate survives the filter.
    pub async fn gather(&self, socket: &UdpSocket) -> Result<LocalCandidates, TunnelError> {
        let bound = socket.local_addr()?;
        let mut host = None;
        let mut gathered = Vec::new();
        let mut relay = None;

        for server in self.params.stun_servers() {
            let Some(server_addr) = resolve(server, bound.is_ipv6()).await else {
                debug!(target: "Tunnel/Ice", "Cannot resolve STUN server {server}");
                continue;
            };
            if host.is_none() {
                host = Some(host_address(bound, server_addr));
            }
            match timeout(GATHER_TIMEOUT, stun::binding(socket, server_addr)).await {
                Ok(Ok(mapped)) if Some(mapped) != host => {
                    gathered.push(Candidate::new(CandidateType::Srflx, mapped, host));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(target: "Tunnel/Ice", "STUN binding via {server} failed: {e}"),
                Err(_) => debug!(target: "Tunnel/Ice", "STUN server {server} did not answer"),
            }
        }

        if let Some(turn) = self.params.turn_server() {
            match resolve(&turn.address, bound.is_ipv6()).await {
                Some(server_addr) => {
                    match timeout(GATHER_TIMEOUT, stun::allocate(socket, server_addr, turn)).await {
                        Ok(Ok(allocation)) => {
                            gathered.push(Candidate::new(
                                CandidateType::Relay,
                                allocation.relayed,
                                allocation.mapped,
                            ));
                            relay = Some(Arc::new(TurnRelay::new(allocation)));
                        }
                        Ok(Err(e)) => warn!(target: "Tunnel/Ice", "TURN allocation failed: {e}"),
                        Err(_) => warn!(target: "Tunnel/Ice", "TURN server {} did not answer", turn.address),
                    }
                }
                None => debug!(target: "Tunnel/Ice", "Cannot resolve TURN server {}", turn.address),
            }
        }

        let host = host.unwrap_or(bound);
        if !host.ip().is_unspecified() {
            gathered.insert(0, Candidate::host(host));
        }
        let mut candidates = self.prune(gathered);
        candidates.dedup_by(|a, b| a.address == b.address && a.kind == b.kind);
        let relay = relay.filter(|_| candidates.iter().any(Candidate::is_relayed));
        Ok(LocalCandidates { candidates, relay })
    }
}

fn signaling_error(error: anyhow::Error) -> TunnelError {
    if error.is::<Unauthorized>() {
        TunnelError::Unauthorized
    } else {
        TunnelError::Signaling(error.to_string())
    }
}

fn conn_error_for(error: &TunnelError) -> ConnError {
    match error {
        TunnelError::Signaling(_)
        | TunnelError::Unauthorized
        | TunnelError::Stun(_)
        | TunnelError::Frame(_) => {
            ConnError::UnexpectedMsg
        }
        TunnelError::NegotiationFailed(inner) => *inner,
        _ => ConnError::CtpDisconnected,
    }
}

async fn resolve(server: &str, want_v6: bool) -> Option<SocketAddr> {
    lookup_host(server)
        .await
        .ok()?
        .find(|addr| addr.is_ipv6() == want_v6)
}

/// The address peers can reach on the local network. A wildcard bind is
/// resolved to the interface that routes toward `server`; connecting a UDP
/// socket sends nothing.
fn host_address(bound: SocketAddr, server: SocketAddr) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }
    let probe_bind: SocketAddr = match bound.ip() {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    std::net::UdpSocket::bind(probe_bind)
        .and_then(|probe| {
            probe.connect(server)?;
            probe.local_addr()
        })
        .map(|local| SocketAddr::new(local.ip(), bound.port()))
        .unwrap_or(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemorySdpExchange, MockHttpClient, MockTurnServer, RecordingHandler};
    use crate::tunnel::stun::{StunMessage, StunMessageType};
    use vipcore::EventKind;
    use vipcore::p2p::{HttpAuth, P2pFilterStrategy, SdpTransport};
    use vipcore::types::{SysId, UnitId};

    /// Answers binding requests with the sender's address.
    async fn stun_responder() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                if let Ok(msg) = StunMessage::decode(&buf[..len])
                    && msg.msg_type == StunMessageType::BindingRequest
                {
                    let reply = StunMessage::binding_success(msg.transaction_id, from).encode();
                    let _ = socket.send_to(&reply, from).await;
                }
            }
        });
        addr
    }

    fn params(role: IceRole, stun: SocketAddr, filter: P2pFilterStrategy) -> P2pParameters {
        P2pParameters::builder()
            .ice_role(role)
            .sdp_transport(SdpTransport::Http {
                endpoint: "https://p2p.example.net/sdp".into(),
                auth: HttpAuth::Bearer("t".into()),
                poll_timeout: Duration::from_secs(5),
            })
            .stun_server(stun.to_string())
            .filter(filter)
            .negotiation_timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn unit() -> UnitKey {
        UnitKey::new(SysId::new(1), UnitId::new(2))
    }

    #[tokio::test]
    async fn test_two_agents_negotiate_a_tunnel() {
        let stun = stun_responder().await;
        let bus = CoreEventBus::new();
        let (left, right) = MemorySdpExchange::pair();
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let controlling = P2pNegotiator::new(
            params(IceRole::Controlling, stun, P2pFilterStrategy::All),
            bus.clone(),
            Arc::new(MockHttpClient),
        )
        .with_exchange(Arc::new(left))
        .with_bind_address(loopback);
        let controlled = P2pNegotiator::new(
            params(IceRole::Controlled, stun, P2pFilterStrategy::PeerOnly),
            bus.clone(),
            Arc::new(MockHttpClient),
        )
        .with_exchange(Arc::new(right))
        .with_bind_address(loopback);

        let (a, b) = tokio::join!(
            controlling.negotiate(unit(), "s1"),
            controlled.negotiate(unit(), "s1")
        );
        let (a_tunnel, _a_events) = a.unwrap();
        let (_b_tunnel, mut b_events) = b.unwrap();

        assert!(matches!(
            b_events.recv().await,
            Some(crate::tunnel::TransportEvent::Connected)
        ));
        a_tunnel
            .send_frame(vipcore::parser::Channel::Tunnel, b"{}")
            .await
            .unwrap();
        assert!(matches!(
            b_events.recv().await,
            Some(crate::tunnel::TransportEvent::FrameReceived(_))
        ));
    }

    #[tokio::test]
    async fn test_only_relayed_discards_host_and_reflexive() {
        let stun = stun_responder().await;
        let bus = CoreEventBus::new();
        let negotiator = P2pNegotiator::new(
            params(IceRole::Controlling, stun, P2pFilterStrategy::OnlyRelayed),
            bus,
            Arc::new(MockHttpClient),
        );
        let remote = vec![
            Candidate::host("192.168.1.10:5000".parse().unwrap()),
            Candidate::new(
                CandidateType::Prflx,
                "198.51.100.4:6000".parse().unwrap(),
                None,
            ),
            Candidate::new(
                CandidateType::Relay,
                "203.0.113.9:3478".parse().unwrap(),
                Some("10.0.0.2:5000".parse().unwrap()),
            ),
        ];
        let kept = negotiator.prune(remote);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].is_relayed());

        // Without a TURN server nothing local survives either.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = negotiator.gather(&socket).await.unwrap();
        assert!(local.candidates.is_empty());
        assert!(local.paths().is_empty());
    }

    #[tokio::test]
    async fn test_gather_keeps_the_allocation_behind_the_relay_candidate() {
        let stun = stun_responder().await;
        let turn = MockTurnServer::spawn().await;
        let with_turn = |filter| {
            P2pParameters::builder()
                .ice_role(IceRole::Controlling)
                .sdp_transport(SdpTransport::Http {
                    endpoint: "https://p2p.example.net/sdp".into(),
                    auth: HttpAuth::Bearer("t".into()),
                    poll_timeout: Duration::from_secs(5),
                })
                .stun_server(stun.to_string())
                .turn_server(turn.credentials.clone())
                .filter(filter)
                .build()
                .unwrap()
        };

        let negotiator = P2pNegotiator::new(
            with_turn(P2pFilterStrategy::OnlyRelayed),
            CoreEventBus::new(),
            Arc::new(MockHttpClient),
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = negotiator.gather(&socket).await.unwrap();
        assert_eq!(local.candidates.len(), 1);
        assert_eq!(local.candidates[0].address, turn.relayed);
        let relay = local.relay.as_ref().unwrap();
        assert_eq!(relay.relayed(), turn.relayed);
        let paths = local.paths();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].route.is_relayed());
        assert_eq!(paths[0].priority, local.candidates[0].priority);

        // A filter that drops relayed candidates drops the allocation too.
        let negotiator = P2pNegotiator::new(
            with_turn(P2pFilterStrategy::PeerOnly),
            CoreEventBus::new(),
            Arc::new(MockHttpClient),
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = negotiator.gather(&socket).await.unwrap();
        assert!(local.relay.is_none());
        assert!(local.paths().iter().all(|p| !p.route.is_relayed()));
    }

    #[tokio::test]
    async fn test_failure_posts_connection_error_without_retry() {
        let stun = stun_responder().await;
        let bus = CoreEventBus::new();
        let recorder = RecordingHandler::new();
        let _subscription = bus.register(&recorder);
        let (left, right) = MemorySdpExchange::pair();

        // The peer only offers a host candidate, which the filter drops.
        right
            .publish(&SessionDescription {
                ufrag: "peer".into(),
                pwd: "peer-password-00000000".into(),
                role: IceRole::Controlled,
                candidates: vec![Candidate::host("127.0.0.1:9".parse().unwrap())],
            })
            .await
            .unwrap();

        let negotiator = P2pNegotiator::new(
            params(IceRole::Controlling, stun, P2pFilterStrategy::OnlyRelayed),
            bus.clone(),
            Arc::new(MockHttpClient),
        )
        .with_exchange(Arc::new(left))
        .with_bind_address("127.0.0.1:0".parse().unwrap());

        let err = negotiator.negotiate(unit(), "s2").await.err().unwrap();
        assert!(matches!(
            err,
            TunnelError::NegotiationFailed(ConnError::CtpDisconnected)
        ));

        let events = recorder.events_of(EventKind::ConnectionError);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].unit_key(), unit());
    }

    #[tokio::test]
    async fn test_role_conflict_is_a_signaling_error() {
        let stun = stun_responder().await;
        let bus = CoreEventBus::new();
        let (left, right) = MemorySdpExchange::pair();
        right
            .publish(&SessionDescription {
                ufrag: "peer".into(),
                pwd: "peer-password-00000000".into(),
                role: IceRole::Controlling,
                candidates: vec![Candidate::host("127.0.0.1:9".parse().unwrap())],
            })
            .await
            .unwrap();

        let negotiator = P2pNegotiator::new(
            params(IceRole::Controlling, stun, P2pFilterStrategy::All),
            bus,
            Arc::new(MockHttpClient),
        )
        .with_exchange(Arc::new(left))
        .with_bind_address("127.0.0.1:0".parse().unwrap());

        let err = negotiator.negotiate(unit(), "s3").await.err().unwrap();
        assert!(matches!(
            err,
            TunnelError::NegotiationFailed(ConnError::UnexpectedMsg)
        ));
    }
}
