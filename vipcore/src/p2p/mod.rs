//! Configuration and data types for peer-to-peer tunnel negotiation.

mod candidate;

pub use candidate::{Candidate, CandidateParseError, CandidateType, filter_candidates};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Validation failures for connection and negotiation parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamsError {
    #[error("at least one STUN server is required")]
    NoStunServers,
    #[error("at most two STUN servers are supported, got {0}")]
    TooManyStunServers(usize),
    #[error("SDP exchange transport is not configured")]
    MissingSdpTransport,
    #[error("MQTT transport requires a broker address")]
    MissingBroker,
    #[error("MQTT transport requires the {0} topic")]
    MissingTopic(&'static str),
    #[error("HTTP transport requires an endpoint")]
    MissingEndpoint,
    #[error("HTTP transport requires bearer or activation-code auth")]
    MissingAuth,
    #[error("hostname must not be empty")]
    MissingHostname,
    #[error("port must not be zero")]
    InvalidPort,
    #[error("activation code must not be empty")]
    MissingActivationCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IceRole {
    #[default]
    Controlling,
    Controlled,
}

impl IceRole {
    pub fn opposite(self) -> Self {
        match self {
            Self::Controlling => Self::Controlled,
            Self::Controlled => Self::Controlling,
        }
    }
}

/// Candidate types kept before connectivity checks. Some carriers break
/// certain candidate types, so pruning avoids wasted check rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum P2pFilterStrategy {
    #[default]
    All,
    /// Direct paths only: host and reflexive candidates, no relays.
    PeerOnly,
    OnlyRelayed,
}

impl P2pFilterStrategy {
    pub fn accepts(self, kind: CandidateType) -> bool {
        match self {
            Self::All => true,
            Self::PeerOnly => kind != CandidateType::Relay,
            Self::OnlyRelayed => kind == CandidateType::Relay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAuth {
    Bearer(String),
    ActivationCode(String),
}

impl HttpAuth {
    fn is_empty(&self) -> bool {
        match self {
            Self::Bearer(v) | Self::ActivationCode(v) => v.is_empty(),
        }
    }
}

/// How SDP offers and answers reach the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpTransport {
    Mqtt {
        broker: String,
        client_id: String,
        username: Option<String>,
        password: Option<String>,
        /// Topic we publish our description on.
        local_topic: String,
        /// Topic the peer publishes on.
        remote_topic: String,
    },
    Http {
        endpoint: String,
        auth: HttpAuth,
        /// Long-poll wait per request.
        poll_timeout: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub address: String,
    pub username: String,
    pub password: String,
}

/// Parameters for one negotiation attempt. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2pParameters {
    ice_role: IceRole,
    sdp_transport: SdpTransport,
    stun_servers: Vec<String>,
    turn_server: Option<TurnServer>,
    filter: P2pFilterStrategy,
    ipv6_only: bool,
    rem_nego_delay: Duration,
    negotiation_timeout: Duration,
}

impl P2pParameters {
    pub fn builder() -> P2pParametersBuilder {
        P2pParametersBuilder::default()
    }

    pub fn ice_role(&self) -> IceRole {
        self.ice_role
    }

    pub fn sdp_transport(&self) -> &SdpTransport {
        &self.sdp_transport
    }

    pub fn stun_servers(&self) -> &[String] {
        &self.stun_servers
    }

    pub fn turn_server(&self) -> Option<&TurnServer> {
        self.turn_server.as_ref()
    }

    pub fn filter(&self) -> P2pFilterStrategy {
        self.filter
    }

    pub fn ipv6_only(&self) -> bool {
        self.ipv6_only
    }

    /// Delay before negotiation starts, so both peers do not hit the
    /// signaling channel at the same moment.
    pub fn rem_nego_delay(&self) -> Duration {
        self.rem_nego_delay
    }

    pub fn negotiation_timeout(&self) -> Duration {
        self.negotiation_timeout
    }
}

#[derive(Debug, Clone)]
pub struct P2pParametersBuilder {
    ice_role: IceRole,
    sdp_transport: Option<SdpTransport>,
    stun_servers: Vec<String>,
    turn_server: Option<TurnServer>,
    filter: P2pFilterStrategy,
    ipv6_only: bool,
    rem_nego_delay: Duration,
    negotiation_timeout: Duration,
}

impl Default for P2pParametersBuilder {
    fn default() -> Self {
        Self {
            ice_role: IceRole::default(),
            sdp_transport: None,
            stun_servers: Vec::new(),
            turn_server: None,
            filter: P2pFilterStrategy::default(),
            ipv6_only: false,
            rem_nego_delay: Duration::ZERO,
            negotiation_timeout: Duration::from_secs(20),
        }
    }
}

impl P2pParametersBuilder {
    pub fn ice_role(mut self, role: IceRole) -> Self {
        self.ice_role = role;
        self
    }

    pub fn sdp_transport(mut self, transport: SdpTransport) -> Self {
        self.sdp_transport = Some(transport);
        self
    }

    pub fn stun_server(mut self, server: impl Into<String>) -> Self {
        self.stun_servers.push(server.into());
        self
    }

    pub fn turn_server(mut self, server: TurnServer) -> Self {
        self.turn_server = Some(server);
        self
    }

    pub fn filter(mut self, filter: P2pFilterStrategy) -> Self {
        self.filter = filter;
        self
    }

    pub fn ipv6_only(mut self, ipv6_only: bool) -> Self {
        self.ipv6_only = ipv6_only;
        self
    }

    pub fn rem_nego_delay(mut self, delay: Duration) -> Self {
        self.rem_nego_delay = delay;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<P2pParameters, ParamsError> {
        match self.stun_servers.len() {
            0 => return Err(ParamsError::NoStunServers),
            1 | 2 => {}
            n => return Err(ParamsError::TooManyStunServers(n)),
        }
        let sdp_transport = self.sdp_transport.ok_or(ParamsError::MissingSdpTransport)?;
        match &sdp_transport {
            SdpTransport::Mqtt {
                broker,
                local_topic,
                remote_topic,
                ..
            } => {
                if broker.is_empty() {
                    return Err(ParamsError::MissingBroker);
                }
                if local_topic.is_empty() {
                    return Err(ParamsError::MissingTopic("local"));
                }
                if remote_topic.is_empty() {
                    return Err(ParamsError::MissingTopic("remote"));
                }
            }
            SdpTransport::Http { endpoint, auth, .. } => {
                if endpoint.is_empty() {
                    return Err(ParamsError::MissingEndpoint);
                }
                if auth.is_empty() {
                    return Err(ParamsError::MissingAuth);
                }
            }
        }
        Ok(P2pParameters {
            ice_role: self.ice_role,
            sdp_transport,
            stun_servers: self.stun_servers,
            turn_server: self.turn_server,
            filter: self.filter,
            ipv6_only: self.ipv6_only,
            rem_nego_delay: self.rem_nego_delay,
            negotiation_timeout: self.negotiation_timeout,
        })
    }
}

/// Local or remote half of an SDP exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub ufrag: String,
    pub pwd: String,
    pub role: IceRole,
    pub candidates: Vec<Candidate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http() -> SdpTransport {
        SdpTransport::Http {
            endpoint: "https://p2p.example.net/sdp".into(),
            auth: HttpAuth::Bearer("token".into()),
            poll_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn stun_server_count_is_validated() {
        let err = P2pParameters::builder().sdp_transport(http()).build().unwrap_err();
        assert_eq!(err, ParamsError::NoStunServers);

        let err = P2pParameters::builder()
            .sdp_transport(http())
            .stun_server("a:3478")
            .stun_server("b:3478")
            .stun_server("c:3478")
            .build()
            .unwrap_err();
        assert_eq!(err, ParamsError::TooManyStunServers(3));
    }

    #[test]
    fn mqtt_requires_broker_and_topics() {
        let mqtt = |broker: &str, local: &str, remote: &str| SdpTransport::Mqtt {
            broker: broker.into(),
            client_id: "app".into(),
            username: None,
            password: None,
            local_topic: local.into(),
            remote_topic: remote.into(),
        };
        let build = |t| {
            P2pParameters::builder()
                .stun_server("stun.example.net:3478")
                .sdp_transport(t)
                .build()
        };
        assert_eq!(build(mqtt("", "a", "b")).unwrap_err(), ParamsError::MissingBroker);
        assert_eq!(
            build(mqtt("tcp://b:1883", "", "b")).unwrap_err(),
            ParamsError::MissingTopic("local")
        );
        assert_eq!(
            build(mqtt("tcp://b:1883", "a", "")).unwrap_err(),
            ParamsError::MissingTopic("remote")
        );
        assert!(build(mqtt("tcp://b:1883", "a", "b")).is_ok());
    }

    #[test]
    fn http_requires_auth() {
        let params = P2pParameters::builder()
            .stun_server("stun.example.net:3478")
            .sdp_transport(SdpTransport::Http {
                endpoint: "https://x".into(),
                auth: HttpAuth::ActivationCode(String::new()),
                poll_timeout: Duration::from_secs(1),
            })
            .build();
        assert_eq!(params.unwrap_err(), ParamsError::MissingAuth);
    }

    #[test]
    fn only_relayed_drops_host_and_reflexive() {
        let strategy = P2pFilterStrategy::OnlyRelayed;
        assert!(strategy.accepts(CandidateType::Relay));
        assert!(!strategy.accepts(CandidateType::Host));
        assert!(!strategy.accepts(CandidateType::Prflx));
        assert!(!strategy.accepts(CandidateType::Srflx));
        assert!(!P2pFilterStrategy::PeerOnly.accepts(CandidateType::Relay));
    }

    #[test]
    fn description_serializes_candidates_as_lines() {
        let desc = SessionDescription {
            ufrag: "abcd".into(),
            pwd: "secretsecretsecret".into(),
            role: IceRole::Controlled,
            candidates: vec![Candidate::host("10.0.0.1:4000".parse().unwrap())],
        };
        let json = serde_json::to_value(&desc).unwrap();
        let line = json["candidates"][0].as_str().unwrap();
        assert!(line.starts_with("candidate:"));
        assert!(line.ends_with("10.0.0.1 4000 typ host"));
        let back: SessionDescription = serde_json::from_value(json).unwrap();
        assert_eq!(back, desc);
    }
}
