//! ICE candidates in their SDP attribute form (RFC 8839).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

use super::P2pFilterStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CandidateType {
    Host,
    /// Server reflexive, learned from a STUN binding.
    Srflx,
    /// Peer reflexive, learned from a connectivity check.
    Prflx,
    Relay,
}

impl CandidateType {
    /// Type preference from RFC 8445 section 5.1.2.2.
    pub const fn type_preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::Prflx => 110,
            Self::Srflx => 100,
            Self::Relay => 0,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Srflx => "srflx",
            Self::Prflx => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = CandidateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::Srflx),
            "prflx" => Ok(Self::Prflx),
            "relay" => Ok(Self::Relay),
            other => Err(CandidateParseError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateParseError {
    #[error("candidate line is truncated")]
    Truncated,
    #[error("unsupported transport '{0}'")]
    UnsupportedTransport(String),
    #[error("unknown candidate type '{0}'")]
    UnknownType(String),
    #[error("invalid field '{0}'")]
    InvalidField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub foundation: String,
    pub component: u8,
    pub priority: u32,
    pub address: SocketAddr,
    pub kind: CandidateType,
    /// Base address for reflexive and relayed candidates.
    pub related: Option<SocketAddr>,
}

impl Candidate {
    pub fn new(kind: CandidateType, address: SocketAddr, related: Option<SocketAddr>) -> Self {
        let local_pref = if address.is_ipv6() { 65535 } else { 65534 };
        Self {
            foundation: foundation_for(kind, address.ip()),
            component: 1,
            priority: Self::compute_priority(kind, local_pref, 1),
            address,
            kind,
            related,
        }
    }

    pub fn host(address: SocketAddr) -> Self {
        Self::new(CandidateType::Host, address, None)
    }

    pub fn compute_priority(kind: CandidateType, local_pref: u32, component: u8) -> u32 {
        (kind.type_preference() << 24) + ((local_pref & 0xffff) << 8) + (256 - component as u32)
    }

    pub fn is_relayed(&self) -> bool {
        self.kind == CandidateType::Relay
    }
}

fn foundation_for(kind: CandidateType, ip: IpAddr) -> String {
    // Same type and base IP share a foundation.
    let mut hash: u32 = 0x811c_9dc5;
    for byte in kind.as_str().bytes().chain(ip.to_string().into_bytes()) {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{}", hash % 1_000_000_000)
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} udp {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.kind
        )?;
        if let Some(related) = self.related {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }
        Ok(())
    }
}

impl FromStr for Candidate {
    type Err = CandidateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let line = line.strip_prefix("candidate:").unwrap_or(line);
        let mut parts = line.split_whitespace();
        let mut next = || parts.next().ok_or(CandidateParseError::Truncated);

        let foundation = next()?.to_string();
        let component = next()?
            .parse()
            .map_err(|_| CandidateParseError::InvalidField("component"))?;
        let transport = next()?;
        if !transport.eq_ignore_ascii_case("udp") {
            return Err(CandidateParseError::UnsupportedTransport(transport.to_string()));
        }
        let priority = next()?
            .parse()
            .map_err(|_| CandidateParseError::InvalidField("priority"))?;
        let ip: IpAddr = next()?
            .parse()
            .map_err(|_| CandidateParseError::InvalidField("address"))?;
        let port: u16 = next()?
            .parse()
            .map_err(|_| CandidateParseError::InvalidField("port"))?;
        if next()? != "typ" {
            return Err(CandidateParseError::InvalidField("typ"));
        }
        let kind: CandidateType = next()?.parse()?;

        let mut raddr: Option<IpAddr> = None;
        let mut rport: Option<u16> = None;
        while let Ok(key) = next() {
            let value = next()?;
            match key {
                "raddr" => {
                    raddr = Some(
                        value
                            .parse()
                            .map_err(|_| CandidateParseError::InvalidField("raddr"))?,
                    )
                }
                "rport" => {
                    rport = Some(
                        value
                            .parse()
                            .map_err(|_| CandidateParseError::InvalidField("rport"))?,
                    )
                }
                // Extension attributes (generation, network-id, ...) are ignored.
                _ => {}
            }
        }

        Ok(Self {
            foundation,
            component,
            priority,
            address: SocketAddr::new(ip, port),
            kind,
            related: raddr.zip(rport).map(|(ip, port)| SocketAddr::new(ip, port)),
        })
    }
}

impl Serialize for Candidate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Candidate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let line = String::deserialize(deserializer)?;
        line.parse().map_err(serde::de::Error::custom)
    }
}

/// Prunes `candidates` according to `strategy` before connectivity checks.
pub fn filter_candidates(
    candidates: impl IntoIterator<Item = Candidate>,
    strategy: P2pFilterStrategy,
    ipv6_only: bool,
) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| strategy.accepts(c.kind))
        .filter(|c| !ipv6_only || c.address.is_ipv6())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_relay_candidate() {
        let line = "candidate:842163049 1 udp 16777215 203.0.113.7 3478 typ relay raddr 10.0.0.2 rport 50000";
        let candidate: Candidate = line.parse().unwrap();
        assert_eq!(candidate.kind, CandidateType::Relay);
        assert_eq!(candidate.address, "203.0.113.7:3478".parse().unwrap());
        assert_eq!(candidate.related, Some("10.0.0.2:50000".parse().unwrap()));
        assert_eq!(candidate.to_string(), line);
    }

    #[test]
    fn ignores_extension_attributes() {
        let candidate: Candidate =
            "a=candidate:1 1 UDP 2130706431 192.168.1.4 5000 typ host generation 0"
                .parse()
                .unwrap();
        assert_eq!(candidate.kind, CandidateType::Host);
        assert_eq!(candidate.related, None);
    }

    #[test]
    fn rejects_tcp_and_garbage() {
        assert!(matches!(
            "candidate:1 1 tcp 1 10.0.0.1 9 typ host".parse::<Candidate>(),
            Err(CandidateParseError::UnsupportedTransport(_))
        ));
        assert_eq!(
            "candidate:1 1 udp".parse::<Candidate>(),
            Err(CandidateParseError::Truncated)
        );
        assert!("candidate:1 1 udp 1 10.0.0.1 9 typ bogus".parse::<Candidate>().is_err());
    }

    #[test]
    fn host_outranks_relay() {
        let host = Candidate::host("10.0.0.1:4000".parse().unwrap());
        let relay = Candidate::new(
            CandidateType::Relay,
            "198.51.100.1:3478".parse().unwrap(),
            None,
        );
        assert!(host.priority > relay.priority);
    }

    #[test]
    fn ipv6_only_filter() {
        let v4 = Candidate::host("10.0.0.1:4000".parse().unwrap());
        let v6 = Candidate::host("[2001:db8::1]:4000".parse().unwrap());
        let kept = filter_candidates([v4, v6.clone()], P2pFilterStrategy::All, true);
        assert_eq!(kept, vec![v6]);
    }
}
