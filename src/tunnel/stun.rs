//! STUN (RFC 5389) messages for candidate gathering and ICE connectivity
//! checks, plus the TURN (RFC 5766) methods: Allocate for a relayed
//! candidate, then Refresh, CreatePermission and the Send/Data indications
//! that carry traffic through it (see [`super::turn`]).
//!
//! Short-term credentials (ICE checks) key MESSAGE-INTEGRITY with the peer's
//! password. Long-term credentials (TURN) key it with
//! `MD5(username:realm:password)`.

use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use log::{debug, trace};
use rand::Rng;
use sha1::Sha1;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use vipcore::p2p::{IceRole, TurnServer};

const STUN_MAGIC_COOKIE: u32 = 0x2112A442;
const STUN_FINGERPRINT_XOR: u32 = 0x5354554e;
const STUN_HEADER_SIZE: usize = 20;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Initial retransmission timeout; doubled on each retry.
const INITIAL_RTO: Duration = Duration::from_millis(250);
const MAX_RETRANSMITS: u32 = 4;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StunMessageType {
    BindingRequest = 0x0001,
    BindingResponse = 0x0101,
    BindingErrorResponse = 0x0111,
    AllocateRequest = 0x0003,
    AllocateResponse = 0x0103,
    AllocateErrorResponse = 0x0113,
    RefreshRequest = 0x0004,
    RefreshResponse = 0x0104,
    RefreshErrorResponse = 0x0114,
    CreatePermissionRequest = 0x0008,
    CreatePermissionResponse = 0x0108,
    CreatePermissionErrorResponse = 0x0118,
    SendIndication = 0x0016,
    DataIndication = 0x0017,
}

impl StunMessageType {
    /// Success response type for a request type.
    pub fn success(self) -> Option<Self> {
        Self::try_from(self as u16 | 0x0100).ok()
    }

    /// Error response type for a request type.
    pub fn error(self) -> Option<Self> {
        Self::try_from(self as u16 | 0x0110).ok()
    }
}

impl TryFrom<u16> for StunMessageType {
    type Error = StunError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::BindingRequest),
            0x0101 => Ok(Self::BindingResponse),
            0x0111 => Ok(Self::BindingErrorResponse),
            0x0003 => Ok(Self::AllocateRequest),
            0x0103 => Ok(Self::AllocateResponse),
            0x0113 => Ok(Self::AllocateErrorResponse),
            0x0004 => Ok(Self::RefreshRequest),
            0x0104 => Ok(Self::RefreshResponse),
            0x0114 => Ok(Self::RefreshErrorResponse),
            0x0008 => Ok(Self::CreatePermissionRequest),
            0x0108 => Ok(Self::CreatePermissionResponse),
            0x0118 => Ok(Self::CreatePermissionErrorResponse),
            0x0016 => Ok(Self::SendIndication),
            0x0017 => Ok(Self::DataIndication),
            _ => Err(StunError::InvalidMessageType(value)),
        }
    }
}

mod attr {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const LIFETIME: u16 = 0x000D;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const DATA: u16 = 0x0013;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
    pub const ICE_CONTROLLED: u16 = 0x8029;
    pub const ICE_CONTROLLING: u16 = 0x802A;
}

/// UDP, the only transport requested from TURN servers.
const TRANSPORT_UDP: u8 = 17;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// MAPPED-ADDRESS or XOR-MAPPED-ADDRESS.
    MappedAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    Data(Vec<u8>),
    Username(Vec<u8>),
    MessageIntegrity([u8; 20]),
    ErrorCode { code: u16, reason: String },
    Realm(String),
    Nonce(Vec<u8>),
    RequestedTransport(u8),
    Lifetime(u32),
    Priority(u32),
    UseCandidate,
    IceControlled(u64),
    IceControlling(u64),
    Software(String),
    Fingerprint(u32),
    Unknown { attr_type: u16, data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct StunMessage {
    pub msg_type: StunMessageType,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<StunAttribute>,
    integrity_key: Option<Vec<u8>>,
    include_fingerprint: bool,
}

pub fn new_transaction_id() -> [u8; 12] {
    let mut id = [0u8; 12];
    rand::rng().fill(&mut id);
    id
}

/// Key for long-term credentials.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    md5::compute(format!("{username}:{realm}:{password}")).0
}

/// True when `data` looks like a STUN message rather than a tunnel frame.
pub fn is_stun_packet(data: &[u8]) -> bool {
    data.len() >= STUN_HEADER_SIZE
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == STUN_MAGIC_COOKIE
}

impl StunMessage {
    fn new(msg_type: StunMessageType, transaction_id: [u8; 12]) -> Self {
        Self {
            msg_type,
            transaction_id,
            attributes: Vec::new(),
            integrity_key: None,
            include_fingerprint: true,
        }
    }

    pub fn binding_request(transaction_id: [u8; 12]) -> Self {
        Self::new(StunMessageType::BindingRequest, transaction_id)
    }

    /// Success response reporting the address the request came from.
    pub fn binding_success(transaction_id: [u8; 12], mapped: SocketAddr) -> Self {
        let mut msg = Self::new(StunMessageType::BindingResponse, transaction_id);
        msg.attributes.push(StunAttribute::MappedAddress(mapped));
        msg
    }

    pub fn allocate_request(transaction_id: [u8; 12]) -> Self {
        let mut msg = Self::new(StunMessageType::AllocateRequest, transaction_id);
        msg.attributes
            .push(StunAttribute::RequestedTransport(TRANSPORT_UDP));
        msg
    }

    pub fn refresh_request(transaction_id: [u8; 12], lifetime: Duration) -> Self {
        let mut msg = Self::new(StunMessageType::RefreshRequest, transaction_id);
        msg.attributes
            .push(StunAttribute::Lifetime(lifetime.as_secs() as u32));
        msg
    }

    pub fn create_permission_request(transaction_id: [u8; 12], peers: &[SocketAddr]) -> Self {
        let mut msg = Self::new(StunMessageType::CreatePermissionRequest, transaction_id);
        msg.attributes
            .extend(peers.iter().map(|peer| StunAttribute::XorPeerAddress(*peer)));
        msg
    }

    /// Asks the TURN server to relay `data` to `peer`.
    pub fn send_indication(peer: SocketAddr, data: &[u8]) -> Self {
        Self::new(StunMessageType::SendIndication, new_transaction_id())
            .with_attribute(StunAttribute::XorPeerAddress(peer))
            .with_attribute(StunAttribute::Data(data.to_vec()))
            .with_fingerprint(false)
    }

    /// Delivers `data` relayed from `peer` to the allocation's client.
    pub fn data_indication(peer: SocketAddr, data: &[u8]) -> Self {
        Self::new(StunMessageType::DataIndication, new_transaction_id())
            .with_attribute(StunAttribute::XorPeerAddress(peer))
            .with_attribute(StunAttribute::Data(data.to_vec()))
            .with_fingerprint(false)
    }

    /// Success response to `request`, carrying no attributes yet.
    pub fn success_to(request: &StunMessage) -> Option<Self> {
        Some(Self::new(request.msg_type.success()?, request.transaction_id))
    }

    pub fn error_to(request: &StunMessage, code: u16, reason: &str) -> Option<Self> {
        let mut msg = Self::new(request.msg_type.error()?, request.transaction_id);
        msg.attributes.push(StunAttribute::ErrorCode {
            code,
            reason: reason.to_string(),
        });
        Some(msg)
    }

    pub fn with_attribute(mut self, attribute: StunAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_username(mut self, username: &[u8]) -> Self {
        self.attributes
            .push(StunAttribute::Username(username.to_vec()));
        self
    }

    pub fn with_realm(mut self, realm: &str) -> Self {
        self.attributes.push(StunAttribute::Realm(realm.to_string()));
        self
    }

    pub fn with_nonce(mut self, nonce: &[u8]) -> Self {
        self.attributes.push(StunAttribute::Nonce(nonce.to_vec()));
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.attributes.push(StunAttribute::Priority(priority));
        self
    }

    pub fn with_ice_role(mut self, role: IceRole, tie_breaker: u64) -> Self {
        self.attributes.push(match role {
            IceRole::Controlling => StunAttribute::IceControlling(tie_breaker),
            IceRole::Controlled => StunAttribute::IceControlled(tie_breaker),
        });
        self
    }

    pub fn with_use_candidate(mut self) -> Self {
        self.attributes.push(StunAttribute::UseCandidate);
        self
    }

    /// Key for MESSAGE-INTEGRITY, computed when the message is encoded.
    pub fn with_integrity_key(mut self, key: &[u8]) -> Self {
        self.integrity_key = Some(key.to_vec());
        self
    }

    pub fn with_fingerprint(mut self, include: bool) -> Self {
        self.include_fingerprint = include;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut attrs_buf = Vec::new();

        for attribute in &self.attributes {
            match attribute {
                StunAttribute::MappedAddress(addr) => {
                    let data = self.xor_address(*addr);
                    encode_attribute(&mut attrs_buf, attr::XOR_MAPPED_ADDRESS, &data);
                }
                StunAttribute::XorRelayedAddress(addr) => {
                    let data = self.xor_address(*addr);
                    encode_attribute(&mut attrs_buf, attr::XOR_RELAYED_ADDRESS, &data);
                }
                StunAttribute::XorPeerAddress(addr) => {
                    let data = self.xor_address(*addr);
                    encode_attribute(&mut attrs_buf, attr::XOR_PEER_ADDRESS, &data);
                }
                StunAttribute::Data(data) => {
                    encode_attribute(&mut attrs_buf, attr::DATA, data);
                }
                StunAttribute::Username(data) => {
                    encode_attribute(&mut attrs_buf, attr::USERNAME, data);
                }
                StunAttribute::ErrorCode { code, reason } => {
                    let mut data = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
                    data.extend_from_slice(reason.as_bytes());
                    encode_attribute(&mut attrs_buf, attr::ERROR_CODE, &data);
                }
                StunAttribute::Realm(realm) => {
                    encode_attribute(&mut attrs_buf, attr::REALM, realm.as_bytes());
                }
                StunAttribute::Nonce(nonce) => {
                    encode_attribute(&mut attrs_buf, attr::NONCE, nonce);
                }
                StunAttribute::RequestedTransport(protocol) => {
                    encode_attribute(
                        &mut attrs_buf,
                        attr::REQUESTED_TRANSPORT,
                        &[*protocol, 0, 0, 0],
                    );
                }
                StunAttribute::Lifetime(secs) => {
                    encode_attribute(&mut attrs_buf, attr::LIFETIME, &secs.to_be_bytes());
                }
                StunAttribute::Priority(priority) => {
                    encode_attribute(&mut attrs_buf, attr::PRIORITY, &priority.to_be_bytes());
                }
                StunAttribute::UseCandidate => {
                    encode_attribute(&mut attrs_buf, attr::USE_CANDIDATE, &[]);
                }
                StunAttribute::IceControlled(tie_breaker) => {
                    encode_attribute(
                        &mut attrs_buf,
                        attr::ICE_CONTROLLED,
                        &tie_breaker.to_be_bytes(),
                    );
                }
                StunAttribute::IceControlling(tie_breaker) => {
                    encode_attribute(
                        &mut attrs_buf,
                        attr::ICE_CONTROLLING,
                        &tie_breaker.to_be_bytes(),
                    );
                }
                StunAttribute::Software(name) => {
                    encode_attribute(&mut attrs_buf, attr::SOFTWARE, name.as_bytes());
                }
                // Computed below.
                StunAttribute::MessageIntegrity(_) | StunAttribute::Fingerprint(_) => {}
                StunAttribute::Unknown { attr_type, data } => {
                    encode_attribute(&mut attrs_buf, *attr_type, data);
                }
            }
        }

        // The HMAC covers the header with its length pointing past
        // MESSAGE-INTEGRITY, excluding FINGERPRINT.
        if let Some(key) = &self.integrity_key {
            let input = self.header_with_body(attrs_buf.len() + 24, &attrs_buf);
            let mac = hmac_sha1(key, &input);
            encode_attribute(&mut attrs_buf, attr::MESSAGE_INTEGRITY, &mac);
        }

        if self.include_fingerprint {
            let input = self.header_with_body(attrs_buf.len() + 8, &attrs_buf);
            let crc = CRC32.checksum(&input) ^ STUN_FINGERPRINT_XOR;
            encode_attribute(&mut attrs_buf, attr::FINGERPRINT, &crc.to_be_bytes());
        }

        self.header_with_body(attrs_buf.len(), &attrs_buf)
    }

    fn header_with_body(&self, declared_len: usize, attrs: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STUN_HEADER_SIZE + attrs.len());
        buf.extend_from_slice(&(self.msg_type as u16).to_be_bytes());
        buf.extend_from_slice(&(declared_len as u16).to_be_bytes());
        buf.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);
        buf.extend_from_slice(attrs);
        buf
    }

    fn xor_address(&self, addr: SocketAddr) -> Vec<u8> {
        let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
        let port = addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        let mut data = vec![0];
        match addr.ip() {
            IpAddr::V4(ip) => {
                data.push(0x01);
                data.extend_from_slice(&port.to_be_bytes());
                data.extend(ip.octets().iter().zip(cookie).map(|(b, c)| b ^ c));
            }
            IpAddr::V6(ip) => {
                data.push(0x02);
                data.extend_from_slice(&port.to_be_bytes());
                let mask = cookie.iter().chain(self.transaction_id.iter());
                data.extend(ip.octets().iter().zip(mask).map(|(b, m)| b ^ m));
            }
        }
        data
    }

    pub fn decode(data: &[u8]) -> Result<Self, StunError> {
        if data.len() < STUN_HEADER_SIZE {
            return Err(StunError::TooShort(data.len()));
        }

        let msg_type = StunMessageType::try_from(u16::from_be_bytes([data[0], data[1]]))?;
        let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != STUN_MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(cookie));
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        if data.len() < STUN_HEADER_SIZE + msg_len {
            return Err(StunError::TooShort(data.len()));
        }

        let mut attributes = Vec::new();
        let mut offset = STUN_HEADER_SIZE;
        let end = STUN_HEADER_SIZE + msg_len;

        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;
            if offset + attr_len > end {
                return Err(StunError::InvalidAttribute);
            }
            let value = &data[offset..offset + attr_len];

            let attribute = match attr_type {
                attr::MAPPED_ADDRESS => {
                    StunAttribute::MappedAddress(parse_address(value, false, &transaction_id)?)
                }
                attr::XOR_MAPPED_ADDRESS => {
                    StunAttribute::MappedAddress(parse_address(value, true, &transaction_id)?)
                }
                attr::XOR_RELAYED_ADDRESS => {
                    StunAttribute::XorRelayedAddress(parse_address(value, true, &transaction_id)?)
                }
                attr::XOR_PEER_ADDRESS => {
                    StunAttribute::XorPeerAddress(parse_address(value, true, &transaction_id)?)
                }
                attr::DATA => StunAttribute::Data(value.to_vec()),
                attr::USERNAME => StunAttribute::Username(value.to_vec()),
                attr::MESSAGE_INTEGRITY => {
                    let mac: [u8; 20] = value
                        .try_into()
                        .map_err(|_| StunError::InvalidAttribute)?;
                    StunAttribute::MessageIntegrity(mac)
                }
                attr::ERROR_CODE => {
                    if value.len() < 4 {
                        return Err(StunError::InvalidAttribute);
                    }
                    StunAttribute::ErrorCode {
                        code: (value[2] & 0x07) as u16 * 100 + value[3] as u16,
                        reason: String::from_utf8_lossy(&value[4..]).into_owned(),
                    }
                }
                attr::REALM => StunAttribute::Realm(String::from_utf8_lossy(value).into_owned()),
                attr::NONCE => StunAttribute::Nonce(value.to_vec()),
                attr::REQUESTED_TRANSPORT if !value.is_empty() => {
                    StunAttribute::RequestedTransport(value[0])
                }
                attr::LIFETIME => StunAttribute::Lifetime(read_u32(value)?),
                attr::PRIORITY => StunAttribute::Priority(read_u32(value)?),
                attr::USE_CANDIDATE => StunAttribute::UseCandidate,
                attr::ICE_CONTROLLED => StunAttribute::IceControlled(read_u64(value)?),
                attr::ICE_CONTROLLING => StunAttribute::IceControlling(read_u64(value)?),
                attr::SOFTWARE => {
                    StunAttribute::Software(String::from_utf8_lossy(value).into_owned())
                }
                attr::FINGERPRINT => StunAttribute::Fingerprint(read_u32(value)?),
                _ => StunAttribute::Unknown {
                    attr_type,
                    data: value.to_vec(),
                },
            };
            attributes.push(attribute);

            offset += attr_len;
            offset += (4 - (attr_len % 4)) % 4;
        }

        Ok(Self {
            msg_type,
            transaction_id,
            attributes,
            integrity_key: None,
            include_fingerprint: false,
        })
    }

    /// Checks MESSAGE-INTEGRITY of the raw message `data` against `key`.
    pub fn verify_integrity(data: &[u8], key: &[u8]) -> bool {
        let Some(mi_offset) = find_attribute(data, attr::MESSAGE_INTEGRITY) else {
            return false;
        };
        if mi_offset + 24 > data.len() {
            return false;
        }
        let mut input = data[..mi_offset].to_vec();
        let declared = (mi_offset + 24 - STUN_HEADER_SIZE) as u16;
        input[2..4].copy_from_slice(&declared.to_be_bytes());

        let mut mac = HmacSha1::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(&input);
        mac.verify_slice(&data[mi_offset + 4..mi_offset + 24]).is_ok()
    }

    fn find<T>(&self, f: impl Fn(&StunAttribute) -> Option<T>) -> Option<T> {
        self.attributes.iter().find_map(f)
    }

    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.find(|a| match a {
            StunAttribute::MappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.find(|a| match a {
            StunAttribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// First XOR-PEER-ADDRESS; permission requests may carry several.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.find(|a| match a {
            StunAttribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.attributes
            .iter()
            .filter_map(|a| match a {
                StunAttribute::XorPeerAddress(addr) => Some(*addr),
                _ => None,
            })
            .collect()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Data(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn username(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Username(name) => Some(name.as_slice()),
            _ => None,
        })
    }

    pub fn realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Realm(realm) => Some(realm.as_str()),
            _ => None,
        })
    }

    pub fn nonce(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Nonce(nonce) => Some(nonce.as_slice()),
            _ => None,
        })
    }

    pub fn lifetime(&self) -> Option<u32> {
        self.find(|a| match a {
            StunAttribute::Lifetime(secs) => Some(*secs),
            _ => None,
        })
    }

    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    pub fn has_use_candidate(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a, StunAttribute::UseCandidate))
    }

    pub fn is_success(&self) -> bool {
        (self.msg_type as u16) & 0x0110 == 0x0100
    }

    pub fn is_error(&self) -> bool {
        (self.msg_type as u16) & 0x0110 == 0x0110
    }
}

fn encode_attribute(buf: &mut Vec<u8>, attr_type: u16, data: &[u8]) {
    buf.extend_from_slice(&attr_type.to_be_bytes());
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
    let padding = (4 - (data.len() % 4)) % 4;
    buf.extend(std::iter::repeat_n(0u8, padding));
}

fn hmac_sha1(key: &[u8], input: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(input);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn read_u32(value: &[u8]) -> Result<u32, StunError> {
    let bytes: [u8; 4] = value
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(StunError::InvalidAttribute)?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(value: &[u8]) -> Result<u64, StunError> {
    let bytes: [u8; 8] = value
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or(StunError::InvalidAttribute)?;
    Ok(u64::from_be_bytes(bytes))
}

/// Offset of the first attribute of type `wanted` in a raw message.
fn find_attribute(data: &[u8], wanted: u16) -> Option<usize> {
    if data.len() < STUN_HEADER_SIZE {
        return None;
    }
    let end = (STUN_HEADER_SIZE + u16::from_be_bytes([data[2], data[3]]) as usize).min(data.len());
    let mut offset = STUN_HEADER_SIZE;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        if attr_type == wanted {
            return Some(offset);
        }
        offset += 4 + attr_len + (4 - (attr_len % 4)) % 4;
    }
    None
}

fn parse_address(
    data: &[u8],
    xored: bool,
    transaction_id: &[u8; 12],
) -> Result<SocketAddr, StunError> {
    if data.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }
    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if xored {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match data[1] {
        0x01 => {
            let mut octets: [u8; 4] = data
                .get(4..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunError::InvalidAttribute)?;
            if xored {
                for (b, c) in octets.iter_mut().zip(cookie) {
                    *b ^= c;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            let mut octets: [u8; 16] = data
                .get(4..20)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunError::InvalidAttribute)?;
            if xored {
                let mask = cookie.iter().chain(transaction_id.iter());
                for (b, m) in octets.iter_mut().zip(mask) {
                    *b ^= m;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute),
    };
    Ok(SocketAddr::new(ip, port))
}

#[derive(Debug, thiserror::Error)]
pub enum StunError {
    #[error("STUN message too short: {0} bytes")]
    TooShort(usize),
    #[error("Invalid STUN message type: 0x{0:04x}")]
    InvalidMessageType(u16),
    #[error("Invalid STUN magic cookie: 0x{0:08x}")]
    InvalidMagicCookie(u32),
    #[error("Invalid STUN attribute")]
    InvalidAttribute,
    #[error("STUN error response: {0} - {1}")]
    ServerError(u16, String),
    #[error("Response missing {0}")]
    MissingAttribute(&'static str),
    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("Timeout waiting for STUN response")]
    Timeout,
}

/// Long-term credentials that answered a server's challenge. Later
/// requests on the same allocation are signed with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongTermAuth {
    pub username: String,
    pub realm: String,
    pub nonce: Vec<u8>,
    key: [u8; 16],
}

impl LongTermAuth {
    pub fn new(username: &str, realm: &str, nonce: &[u8], password: &str) -> Self {
        Self {
            username: username.to_string(),
            realm: realm.to_string(),
            nonce: nonce.to_vec(),
            key: long_term_key(username, realm, password),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn sign(&self, msg: StunMessage) -> StunMessage {
        msg.with_username(self.username.as_bytes())
            .with_realm(&self.realm)
            .with_nonce(&self.nonce)
            .with_integrity_key(&self.key)
    }
}

/// Relay allocation granted by a TURN server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub server: SocketAddr,
    pub relayed: SocketAddr,
    pub mapped: Option<SocketAddr>,
    pub lifetime: Duration,
    /// `None` when the server granted the allocation without a challenge.
    pub auth: Option<LongTermAuth>,
}

/// Sends `request` to `server` and waits for the response with the same
/// transaction id, retransmitting with exponential backoff.
pub async fn transact(
    socket: &UdpSocket,
    server: SocketAddr,
    request: &StunMessage,
) -> Result<StunMessage, StunError> {
    let bytes = request.encode();
    let mut rto = INITIAL_RTO;
    let mut buf = [0u8; 1500];

    for attempt in 0..MAX_RETRANSMITS {
        trace!(
            target: "Tunnel/Stun",
            "--> {:?} {} to {server} (attempt {})",
            request.msg_type,
            hex::encode(request.transaction_id),
            attempt + 1
        );
        socket.send_to(&bytes, server).await?;

        let deadline = tokio::time::Instant::now() + rto;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let Ok(received) = timeout(remaining, socket.recv_from(&mut buf)).await else {
                break;
            };
            let (len, from) = received?;
            if from != server || !is_stun_packet(&buf[..len]) {
                continue;
            }
            match StunMessage::decode(&buf[..len]) {
                Ok(msg) if msg.transaction_id == request.transaction_id => return Ok(msg),
                Ok(_) => continue,
                Err(e) => debug!(target: "Tunnel/Stun", "Ignoring malformed STUN from {from}: {e}"),
            }
        }
        rto *= 2;
    }
    Err(StunError::Timeout)
}

/// Learns the server-reflexive address of `socket` from a STUN server.
pub async fn binding(socket: &UdpSocket, server: SocketAddr) -> Result<SocketAddr, StunError> {
    let request = StunMessage::binding_request(new_transaction_id());
    let response = transact(socket, server, &request).await?;
    if let Some((code, reason)) = response.error_code() {
        return Err(StunError::ServerError(code, reason.to_string()));
    }
    response
        .mapped_address()
        .ok_or(StunError::MissingAttribute("XOR-MAPPED-ADDRESS"))
}

/// Requests a relay allocation, answering the server's 401 challenge with
/// long-term credentials.
pub async fn allocate(
    socket: &UdpSocket,
    server: SocketAddr,
    credentials: &TurnServer,
) -> Result<Allocation, StunError> {
    let first = transact(
        socket,
        server,
        &StunMessage::allocate_request(new_transaction_id()),
    )
    .await?;

    let (response, auth) = match first.error_code() {
        None if first.is_success() => (first, None),
        Some((401, _)) => {
            let realm = first.realm().ok_or(StunError::MissingAttribute("REALM"))?;
            let nonce = first.nonce().ok_or(StunError::MissingAttribute("NONCE"))?;
            let auth = LongTermAuth::new(&credentials.username, realm, nonce, &credentials.password);
            let request = auth.sign(StunMessage::allocate_request(new_transaction_id()));
            (transact(socket, server, &request).await?, Some(auth))
        }
        Some((code, reason)) => return Err(StunError::ServerError(code, reason.to_string())),
        None => return Err(StunError::MissingAttribute("ERROR-CODE")),
    };

    if let Some((code, reason)) = response.error_code() {
        return Err(StunError::ServerError(code, reason.to_string()));
    }
    let relayed = response
        .relayed_address()
        .ok_or(StunError::MissingAttribute("XOR-RELAYED-ADDRESS"))?;
    Ok(Allocation {
        server,
        relayed,
        mapped: response.mapped_address(),
        lifetime: Duration::from_secs(response.lifetime().unwrap_or(600) as u64),
        auth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_request_encoding() {
        let tid = [1u8; 12];
        let encoded = StunMessage::binding_request(tid).encode();

        assert_eq!(&encoded[0..2], &[0x00, 0x01]);
        assert_eq!(&encoded[4..8], &STUN_MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&encoded[8..20], &tid);
        // FINGERPRINT only
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), 8);
        assert!(is_stun_packet(&encoded));
    }

    #[test]
    fn test_xor_mapped_address_v4_and_v6() {
        for addr in ["192.0.2.1:32853", "[2001:db8::1]:443"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let tid = new_transaction_id();
            let encoded = StunMessage::binding_success(tid, addr).encode();
            let decoded = StunMessage::decode(&encoded).unwrap();
            assert!(decoded.is_success());
            assert_eq!(decoded.transaction_id, tid);
            assert_eq!(decoded.mapped_address(), Some(addr));
        }
    }

    #[test]
    fn test_message_integrity_verifies_with_right_key() {
        let msg = StunMessage::binding_request([7u8; 12])
            .with_username(b"remote:local")
            .with_priority(1_862_270_975)
            .with_ice_role(IceRole::Controlling, 42)
            .with_use_candidate()
            .with_integrity_key(b"remote-password");
        let encoded = msg.encode();

        assert!(StunMessage::verify_integrity(&encoded, b"remote-password"));
        assert!(!StunMessage::verify_integrity(&encoded, b"wrong"));

        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.username(), Some(&b"remote:local"[..]));
        assert!(decoded.has_use_candidate());
        assert!(
            decoded
                .attributes
                .contains(&StunAttribute::IceControlling(42))
        );
    }

    #[test]
    fn test_error_code_decoding() {
        let mut msg = StunMessage::new(StunMessageType::AllocateErrorResponse, [2u8; 12]);
        msg.attributes.push(StunAttribute::ErrorCode {
            code: 401,
            reason: "Unauthorized".into(),
        });
        msg.attributes.push(StunAttribute::Realm("example.org".into()));
        msg.attributes.push(StunAttribute::Nonce(b"abc123".to_vec()));

        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert!(decoded.is_error());
        assert_eq!(decoded.error_code(), Some((401, "Unauthorized")));
        assert_eq!(decoded.realm(), Some("example.org"));
        assert_eq!(decoded.nonce(), Some(&b"abc123"[..]));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            StunMessage::decode(&[0u8; 10]),
            Err(StunError::TooShort(10))
        ));
        let mut bytes = StunMessage::binding_request([0u8; 12]).encode();
        bytes[4] = 0;
        assert!(matches!(
            StunMessage::decode(&bytes),
            Err(StunError::InvalidMagicCookie(_))
        ));
        assert!(!is_stun_packet(&[1, 0, 0, 3, 0xAA]));
    }

    #[test]
    fn test_turn_indications_carry_peer_and_data() {
        let peer: SocketAddr = "198.51.100.7:40000".parse().unwrap();
        let bytes = StunMessage::send_indication(peer, b"\x01\x00\x02hi").encode();
        assert!(is_stun_packet(&bytes));
        let decoded = StunMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.msg_type, StunMessageType::SendIndication);
        assert!(!decoded.is_success() && !decoded.is_error());
        assert_eq!(decoded.peer_address(), Some(peer));
        assert_eq!(decoded.data(), Some(&b"\x01\x00\x02hi"[..]));
    }

    #[test]
    fn test_permission_request_lists_every_peer_and_is_signed() {
        let peers: Vec<SocketAddr> = vec![
            "192.0.2.10:5000".parse().unwrap(),
            "[2001:db8::9]:6000".parse().unwrap(),
        ];
        let auth = LongTermAuth::new("user", "example.org", b"nonce-1", "secret");
        let request = auth.sign(StunMessage::create_permission_request([3u8; 12], &peers));
        let bytes = request.encode();
        assert!(StunMessage::verify_integrity(&bytes, auth.key()));

        let decoded = StunMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.peer_addresses(), peers);
        assert_eq!(decoded.realm(), Some("example.org"));

        let answer = StunMessage::error_to(&decoded, 438, "Stale Nonce").unwrap();
        assert_eq!(answer.msg_type, StunMessageType::CreatePermissionErrorResponse);
        assert!(answer.is_error());
        let ok = StunMessage::success_to(&decoded).unwrap();
        assert_eq!(ok.msg_type, StunMessageType::CreatePermissionResponse);
        assert!(ok.is_success());
        assert!(StunMessage::success_to(&StunMessage::send_indication(peers[0], b"")).is_none());
    }

    #[test]
    fn test_long_term_key() {
        // RFC 5769 section 2.4 credentials.
        let key = long_term_key("\u{30DE}\u{30C8}\u{30EA}\u{30C3}\u{30AF}\u{30B9}", "example.org", "TheMatrIX");
        assert_eq!(hex::encode(key).len(), 32);
        assert_ne!(key, long_term_key("user", "example.org", "TheMatrIX"));
    }

    #[tokio::test]
    async fn test_binding_against_local_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();
            let response = StunMessage::binding_success(request.transaction_id, from);
            server.send_to(&response.encode(), from).await.unwrap();
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mapped = binding(&client, server_addr).await.unwrap();
        assert_eq!(mapped, client.local_addr().unwrap());
    }
}
