//! Client side of a TURN allocation once it is granted.
//!
//! Peers must be given a permission before the server relays anything from
//! them. Outbound datagrams go to the server wrapped in Send indications and
//! inbound ones arrive as Data indications; [`TurnRelay::inbound`] unwraps
//! them before anything else looks at the datagram. Permissions expire after
//! five minutes, so an open tunnel sends [`TurnRelay::refresh_requests`]
//! well before that.

use super::stun::{
    self, Allocation, LongTermAuth, StunError, StunMessage, StunMessageType, is_stun_packet,
    new_transaction_id,
};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;

/// How often an open tunnel renews its permissions and allocation.
pub const RELAY_REFRESH_INTERVAL: Duration = Duration::from_secs(240);

const STALE_NONCE: u16 = 438;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Renewal {
    Permission,
    Allocation,
}

/// A datagram received from the TURN server.
#[derive(Debug)]
pub enum RelayInbound {
    /// Payload a peer sent to our relayed address.
    Data { peer: SocketAddr, data: Vec<u8> },
    /// Response to one of our own requests.
    Control(StunMessage),
}

pub struct TurnRelay {
    allocation: Allocation,
    auth: Mutex<Option<LongTermAuth>>,
    peers: Mutex<Vec<SocketAddr>>,
    outstanding: Mutex<HashMap<[u8; 12], Renewal>>,
}

impl TurnRelay {
    pub fn new(allocation: Allocation) -> Self {
        Self {
            auth: Mutex::new(allocation.auth.clone()),
            allocation,
            peers: Mutex::new(Vec::new()),
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.allocation.server
    }

    pub fn relayed(&self) -> SocketAddr {
        self.allocation.relayed
    }

    /// Peers currently holding a permission.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    fn sign(&self, msg: StunMessage) -> StunMessage {
        match &*self.auth.lock().expect("Mutex should not be poisoned") {
            Some(auth) => auth.sign(msg),
            None => msg,
        }
    }

    /// Takes a fresh nonce from a 438 answer. Returns whether one was found.
    fn renew_nonce(&self, answer: &StunMessage) -> bool {
        let Some(nonce) = answer.nonce() else {
            return false;
        };
        match &mut *self.auth.lock().expect("Mutex should not be poisoned") {
            Some(auth) => {
                auth.nonce = nonce.to_vec();
                true
            }
            None => false,
        }
    }

    /// Installs permissions for `peers`, retrying once on a stale nonce.
    /// Must not run while another task reads `socket`.
    pub async fn create_permission(
        &self,
        socket: &UdpSocket,
        peers: &[SocketAddr],
    ) -> Result<(), StunError> {
        for _ in 0..2 {
            let request =
                self.sign(StunMessage::create_permission_request(new_transaction_id(), peers));
            let response = stun::transact(socket, self.server(), &request).await?;
            match response.error_code() {
                None if response.is_success() => {
                    let mut granted = self.peers.lock().expect("Mutex should not be poisoned");
                    for peer in peers {
                        if !granted.contains(peer) {
                            granted.push(*peer);
                        }
                    }
                    debug!(target: "Tunnel/Turn", "Permission for {} peer(s) via {}", peers.len(), self.server());
                    return Ok(());
                }
                Some((STALE_NONCE, _)) if self.renew_nonce(&response) => continue,
                Some((code, reason)) => return Err(StunError::ServerError(code, reason.to_string())),
                None => return Err(StunError::MissingAttribute("ERROR-CODE")),
            }
        }
        Err(StunError::ServerError(STALE_NONCE, "Stale Nonce".into()))
    }

    /// Wraps `data` for `peer` in a Send indication.
    pub fn wrap(&self, peer: SocketAddr, data: &[u8]) -> Vec<u8> {
        StunMessage::send_indication(peer, data).encode()
    }

    pub async fn send_to(
        &self,
        socket: &UdpSocket,
        data: &[u8],
        peer: SocketAddr,
    ) -> std::io::Result<()> {
        socket.send_to(&self.wrap(peer, data), self.server()).await?;
        Ok(())
    }

    /// Classifies a datagram. `None` when it did not come from the server.
    pub fn inbound(&self, data: &[u8], from: SocketAddr) -> Option<RelayInbound> {
        if from != self.server() || !is_stun_packet(data) {
            return None;
        }
        let msg = match StunMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(target: "Tunnel/Turn", "Malformed message from {from}: {e}");
                return None;
            }
        };
        if msg.msg_type != StunMessageType::DataIndication {
            return Some(RelayInbound::Control(msg));
        }
        match (msg.peer_address(), msg.data()) {
            (Some(peer), Some(data)) => Some(RelayInbound::Data {
                peer,
                data: data.to_vec(),
            }),
            _ => {
                debug!(target: "Tunnel/Turn", "Data indication without peer or data");
                None
            }
        }
    }

    fn renewal(&self, kind: Renewal) -> Vec<u8> {
        let tid = new_transaction_id();
        let request = match kind {
            Renewal::Permission => StunMessage::create_permission_request(tid, &self.peers()),
            Renewal::Allocation => StunMessage::refresh_request(tid, self.allocation.lifetime),
        };
        self.outstanding
            .lock()
            .expect("Mutex should not be poisoned")
            .insert(tid, kind);
        self.sign(request).encode()
    }

    /// Requests renewing the permissions and the allocation. Their answers
    /// come back through [`Self::inbound`] as control messages.
    pub fn refresh_requests(&self) -> Vec<Vec<u8>> {
        let mut requests = vec![self.renewal(Renewal::Allocation)];
        if !self.peers().is_empty() {
            requests.push(self.renewal(Renewal::Permission));
        }
        requests
    }

    /// Handles the answer to a renewal. Returns a request to resend when
    /// the server asked for a fresh nonce.
    pub fn on_control(&self, msg: &StunMessage) -> Option<Vec<u8>> {
        let kind = self
            .outstanding
            .lock()
            .expect("Mutex should not be poisoned")
            .remove(&msg.transaction_id)?;
        match msg.error_code() {
            None => {
                trace!(target: "Tunnel/Turn", "{kind:?} renewed");
                None
            }
            Some((STALE_NONCE, _)) if self.renew_nonce(msg) => Some(self.renewal(kind)),
            Some((code, reason)) => {
                warn!(target: "Tunnel/Turn", "{kind:?} renewal refused: {code} {reason}");
                None
            }
        }
    }
}

impl std::fmt::Debug for TurnRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnRelay")
            .field("server", &self.server())
            .field("relayed", &self.relayed())
            .field("peers", &self.peers())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(auth: Option<LongTermAuth>) -> TurnRelay {
        TurnRelay::new(Allocation {
            server: "192.0.2.1:3478".parse().unwrap(),
            relayed: "192.0.2.1:50000".parse().unwrap(),
            mapped: None,
            lifetime: Duration::from_secs(600),
            auth,
        })
    }

    #[test]
    fn test_inbound_unwraps_data_from_the_server_only() {
        let relay = relay(None);
        let peer: SocketAddr = "198.51.100.2:7000".parse().unwrap();
        let bytes = StunMessage::data_indication(peer, b"frame").encode();

        match relay.inbound(&bytes, relay.server()) {
            Some(RelayInbound::Data { peer: from, data }) => {
                assert_eq!(from, peer);
                assert_eq!(data, b"frame");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(relay.inbound(&bytes, peer).is_none());
        assert!(relay.inbound(b"\x01\x00\x02{}", relay.server()).is_none());
    }

    #[test]
    fn test_stale_nonce_on_renewal_resends_with_new_nonce() {
        let auth = LongTermAuth::new("user", "realm", b"old", "secret");
        let relay = relay(Some(auth.clone()));
        let requests = relay.refresh_requests();
        // No peers yet, so only the allocation is refreshed.
        assert_eq!(requests.len(), 1);
        let sent = StunMessage::decode(&requests[0]).unwrap();
        assert_eq!(sent.msg_type, StunMessageType::RefreshRequest);
        assert_eq!(sent.nonce(), Some(&b"old"[..]));

        let stale = StunMessage::error_to(&sent, 438, "Stale Nonce")
            .unwrap()
            .with_attribute(stun::StunAttribute::Nonce(b"new".to_vec()));
        let stale = StunMessage::decode(&stale.encode()).unwrap();
        let bytes = relay.on_control(&stale).unwrap();
        assert!(StunMessage::verify_integrity(&bytes, auth.key()));
        let resent = StunMessage::decode(&bytes).unwrap();
        assert_eq!(resent.msg_type, StunMessageType::RefreshRequest);
        assert_eq!(resent.nonce(), Some(&b"new"[..]));

        let ok = StunMessage::success_to(&resent).unwrap();
        assert!(relay.on_control(&ok).is_none());
        // Answers to unknown transactions are ignored.
        assert!(relay.on_control(&ok).is_none());
    }
}
