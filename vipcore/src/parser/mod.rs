//! Decoding of inbound unit messages into [`Event`]s.
//!
//! Every channel carries JSON objects of the form
//! `{"type": "...", "sysId": 1, "unitId": 2, "fsmId": 3, "payload": {...}}`.
//! Text is healed before parsing: invalid UTF-8 sequences are replaced with
//! U+FFFD so a single corrupt byte from an embedded peer does not cost the
//! whole message.

mod rtsp;
mod tunnel;
mod vip;

pub use rtsp::RtspMessageParser;
pub use tunnel::TunnelMessageParser;
pub use vip::VipMessageParser;

use crate::types::call::{CallFsmStatus, ReleaseCause};
use crate::types::events::{Event, EventPayload};
use crate::types::unit::{FsmId, SysId, UnitId};
use log::{debug, warn};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Logical channel of the multiplexed unit socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Raw media packets, not JSON.
    Media = 0,
    Vip = 1,
    Rtsp = 2,
    Tunnel = 3,
}

impl Channel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Media),
            1 => Some(Self::Vip),
            2 => Some(Self::Rtsp),
            3 => Some(Self::Tunnel),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message type '{0}'")]
    UnknownTag(String),
    #[error("message '{0}' requires an fsmId")]
    MissingFsmId(String),
    #[error("invalid payload for '{tag}': {source}")]
    Payload {
        tag: String,
        source: serde_json::Error,
    },
}

/// Envelope shared by every JSON channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUnitMessage {
    #[serde(rename = "type")]
    pub tag: String,
    pub sys_id: SysId,
    pub unit_id: UnitId,
    #[serde(default)]
    pub fsm_id: Option<FsmId>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawUnitMessage {
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ParseError> {
        let value = if self.payload.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(value).map_err(|source| ParseError::Payload {
            tag: self.tag.clone(),
            source,
        })
    }

    pub fn unit_event(&self, payload: EventPayload) -> Event {
        Event {
            sys_id: self.sys_id,
            unit_id: self.unit_id,
            fsm_id: self.fsm_id,
            payload,
        }
    }

    /// Builds a call-scoped event, failing if the message has no fsm id.
    pub fn fsm_event(&self, payload: EventPayload) -> Result<Event, ParseError> {
        if self.fsm_id.is_none() {
            return Err(ParseError::MissingFsmId(self.tag.clone()));
        }
        Ok(self.unit_event(payload))
    }
}

/// Replaces invalid UTF-8 sequences with U+FFFD.
pub fn heal_utf8(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<RawUnitMessage, ParseError> {
    let text = heal_utf8(bytes);
    if let Cow::Owned(_) = text {
        debug!(target: "Parser", "healed invalid utf-8 in inbound message");
    }
    Ok(serde_json::from_str(&text)?)
}

/// Decoder for one logical channel.
pub trait UnitMessageParser: Send + Sync {
    fn channel(&self) -> Channel;

    /// Maps a decoded envelope to an event.
    fn build_event(&self, raw: &RawUnitMessage) -> Result<Event, ParseError>;

    /// Decodes `bytes` into an event. Malformed input and unknown tags are
    /// logged and yield `None`.
    fn event_from_json(&self, bytes: &[u8]) -> Option<Event> {
        let raw = match decode_envelope(bytes) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(target: "Parser", "{} channel: dropping message: {e}", self.channel());
                return None;
            }
        };
        match self.build_event(&raw) {
            Ok(event) => Some(event),
            Err(ParseError::UnknownTag(tag)) => {
                warn!(target: "Parser", "{} channel: unknown message type '{tag}'", self.channel());
                None
            }
            Err(e) => {
                warn!(target: "Parser", "{} channel: dropping message: {e}", self.channel());
                None
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("a parser is already registered for channel {0}")]
pub struct DuplicateParser(pub Channel);

/// Holds exactly one parser per channel.
#[derive(Default, Clone)]
pub struct ParserRegistry {
    parsers: HashMap<Channel, Arc<dyn UnitMessageParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the VIP, RTSP and tunnel parsers installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for parser in [
            Arc::new(VipMessageParser) as Arc<dyn UnitMessageParser>,
            Arc::new(RtspMessageParser),
            Arc::new(TunnelMessageParser),
        ] {
            // Channels are distinct, registration cannot collide.
            let _ = registry.register(parser);
        }
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn UnitMessageParser>) -> Result<(), DuplicateParser> {
        let channel = parser.channel();
        if self.parsers.contains_key(&channel) {
            return Err(DuplicateParser(channel));
        }
        self.parsers.insert(channel, parser);
        Ok(())
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn UnitMessageParser>> {
        self.parsers.get(&channel)
    }

    pub fn dispatch(&self, channel: Channel, bytes: &[u8]) -> Option<Event> {
        match self.parsers.get(&channel) {
            Some(parser) => parser.event_from_json(bytes),
            None => {
                warn!(target: "Parser", "no parser for channel {channel}, dropping {} bytes", bytes.len());
                None
            }
        }
    }
}

/// Release cause as sent on the wire: either a name or a numeric code.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireCause {
    Name(ReleaseCause),
    Code(i32),
}

impl WireCause {
    pub(crate) fn into_cause(self) -> ReleaseCause {
        match self {
            Self::Name(cause) => cause,
            Self::Code(code) => ReleaseCause::from_code(code),
        }
    }
}

/// Call status reported by firmware that runs its own call FSM. Only the
/// status and cause are used; the rest of the snapshot is ignored.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireStatusReport {
    status: CallFsmStatus,
    cause: Option<WireCause>,
}

impl WireStatusReport {
    pub(crate) fn into_payload(self) -> EventPayload {
        EventPayload::UnitStatusReport {
            status: self.status,
            cause: self.cause.map(WireCause::into_cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healing_replaces_invalid_sequences() {
        let healed = heal_utf8(b"door \xff\xfe one");
        assert_eq!(healed, "door \u{fffd}\u{fffd} one");
        assert!(matches!(heal_utf8(b"plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn registry_rejects_second_parser_for_channel() {
        let mut registry = ParserRegistry::with_defaults();
        let err = registry.register(Arc::new(VipMessageParser)).unwrap_err();
        assert_eq!(err.0, Channel::Vip);
    }

    #[test]
    fn registry_dispatches_by_channel() {
        let registry = ParserRegistry::with_defaults();
        let msg = br#"{"type":"tunnelOpened","sysId":1,"unitId":2}"#;
        assert!(registry.dispatch(Channel::Tunnel, msg).is_some());
        // Same bytes on the VIP channel are an unknown tag there.
        assert!(registry.dispatch(Channel::Vip, msg).is_none());
        assert!(registry.dispatch(Channel::Media, msg).is_none());
    }

    #[test]
    fn envelope_requires_ids() {
        assert!(decode_envelope(br#"{"type":"connected"}"#).is_err());
        assert!(decode_envelope(b"not json").is_err());
        let raw = decode_envelope(br#"{"type":"connected","sysId":1,"unitId":2,"fsmId":3}"#)
            .unwrap();
        assert_eq!(raw.fsm_id, Some(FsmId(3)));
        assert!(raw.payload.is_null());
    }

    #[test]
    fn channel_bytes() {
        for channel in [Channel::Media, Channel::Vip, Channel::Rtsp, Channel::Tunnel] {
            assert_eq!(Channel::from_u8(channel.as_u8()), Some(channel));
        }
        assert_eq!(Channel::from_u8(9), None);
    }
}
