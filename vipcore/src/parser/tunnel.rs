use super::{Channel, ParseError, RawUnitMessage, UnitMessageParser};
use crate::types::call::ConnError;
use crate::types::events::{Event, EventPayload};
use serde::Deserialize;

#[derive(Deserialize, Default)]
struct TunnelClosed {
    #[serde(default)]
    error: Option<ConnError>,
}

#[derive(Deserialize)]
struct ConnectionError {
    error: ConnError,
}

/// Parser for tunnel / channel management messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct TunnelMessageParser;

impl UnitMessageParser for TunnelMessageParser {
    fn channel(&self) -> Channel {
        Channel::Tunnel
    }

    fn build_event(&self, raw: &RawUnitMessage) -> Result<Event, ParseError> {
        match raw.tag.as_str() {
            "tunnelOpened" => Ok(raw.unit_event(EventPayload::TunnelOpened)),
            "tunnelClosed" => {
                let p: TunnelClosed = raw.payload()?;
                Ok(raw.unit_event(EventPayload::TunnelClosed { error: p.error }))
            }
            "connectionError" => {
                let p: ConnectionError = raw.payload()?;
                Ok(raw.unit_event(EventPayload::ConnectionError { error: p.error }))
            }
            other => Err(ParseError::UnknownTag(other.to_string())),
        }
    }
}
