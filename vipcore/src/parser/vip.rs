use super::{Channel, ParseError, RawUnitMessage, UnitMessageParser, WireCause, WireStatusReport};
use crate::types::call::{CallDirection, CallType, ConnError, MediaRequest, OutDivertActionResult};
use crate::types::events::{Event, EventPayload};
use crate::types::unit::{LogicalAddress, UnitCapability};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingCall {
    #[serde(default)]
    call_type: CallType,
    main_address: LogicalAddress,
    #[serde(default)]
    sub_address: LogicalAddress,
    #[serde(default)]
    capabilities: UnitCapability,
}

#[derive(Deserialize)]
struct CapReport {
    capabilities: UnitCapability,
    #[serde(default)]
    answered: bool,
}

#[derive(Deserialize)]
struct CallRelease {
    cause: WireCause,
}

#[derive(Deserialize)]
struct Diverted {
    direction: CallDirection,
    address: LogicalAddress,
    #[serde(default)]
    result: OutDivertActionResult,
}

#[derive(Deserialize)]
struct ConnectionError {
    error: ConnError,
}

#[derive(Deserialize)]
struct MediaReq {
    request: MediaRequest,
}

/// Parser for the VIP intercom channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct VipMessageParser;

impl UnitMessageParser for VipMessageParser {
    fn channel(&self) -> Channel {
        Channel::Vip
    }

    fn build_event(&self, raw: &RawUnitMessage) -> Result<Event, ParseError> {
        match raw.tag.as_str() {
            "incomingCall" => {
                let p: IncomingCall = raw.payload()?;
                raw.fsm_event(EventPayload::IncomingCall {
                    call_type: p.call_type,
                    main_address: p.main_address,
                    sub_address: p.sub_address,
                    capabilities: p.capabilities,
                })
            }
            "outAlerting" => raw.fsm_event(EventPayload::OutAlerting),
            "capReport" => {
                let p: CapReport = raw.payload()?;
                raw.fsm_event(EventPayload::CapReport {
                    capabilities: p.capabilities,
                    answered: p.answered,
                })
            }
            "connected" => raw.fsm_event(EventPayload::Connected),
            "callRelease" => {
                let p: CallRelease = raw.payload()?;
                raw.fsm_event(EventPayload::VipCallRelease {
                    cause: p.cause.into_cause(),
                })
            }
            "diverted" => {
                let p: Diverted = raw.payload()?;
                raw.fsm_event(EventPayload::VipDiverted {
                    direction: p.direction,
                    address: p.address,
                    result: p.result,
                })
            }
            "mediaRequest" => {
                let p: MediaReq = raw.payload()?;
                raw.fsm_event(EventPayload::HandleMediaReq { request: p.request })
            }
            "connectionError" => {
                let p: ConnectionError = raw.payload()?;
                Ok(raw.unit_event(EventPayload::ConnectionError { error: p.error }))
            }
            "callFsmStatusChange" => {
                let p: WireStatusReport = raw.payload()?;
                raw.fsm_event(p.into_payload())
            }
            other => Err(ParseError::UnknownTag(other.to_string())),
        }
    }
}
