use super::{Channel, ParseError, RawUnitMessage, UnitMessageParser, WireStatusReport};
use crate::types::call::MediaRequest;
use crate::types::events::{Event, EventPayload, RtspEvent};
use serde::Deserialize;

#[derive(Deserialize)]
struct MediaReq {
    request: MediaRequest,
}

/// Parser for camera / stream units (TVCC, RTSP, playback).
#[derive(Debug, Default, Clone, Copy)]
pub struct RtspMessageParser;

impl UnitMessageParser for RtspMessageParser {
    fn channel(&self) -> Channel {
        Channel::Rtsp
    }

    fn build_event(&self, raw: &RawUnitMessage) -> Result<Event, ParseError> {
        match raw.tag.as_str() {
            "rtspFsmEvent" => {
                let event: RtspEvent = raw.payload()?;
                raw.fsm_event(EventPayload::RtspFsmEvent { event })
            }
            "mediaRequest" => {
                let p: MediaReq = raw.payload()?;
                raw.fsm_event(EventPayload::HandleMediaReq { request: p.request })
            }
            "rtspFsmStatusChange" => {
                let p: WireStatusReport = raw.payload()?;
                raw.fsm_event(p.into_payload())
            }
            other => Err(ParseError::UnknownTag(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::call::ReleaseCause;

    #[test]
    fn parses_rtsp_events() {
        let parser = RtspMessageParser;
        let event = parser
            .event_from_json(
                br#"{"type":"rtspFsmEvent","sysId":2,"unitId":7,"fsmId":1,"payload":{"kind":"teardown","cause":"noAnswer"}}"#,
            )
            .unwrap();
        assert_eq!(
            event.payload,
            EventPayload::RtspFsmEvent {
                event: RtspEvent::Teardown {
                    cause: ReleaseCause::NoAnswer
                }
            }
        );

        let playing = parser
            .event_from_json(br#"{"type":"rtspFsmEvent","sysId":2,"unitId":7,"fsmId":1,"payload":{"kind":"playing"}}"#)
            .unwrap();
        assert_eq!(
            playing.payload,
            EventPayload::RtspFsmEvent {
                event: RtspEvent::Playing
            }
        );
    }

    #[test]
    fn vip_tags_are_unknown_here() {
        assert!(
            RtspMessageParser
                .event_from_json(br#"{"type":"incomingCall","sysId":2,"unitId":7,"fsmId":1}"#)
                .is_none()
        );
    }
}
