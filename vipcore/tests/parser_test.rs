use vipcore::parser::{Channel, ParserRegistry, heal_utf8};
use vipcore::fsm::FsmInput;
use vipcore::types::{EventKind, EventPayload, FsmId, ReleaseCause};

fn incoming_with_address(address: &[u8]) -> Vec<u8> {
    let mut msg = br#"{"type":"incomingCall","sysId":1,"unitId":2,"fsmId":3,"payload":{"callType":"audio","mainAddress":""#.to_vec();
    msg.extend_from_slice(address);
    msg.extend_from_slice(br#""}}"#);
    msg
}

#[test]
fn test_invalid_utf8_is_replaced_not_rejected() {
    let registry = ParserRegistry::with_defaults();
    let msg = incoming_with_address(b"0001\xff0002");

    let event = registry.dispatch(Channel::Vip, &msg).unwrap();
    assert_eq!(event.fsm_id, Some(FsmId(3)));
    match event.payload {
        EventPayload::IncomingCall { main_address, .. } => {
            assert_eq!(main_address.as_str(), "0001\u{FFFD}0002");
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn test_heal_utf8_borrows_valid_input() {
    assert!(matches!(
        heal_utf8(b"plain"),
        std::borrow::Cow::Borrowed("plain")
    ));
    assert_eq!(heal_utf8(b"a\xc3b"), "a\u{FFFD}b");
}

#[test]
fn test_unknown_tag_and_bad_json_are_dropped() {
    let registry = ParserRegistry::with_defaults();
    assert!(
        registry
            .dispatch(
                Channel::Vip,
                br#"{"type":"somethingNew","sysId":1,"unitId":2,"payload":{}}"#
            )
            .is_none()
    );
    assert!(registry.dispatch(Channel::Vip, b"{not json").is_none());
    assert!(registry.dispatch(Channel::Media, b"{}").is_none());
}

#[test]
fn test_incoming_call_requires_main_address() {
    let registry = ParserRegistry::with_defaults();
    let msg = br#"{"type":"incomingCall","sysId":1,"unitId":2,"fsmId":3,"payload":{"callType":"audio"}}"#;
    assert!(registry.dispatch(Channel::Vip, msg).is_none());
}

#[test]
fn test_release_cause_accepts_names_and_codes() {
    let registry = ParserRegistry::with_defaults();
    let by_name = registry
        .dispatch(
            Channel::Vip,
            br#"{"type":"callRelease","sysId":1,"unitId":2,"fsmId":3,"payload":{"cause":"userBusy"}}"#,
        )
        .unwrap();
    assert_eq!(
        by_name.payload,
        EventPayload::VipCallRelease {
            cause: ReleaseCause::UserBusy
        }
    );

    let code = ReleaseCause::Timeout.code();
    let msg = format!(
        r#"{{"type":"callRelease","sysId":1,"unitId":2,"fsmId":3,"payload":{{"cause":{code}}}}}"#
    );
    let by_code = registry.dispatch(Channel::Vip, msg.as_bytes()).unwrap();
    assert_eq!(
        by_code.payload,
        EventPayload::VipCallRelease {
            cause: ReleaseCause::Timeout
        }
    );
}

#[test]
fn test_firmware_status_change_is_an_input() {
    let registry = ParserRegistry::with_defaults();
    let event = registry
        .dispatch(
            Channel::Vip,
            br#"{"type":"callFsmStatusChange","sysId":1,"unitId":2,"fsmId":3,
                "payload":{"status":"connected","previous":"outAlerting","direction":"out"}}"#,
        )
        .unwrap();
    assert!(event.status_change().is_none());
    assert_eq!(event.kind(), EventKind::UnitStatusReport);
    assert_eq!(
        FsmInput::from_payload(&event.payload),
        Some(FsmInput::Connected)
    );
}
