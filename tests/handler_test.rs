use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use viper_rust::framing::Frame;
use viper_rust::handler::{MediaWiring, PushType};
use viper_rust::media::AudioDevice;
use viper_rust::parser::Channel;
use viper_rust::test_utils::{FakeAudioDevice, MockHttpClient, RecordingTransport};
use viper_rust::tunnel::TransportEvent;
use viper_rust::types::{
    CallType, FsmKey, LogicalAddress, ReleaseCause, StatusChange, UnitCapability,
};
use viper_rust::{
    CallPresenter, CgCallEventCallback, CgCallback, CmgError, ConnectionHandler, ConnectionParams,
    EngineError, ModeFlags, TunnelMode,
};

#[derive(Default)]
struct HostLog {
    entries: Mutex<Vec<String>>,
}

impl HostLog {
    fn push(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    fn has(&self, entry: &str) -> bool {
        self.entries().iter().any(|e| e == entry)
    }
}

impl CgCallback for HostLog {
    fn on_connected(&self) {
        self.push("connected".into());
    }

    fn on_disconnected(&self) {
        self.push("disconnected".into());
    }

    fn on_error(&self, error: CmgError) {
        let kind = match error {
            CmgError::Connection(_) => "connection",
            CmgError::ActivationCode => "activation",
            CmgError::Generic(_) => "generic",
        };
        self.push(format!("error:{kind}"));
    }
}

impl CgCallEventCallback for HostLog {
    fn on_incoming_call(&self, call: FsmKey, change: &StatusChange) {
        self.push(format!("incoming:{call}:{}", change.main_address));
    }

    fn on_answered(&self, call: FsmKey) {
        self.push(format!("answered:{call}"));
    }

    fn on_capabilities(&self, _call: FsmKey, capabilities: UnitCapability) {
        if capabilities.contains(UnitCapability::DOOR_OPEN) {
            self.push("caps:door".into());
        }
    }

    fn on_release(&self, call: FsmKey, cause: ReleaseCause) {
        self.push(format!("release:{call}:{cause:?}"));
    }

    fn on_call_end(&self, call: FsmKey) {
        self.push(format!("end:{call}"));
    }
}

fn params() -> ConnectionParams {
    ConnectionParams::builder()
        .hostname("127.0.0.1")
        .port(5060)
        .activation_code("ABCD-1234")
        .mode(ModeFlags {
            with_ui: true,
            ..ModeFlags::default()
        })
        .build()
        .unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

async fn inject(inbound: &mpsc::Sender<TransportEvent>, json: &'static str) {
    inbound
        .send(TransportEvent::FrameReceived(Frame {
            channel: Channel::Vip,
            payload: Bytes::from_static(json.as_bytes()),
        }))
        .await
        .unwrap();
    settle().await;
}

struct Harness {
    handler: Arc<ConnectionHandler>,
    log: Arc<HostLog>,
    transport: Arc<RecordingTransport>,
    inbound: mpsc::Sender<TransportEvent>,
}

async fn connected(media: Option<MediaWiring>) -> Harness {
    let handler = ConnectionHandler::new(Arc::new(MockHttpClient));
    let log = Arc::new(HostLog::default());
    handler.set_callback(&log);
    handler.set_call_event_callback(&log);
    if let Some(media) = media {
        handler.set_media(media);
    }
    let (transport, inbound, handle) = RecordingTransport::open();
    handler.attach(handle, params()).unwrap();
    settle().await;
    Harness {
        handler,
        log,
        transport,
        inbound,
    }
}

fn commands(transport: &RecordingTransport) -> Vec<String> {
    transport
        .sent_json()
        .iter()
        .filter_map(|v| v["cmd"].as_str().map(str::to_owned))
        .collect()
}

#[tokio::test]
async fn test_attach_brings_up_system_and_unit() {
    let h = connected(None).await;
    assert!(h.handler.is_connected());
    assert_eq!(
        commands(&h.transport),
        vec!["start", "createSystem", "createUnit"]
    );
    let unit = h.handler.unit().unwrap();
    let create_unit = &h.transport.sent_json()[2];
    assert_eq!(create_unit["unitType"], "vip");
    assert_eq!(create_unit["unitId"], unit.unit_id.get());
}

#[tokio::test]
async fn test_incoming_call_answer_and_release() {
    let h = connected(None).await;
    let unit = h.handler.unit().unwrap();

    inject(
        &h.inbound,
        r#"{"type":"incomingCall","sysId":1,"unitId":1,"fsmId":7,
            "payload":{"callType":"audioVideo","mainAddress":"00010002","capabilities":17}}"#,
    )
    .await;
    let call = unit.fsm(viper_rust::types::FsmId::new(7));
    assert!(h.log.has(&format!("incoming:{call}:00010002")));

    h.handler.toggle_answer().unwrap();
    settle().await;
    let answer = h
        .transport
        .sent_json()
        .into_iter()
        .find(|v| v["cmd"] == "answerCall")
        .expect("answerCall sent");
    assert_eq!(answer["fsmId"], 7);
    assert_eq!(answer["callType"], "audioVideo");

    inject(
        &h.inbound,
        r#"{"type":"connected","sysId":1,"unitId":1,"fsmId":7}"#,
    )
    .await;
    assert!(h.log.has(&format!("answered:{call}")));
    assert!(h.log.has("caps:door"));

    // No audio device wired, so there is no session to mute.
    assert_eq!(h.handler.toggle_mute(), Err(EngineError::InvalidState));

    h.handler.open_door(1).unwrap();
    inject(
        &h.inbound,
        r#"{"type":"callRelease","sysId":1,"unitId":1,"fsmId":7,"payload":{"cause":"normal"}}"#,
    )
    .await;
    assert!(h.log.has(&format!("release:{call}:Normal")));
    assert!(h.log.has(&format!("end:{call}")));
    assert_eq!(h.handler.release(), Err(EngineError::InvalidState));
    assert!(commands(&h.transport).contains(&"openDoor".to_string()));
}

#[tokio::test]
async fn test_dial_sends_start_call_and_rejects_second() {
    let h = connected(None).await;
    let call = h
        .handler
        .dial(LogicalAddress::new("00010002"), CallType::Audio)
        .unwrap();
    assert_eq!(
        h.handler
            .dial(LogicalAddress::new("00010003"), CallType::Audio),
        Err(EngineError::Busy)
    );
    settle().await;

    let start = h
        .transport
        .sent_json()
        .into_iter()
        .find(|v| v["cmd"] == "startCall")
        .unwrap();
    assert_eq!(start["fsmId"], call.fsm_id.get());
    assert_eq!(start["address"], "00010002");

    inject(
        &h.inbound,
        r#"{"type":"capReport","sysId":1,"unitId":1,"fsmId":1,"payload":{"capabilities":16,"answered":true}}"#,
    )
    .await;
    assert!(h.log.has(&format!("answered:{call}")));
}

#[tokio::test]
async fn test_tunnel_loss_reports_error_and_closes_call() {
    let h = connected(None).await;
    let call = h
        .handler
        .dial(LogicalAddress::new("00010002"), CallType::Audio)
        .unwrap();

    h.inbound
        .send(TransportEvent::Disconnected(Some("reset by peer".into())))
        .await
        .unwrap();
    settle().await;

    let entries = h.log.entries();
    assert!(h.log.has(&format!("release:{call}:CtpDisconnected")));
    let error = entries.iter().position(|e| e == "error:connection").unwrap();
    let disconnected = entries.iter().position(|e| e == "disconnected").unwrap();
    assert!(error < disconnected);
    assert_eq!(
        entries.iter().filter(|e| *e == "disconnected").count(),
        1
    );
    assert!(!h.handler.is_connected());
}

#[tokio::test]
async fn test_connected_call_starts_media_session() {
    let device: Arc<dyn AudioDevice> = Arc::new(FakeAudioDevice::new([100; 320]));
    let h = connected(Some(MediaWiring {
        device: Some(device),
        ..MediaWiring::default()
    }))
    .await;

    inject(
        &h.inbound,
        r#"{"type":"incomingCall","sysId":1,"unitId":1,"fsmId":2,
            "payload":{"callType":"audio","mainAddress":"00010002"}}"#,
    )
    .await;
    h.handler.toggle_answer().unwrap();
    inject(
        &h.inbound,
        r#"{"type":"connected","sysId":1,"unitId":1,"fsmId":2}"#,
    )
    .await;

    assert_eq!(h.handler.toggle_mute(), Ok(true));
    assert_eq!(h.handler.toggle_mute(), Ok(false));

    h.handler.disconnect();
    assert!(h.log.has("disconnected"));
    assert_eq!(h.handler.toggle_mute(), Err(EngineError::NotStarted));
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let handler = ConnectionHandler::new(Arc::new(MockHttpClient));
    let log = Arc::new(HostLog::default());
    handler.set_callback(&log);
    let params = ConnectionParams::builder()
        .hostname("127.0.0.1")
        .port(port)
        .activation_code("ABCD-1234")
        .build()
        .unwrap();

    let result = handler.connect(params, TunnelMode::Direct).await;
    assert!(matches!(result, Err(CmgError::Connection(_))));
    assert_eq!(log.entries(), vec!["error:connection".to_string()]);
    assert!(!handler.is_connected());
}

#[test]
fn test_push_before_connect_is_rejected() {
    let handler = ConnectionHandler::new(Arc::new(MockHttpClient));
    assert!(matches!(
        handler.handle_push_notification(br#"{"action":"call"}"#, PushType::Standard),
        Err(CmgError::Generic(_))
    ));
    assert!(
        handler
            .handle_push_notification(br#"{"action":"cancel"}"#, PushType::Standard)
            .is_ok()
    );
    assert!(
        handler
            .handle_push_notification(b"not base64!", PushType::Voip)
            .is_err()
    );
}
