//! Test doubles shared by the unit and integration tests.

use crate::engine::NativeEngine;
use crate::error::{ENGINE_OK, EngineError};
use crate::media::{AudioDevice, FrameSink};
use crate::tunnel::signaling::SdpExchange;
use crate::tunnel::stun::{self, StunAttribute, StunMessage, StunMessageType};
use crate::tunnel::{EVENT_CHANNEL_CAPACITY, Transport, TransportEvent, TunnelHandle};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use vipcore::media::{AUDIO_FRAME_SAMPLES, AudioPacket, DecodedFrame, VideoPacket};
use vipcore::net::{HttpClient, HttpRequest, HttpResponse};
use vipcore::p2p::{SessionDescription, TurnServer};
use vipcore::parser::Channel;
use vipcore::types::{
    CallFsmStatus, CallType, FsmKey, LogicalAddress, ReleaseCause, StatusChange, SysId, UnitFlags,
    UnitKey, UnitType,
};
use vipcore::{CoreEventBus, Event, EventHandler, EventKind, EventPayload};

#[derive(Debug, Clone, Default)]
pub struct MockHttpClient;

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        Ok(HttpResponse {
            status_code: 200,
            body: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailingMockHttpClient;

#[async_trait]
impl HttpClient for FailingMockHttpClient {
    async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        Err(anyhow::anyhow!("Not implemented"))
    }
}

/// Bus subscriber that keeps every event it sees.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    pub fn events_of(&self, kind: EventKind) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind() == kind)
            .collect()
    }

    pub fn status_changes(&self) -> Vec<StatusChange> {
        self.events()
            .iter()
            .filter_map(|e| e.status_change().cloned())
            .collect()
    }

    /// Status sequence of one call, in order.
    pub fn statuses(&self, call: FsmKey) -> Vec<CallFsmStatus> {
        self.events()
            .iter()
            .filter(|e| e.fsm_key() == Some(call))
            .filter_map(|e| e.status_change().map(|c| c.status))
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .expect("Mutex should not be poisoned")
            .clear();
    }
}

impl EventHandler for RecordingHandler {
    fn handle_event(&self, event: &Event) {
        self.events
            .lock()
            .expect("Mutex should not be poisoned")
            .push(event.clone());
    }
}

/// A request seen by [`MockNativeEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCall {
    Start,
    Stop,
    CreateSystem(SysId),
    RemoveSystem(SysId),
    CreateUnit(UnitKey, UnitType),
    RemoveUnit(UnitKey),
    AnswerCall(FsmKey, CallType),
    ReleaseCall(FsmKey, ReleaseCause),
    StartCall(FsmKey, LogicalAddress, CallType),
    RequestKeyframe(UnitKey),
    StartRecording(UnitKey, PathBuf),
    StopRecording(UnitKey),
    TakeSnapshot(UnitKey, PathBuf),
    OpenDoor(UnitKey, u8),
    SwitchVideoSource(UnitKey, u8),
}

/// In-memory native engine. Records every request and answers with
/// [`ENGINE_OK`] unless a code was scripted for the operation.
#[derive(Debug, Default)]
pub struct MockNativeEngine {
    alive: AtomicBool,
    calls: Mutex<Vec<NativeCall>>,
    codes: Mutex<HashMap<&'static str, i32>>,
    audio_in: Mutex<HashMap<UnitKey, VecDeque<AudioPacket>>>,
    video_in: Mutex<HashMap<UnitKey, VecDeque<VideoPacket>>>,
    sent_audio: Mutex<Vec<AudioPacket>>,
    sent_video: Mutex<Vec<VideoPacket>>,
    audio_callers: Mutex<Vec<String>>,
    dial_replies: Mutex<Option<(CoreEventBus, Vec<EventPayload>)>>,
}

impl MockNativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `op` (e.g. `"answer_call"`) return `code` from now on.
    pub fn script(&self, op: &'static str, code: i32) {
        self.codes
            .lock()
            .expect("Mutex should not be poisoned")
            .insert(op, code);
    }

    pub fn fail(&self, op: &'static str, err: EngineError) {
        self.script(op, err.code());
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    /// Posts `replies` for the new call on `bus` from inside
    /// `start_outgoing_call`, before it returns, the way a fast unit can
    /// answer before the request call completes.
    pub fn reply_to_dial(&self, bus: &CoreEventBus, replies: Vec<EventPayload>) {
        *self
            .dial_replies
            .lock()
            .expect("Mutex should not be poisoned") = Some((bus.clone(), replies));
    }

    pub fn keyframe_requests(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, NativeCall::RequestKeyframe(_)))
            .count()
    }

    pub fn push_audio(&self, unit: UnitKey, packet: AudioPacket) {
        self.audio_in
            .lock()
            .expect("Mutex should not be poisoned")
            .entry(unit)
            .or_default()
            .push_back(packet);
    }

    pub fn push_video(&self, unit: UnitKey, packet: VideoPacket) {
        self.video_in
            .lock()
            .expect("Mutex should not be poisoned")
            .entry(unit)
            .or_default()
            .push_back(packet);
    }

    pub fn sent_audio(&self) -> Vec<AudioPacket> {
        self.sent_audio
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    /// Names of the threads that have exchanged audio with the engine.
    pub fn audio_callers(&self) -> Vec<String> {
        self.audio_callers
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    fn note_audio_caller(&self) {
        let name = std::thread::current().name().unwrap_or_default().to_owned();
        let mut callers = self
            .audio_callers
            .lock()
            .expect("Mutex should not be poisoned");
        if !callers.contains(&name) {
            callers.push(name);
        }
    }

    pub fn sent_video(&self) -> Vec<VideoPacket> {
        self.sent_video
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    fn record(&self, op: &'static str, call: Option<NativeCall>) -> i32 {
        if let Some(call) = call {
            self.calls
                .lock()
                .expect("Mutex should not be poisoned")
                .push(call);
        }
        self.codes
            .lock()
            .expect("Mutex should not be poisoned")
            .get(op)
            .copied()
            .unwrap_or(ENGINE_OK)
    }
}

impl NativeEngine for MockNativeEngine {
    fn start(&self) -> i32 {
        let code = self.record("start", Some(NativeCall::Start));
        if code >= 0 {
            self.alive.store(true, Ordering::SeqCst);
        }
        code
    }

    fn stop(&self) {
        self.record("stop", Some(NativeCall::Stop));
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn create_system(&self, sys_id: SysId) -> i32 {
        self.record("create_system", Some(NativeCall::CreateSystem(sys_id)))
    }

    fn remove_system(&self, sys_id: SysId) -> i32 {
        self.record("remove_system", Some(NativeCall::RemoveSystem(sys_id)))
    }

    fn create_unit(&self, unit: UnitKey, unit_type: UnitType, _flags: UnitFlags) -> i32 {
        self.record("create_unit", Some(NativeCall::CreateUnit(unit, unit_type)))
    }

    fn remove_unit(&self, unit: UnitKey) -> i32 {
        self.record("remove_unit", Some(NativeCall::RemoveUnit(unit)))
    }

    fn answer_call(&self, call: FsmKey, call_type: CallType) -> i32 {
        self.record("answer_call", Some(NativeCall::AnswerCall(call, call_type)))
    }

    fn release_call(&self, call: FsmKey, cause: ReleaseCause) -> i32 {
        self.record("release_call", Some(NativeCall::ReleaseCall(call, cause)))
    }

    fn start_outgoing_call(
        &self,
        call: FsmKey,
        address: &LogicalAddress,
        call_type: CallType,
    ) -> i32 {
        let code = self.record(
            "start_outgoing_call",
            Some(NativeCall::StartCall(call, address.clone(), call_type)),
        );
        let replies = self
            .dial_replies
            .lock()
            .expect("Mutex should not be poisoned")
            .take();
        if code >= 0
            && let Some((bus, payloads)) = replies
        {
            for payload in payloads {
                bus.post(Event::fsm(call, payload));
            }
        }
        code
    }

    fn send_audio_packet(&self, _unit: UnitKey, packet: &AudioPacket) -> i32 {
        self.note_audio_caller();
        let code = self.record("send_audio_packet", None);
        if code >= 0 {
            self.sent_audio
                .lock()
                .expect("Mutex should not be poisoned")
                .push(packet.clone());
        }
        code
    }

    fn get_audio_packet(&self, unit: UnitKey) -> Option<AudioPacket> {
        self.note_audio_caller();
        self.audio_in
            .lock()
            .expect("Mutex should not be poisoned")
            .get_mut(&unit)?
            .pop_front()
    }

    fn send_video_packet(&self, _unit: UnitKey, packet: &VideoPacket) -> i32 {
        let code = self.record("send_video_packet", None);
        if code >= 0 {
            self.sent_video
                .lock()
                .expect("Mutex should not be poisoned")
                .push(packet.clone());
        }
        code
    }

    fn get_video_frame(&self, unit: UnitKey) -> Option<VideoPacket> {
        self.video_in
            .lock()
            .expect("Mutex should not be poisoned")
            .get_mut(&unit)?
            .pop_front()
    }

    fn request_keyframe(&self, unit: UnitKey) -> i32 {
        self.record("request_keyframe", Some(NativeCall::RequestKeyframe(unit)))
    }

    fn start_recording(&self, unit: UnitKey, path: &Path) -> i32 {
        self.record(
            "start_recording",
            Some(NativeCall::StartRecording(unit, path.to_path_buf())),
        )
    }

    fn stop_recording(&self, unit: UnitKey) -> i32 {
        self.record("stop_recording", Some(NativeCall::StopRecording(unit)))
    }

    fn take_snapshot(&self, unit: UnitKey, path: &Path) -> i32 {
        self.record(
            "take_snapshot",
            Some(NativeCall::TakeSnapshot(unit, path.to_path_buf())),
        )
    }

    fn open_door(&self, unit: UnitKey, relay: u8) -> i32 {
        self.record("open_door", Some(NativeCall::OpenDoor(unit, relay)))
    }

    fn switch_video_source(&self, unit: UnitKey, source: u8) -> i32 {
        self.record(
            "switch_video_source",
            Some(NativeCall::SwitchVideoSource(unit, source)),
        )
    }
}

/// Transport that keeps what is sent. Inbound events are injected through
/// the sender returned by [`RecordingTransport::open`].
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Channel, Vec<u8>)>>,
    disconnected: AtomicBool,
}

impl RecordingTransport {
    pub fn open() -> (Arc<Self>, mpsc::Sender<TransportEvent>, TunnelHandle) {
        let transport = Arc::new(Self::default());
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle: TunnelHandle = (transport.clone(), rx);
        (transport, tx, handle)
    }

    pub fn sent(&self) -> Vec<(Channel, Vec<u8>)> {
        self.sent
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }

    /// JSON payloads sent on the control channels.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter(|(channel, _)| *channel != Channel::Media)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_frame(&self, channel: Channel, payload: &[u8]) -> Result<(), anyhow::Error> {
        if self.is_disconnected() {
            return Err(anyhow::anyhow!("transport closed"));
        }
        self.sent
            .lock()
            .expect("Mutex should not be poisoned")
            .push((channel, payload.to_vec()));
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// One side of an in-memory SDP exchange. What one side publishes, the
/// other receives.
pub struct MemorySdpExchange {
    outbox: mpsc::UnboundedSender<SessionDescription>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionDescription>>,
}

impl MemorySdpExchange {
    pub fn pair() -> (Self, Self) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbox: right_tx,
                inbox: tokio::sync::Mutex::new(left_rx),
            },
            Self {
                outbox: left_tx,
                inbox: tokio::sync::Mutex::new(right_rx),
            },
        )
    }
}

#[async_trait]
impl SdpExchange for MemorySdpExchange {
    async fn publish(&self, local: &SessionDescription) -> Result<(), anyhow::Error> {
        self.outbox
            .send(local.clone())
            .map_err(|_| anyhow::anyhow!("peer gone"))
    }

    async fn receive(&self) -> Result<SessionDescription, anyhow::Error> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("peer gone"))
    }
}

#[derive(Debug, Default)]
pub struct CollectingFrameSink {
    frames: Mutex<Vec<DecodedFrame>>,
}

impl CollectingFrameSink {
    pub fn frames(&self) -> Vec<DecodedFrame> {
        self.frames
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
    }
}

impl FrameSink for CollectingFrameSink {
    fn on_frame(&self, frame: DecodedFrame) {
        self.frames
            .lock()
            .expect("Mutex should not be poisoned")
            .push(frame);
    }
}

/// Audio device that captures a fixed frame and counts played frames.
/// Each call sleeps briefly to stand in for the device period.
#[derive(Debug)]
pub struct FakeAudioDevice {
    capture: [i16; AUDIO_FRAME_SAMPLES],
    period: Duration,
    captured: AtomicU64,
    played: AtomicU64,
    last_played: Mutex<Option<[i16; AUDIO_FRAME_SAMPLES]>>,
}

impl FakeAudioDevice {
    pub fn new(capture: [i16; AUDIO_FRAME_SAMPLES]) -> Self {
        Self {
            capture,
            period: Duration::from_millis(2),
            captured: AtomicU64::new(0),
            played: AtomicU64::new(0),
            last_played: Mutex::new(None),
        }
    }

    pub fn captured_frames(&self) -> u64 {
        self.captured.load(Ordering::SeqCst)
    }

    pub fn played_frames(&self) -> u64 {
        self.played.load(Ordering::SeqCst)
    }

    pub fn last_played(&self) -> Option<[i16; AUDIO_FRAME_SAMPLES]> {
        *self.last_played.lock().expect("Mutex should not be poisoned")
    }
}

impl AudioDevice for FakeAudioDevice {
    fn capture(&self, frame: &mut [i16; AUDIO_FRAME_SAMPLES]) -> bool {
        std::thread::sleep(self.period);
        frame.copy_from_slice(&self.capture);
        self.captured.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn play(&self, frame: &[i16; AUDIO_FRAME_SAMPLES]) -> bool {
        std::thread::sleep(self.period);
        *self.last_played.lock().expect("Mutex should not be poisoned") = Some(*frame);
        self.played.fetch_add(1, Ordering::SeqCst);
        true
    }
}

const MOCK_TURN_REALM: &str = "mock.turn";
const MOCK_TURN_NONCE: &[u8] = b"mock-nonce";

/// Minimal TURN server on loopback: challenges the first Allocate, then
/// relays Send indications to permitted peers and wraps whatever those
/// peers send to the relayed address in Data indications.
#[derive(Debug)]
pub struct MockTurnServer {
    pub address: SocketAddr,
    pub relayed: SocketAddr,
    pub credentials: TurnServer,
    permissions: Arc<Mutex<Vec<IpAddr>>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl MockTurnServer {
    pub async fn spawn() -> Self {
        let control = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let relay = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let address = control.local_addr().unwrap();
        let relayed = relay.local_addr().unwrap();
        let credentials = TurnServer {
            address: address.to_string(),
            username: "mock-user".into(),
            password: "mock-pass".into(),
        };
        let key = stun::long_term_key(
            &credentials.username,
            MOCK_TURN_REALM,
            &credentials.password,
        );
        let permissions = Arc::new(Mutex::new(Vec::new()));
        let client: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

        let control_task = tokio::spawn({
            let (control, relay) = (control.clone(), relay.clone());
            let (permissions, client) = (permissions.clone(), client.clone());
            async move {
                let mut buf = vec![0u8; 65536];
                while let Ok((len, from)) = control.recv_from(&mut buf).await {
                    let data = &buf[..len];
                    let Ok(msg) = StunMessage::decode(data) else {
                        continue;
                    };
                    if msg.msg_type == StunMessageType::SendIndication {
                        if let (Some(peer), Some(payload)) = (msg.peer_address(), msg.data())
                            && is_permitted(&permissions, peer)
                        {
                            let _ = relay.send_to(payload, peer).await;
                        }
                        continue;
                    }
                    let reply = if msg.username().is_none()
                        || !StunMessage::verify_integrity(data, &key)
                    {
                        StunMessage::error_to(&msg, 401, "Unauthorized").map(|m| {
                            m.with_realm(MOCK_TURN_REALM).with_nonce(MOCK_TURN_NONCE)
                        })
                    } else {
                        match msg.msg_type {
                            StunMessageType::AllocateRequest => {
                                client
                                    .lock()
                                    .expect("Mutex should not be poisoned")
                                    .replace(from);
                                StunMessage::success_to(&msg).map(|m| {
                                    m.with_attribute(StunAttribute::XorRelayedAddress(relayed))
                                        .with_attribute(StunAttribute::MappedAddress(from))
                                        .with_attribute(StunAttribute::Lifetime(600))
                                })
                            }
                            StunMessageType::CreatePermissionRequest => {
                                permissions
                                    .lock()
                                    .expect("Mutex should not be poisoned")
                                    .extend(msg.peer_addresses().iter().map(SocketAddr::ip));
                                StunMessage::success_to(&msg)
                            }
                            StunMessageType::RefreshRequest => StunMessage::success_to(&msg),
                            _ => None,
                        }
                        .map(|m| m.with_integrity_key(&key))
                    };
                    if let Some(reply) = reply {
                        let _ = control.send_to(&reply.encode(), from).await;
                    }
                }
            }
        });

        let relay_task = tokio::spawn({
            let permissions = permissions.clone();
            async move {
                let mut buf = vec![0u8; 65536];
                while let Ok((len, from)) = relay.recv_from(&mut buf).await {
                    let target = *client.lock().expect("Mutex should not be poisoned");
                    if let Some(target) = target
                        && is_permitted(&permissions, from)
                    {
                        let wrapped = StunMessage::data_indication(from, &buf[..len]).encode();
                        let _ = control.send_to(&wrapped, target).await;
                    }
                }
            }
        });

        Self {
            address,
            relayed,
            credentials,
            permissions,
            tasks: vec![control_task, relay_task],
        }
    }

    /// Peer addresses with a permission installed.
    pub fn permissions(&self) -> Vec<IpAddr> {
        self.permissions.lock().expect("Mutex should not be poisoned").clone()
    }
}

fn is_permitted(permissions: &Mutex<Vec<IpAddr>>, peer: SocketAddr) -> bool {
    permissions
        .lock()
        .expect("Mutex should not be poisoned")
        .contains(&peer.ip())
}

impl Drop for MockTurnServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
