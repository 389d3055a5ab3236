//! [`NativeEngine`] backed by a tunnel to the remote unit.
//!
//! Commands are serialised as JSON frames: unit commands go on the unit's
//! control channel (RTSP for stream units, VIP otherwise) and system
//! commands on the tunnel channel. Inbound control frames are decoded by
//! the parser registry and posted on the bus. Inbound media frames are
//! queued per unit for the media getters.
//!
//! Media frame payload: `sys_id:u32 unit_id:u32` (big-endian) followed by
//! the packet in its media encoding.

use super::native::NativeEngine;
use super::recorder::Recorder;
use crate::error::{ENGINE_OK, EngineError};
use crate::tunnel::{Transport, TransportEvent, TunnelHandle};
use bytes::{Buf, Bytes};
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use vipcore::media::{AudioPacket, MediaPacket, VideoPacket};
use vipcore::parser::{Channel, ParserRegistry};
use vipcore::types::{
    CallType, ConnError, FsmId, FsmKey, LogicalAddress, ReleaseCause, SysId, UnitFlags, UnitId,
    UnitKey, UnitType,
};
use vipcore::{CoreEventBus, Event, EventPayload};

const OUTBOUND_CAPACITY: usize = 256;
/// 2 s of 40 ms frames.
const AUDIO_QUEUE_DEPTH: usize = 50;
const VIDEO_QUEUE_DEPTH: usize = 8;
const MEDIA_HEADER_LEN: usize = 8;

/// A command for the remote unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    Start,
    Stop,
    CreateSystem {
        sys_id: SysId,
    },
    RemoveSystem {
        sys_id: SysId,
    },
    CreateUnit {
        sys_id: SysId,
        unit_id: UnitId,
        unit_type: UnitType,
        flags: UnitFlags,
    },
    RemoveUnit {
        sys_id: SysId,
        unit_id: UnitId,
    },
    AnswerCall {
        sys_id: SysId,
        unit_id: UnitId,
        fsm_id: FsmId,
        call_type: CallType,
    },
    ReleaseCall {
        sys_id: SysId,
        unit_id: UnitId,
        fsm_id: FsmId,
        cause: ReleaseCause,
    },
    StartCall {
        sys_id: SysId,
        unit_id: UnitId,
        fsm_id: FsmId,
        address: LogicalAddress,
        call_type: CallType,
    },
    RequestKeyframe {
        sys_id: SysId,
        unit_id: UnitId,
    },
    StartRecording {
        sys_id: SysId,
        unit_id: UnitId,
    },
    StopRecording {
        sys_id: SysId,
        unit_id: UnitId,
    },
    OpenDoor {
        sys_id: SysId,
        unit_id: UnitId,
        relay: u8,
    },
    SwitchVideoSource {
        sys_id: SysId,
        unit_id: UnitId,
        source: u8,
    },
}

pub fn encode_media(unit: UnitKey, packet: &MediaPacket) -> Vec<u8> {
    let encoded = packet.encode();
    let mut payload = Vec::with_capacity(MEDIA_HEADER_LEN + encoded.len());
    payload.extend_from_slice(&unit.sys_id.get().to_be_bytes());
    payload.extend_from_slice(&unit.unit_id.get().to_be_bytes());
    payload.extend_from_slice(&encoded);
    payload
}

pub fn decode_media(mut payload: Bytes) -> Option<(UnitKey, MediaPacket)> {
    if payload.len() < MEDIA_HEADER_LEN {
        return None;
    }
    let sys_id = SysId::new(payload.get_u32());
    let unit_id = UnitId::new(payload.get_u32());
    match MediaPacket::decode(payload) {
        Ok(packet) => Some((UnitKey::new(sys_id, unit_id), packet)),
        Err(e) => {
            debug!(target: "Engine/Tunnel", "Dropping media for {sys_id}/{unit_id}: {e}");
            None
        }
    }
}

#[derive(Default)]
struct MediaQueues {
    audio: VecDeque<AudioPacket>,
    video: VecDeque<VideoPacket>,
    last_video: Option<VideoPacket>,
    recorder: Option<Recorder>,
}

impl MediaQueues {
    fn push(&mut self, packet: MediaPacket) {
        self.record(&packet);
        match packet {
            MediaPacket::Audio(audio) => {
                if self.audio.len() == AUDIO_QUEUE_DEPTH {
                    self.audio.pop_front();
                }
                self.audio.push_back(audio);
            }
            MediaPacket::Video(video) => {
                if self.video.len() == VIDEO_QUEUE_DEPTH {
                    self.video.pop_front();
                }
                self.last_video = Some(video.clone());
                self.video.push_back(video);
            }
        }
    }

    fn record(&mut self, packet: &MediaPacket) {
        if let Some(recorder) = &mut self.recorder
            && let Err(e) = recorder.write(packet)
        {
            warn!(target: "Engine/Tunnel", "Recording to {} failed, stopping: {e}", recorder.path().display());
            self.recorder = None;
        }
    }

    fn finish_recording(&mut self) -> bool {
        match self.recorder.take() {
            Some(recorder) => {
                if let Err(e) = recorder.finish() {
                    warn!(target: "Engine/Tunnel", "Closing recording failed: {e}");
                }
                true
            }
            None => false,
        }
    }
}

pub struct TunnelEngine {
    bus: CoreEventBus,
    outbound: mpsc::Sender<(Channel, Vec<u8>)>,
    units: DashMap<UnitKey, UnitType>,
    media: DashMap<UnitKey, MediaQueues>,
    started: AtomicBool,
    connected: AtomicBool,
}

impl TunnelEngine {
    /// Takes over an open tunnel. Must be called inside a tokio runtime:
    /// the writer and reader run as tasks.
    pub fn attach(handle: TunnelHandle, bus: CoreEventBus) -> Arc<Self> {
        Self::attach_with_parsers(handle, bus, ParserRegistry::with_defaults())
    }

    pub fn attach_with_parsers(
        handle: TunnelHandle,
        bus: CoreEventBus,
        parsers: ParserRegistry,
    ) -> Arc<Self> {
        let (transport, events) = handle;
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let engine = Arc::new(Self {
            bus,
            outbound,
            units: DashMap::new(),
            media: DashMap::new(),
            started: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        });

        tokio::spawn(write_pump(transport, outbound_rx));
        tokio::spawn(read_pump(Arc::downgrade(&engine), events, parsers));
        engine
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn enqueue(&self, channel: Channel, payload: Vec<u8>) -> i32 {
        if !self.is_connected() {
            return EngineError::Transport.code();
        }
        match self.outbound.try_send((channel, payload)) {
            Ok(()) => ENGINE_OK,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(target: "Engine/Tunnel", "Outbound queue full, rejecting {channel} frame");
                EngineError::Busy.code()
            }
            Err(mpsc::error::TrySendError::Closed(_)) => EngineError::Transport.code(),
        }
    }

    fn send_command(&self, channel: Channel, command: &Command) -> i32 {
        match serde_json::to_vec(command) {
            Ok(payload) => {
                trace!(target: "Engine/Tunnel", "--> {command:?}");
                self.enqueue(channel, payload)
            }
            Err(e) => {
                warn!(target: "Engine/Tunnel", "Cannot encode {command:?}: {e}");
                EngineError::Generic.code()
            }
        }
    }

    /// Sends a unit-scoped command on the unit's control channel.
    fn send_unit_command(&self, unit: UnitKey, command: &Command) -> i32 {
        let Some(unit_type) = self.units.get(&unit).map(|t| *t) else {
            return EngineError::UnknownUnit.code();
        };
        let channel = if unit_type.uses_rtsp_fsm() {
            Channel::Rtsp
        } else {
            Channel::Vip
        };
        self.send_command(channel, command)
    }

    fn send_media(&self, unit: UnitKey, packet: MediaPacket) -> i32 {
        if !self.units.contains_key(&unit) {
            return EngineError::UnknownUnit.code();
        }
        let payload = encode_media(unit, &packet);
        if let Some(mut queues) = self.media.get_mut(&unit) {
            queues.record(&packet);
        }
        match self.enqueue(Channel::Media, payload) {
            code if code == EngineError::Busy.code() => {
                // Late media is worthless, drop it.
                debug!(target: "Engine/Tunnel", "Dropping outbound media for {unit}");
                ENGINE_OK
            }
            code => code,
        }
    }

    fn handle_media(&self, payload: Bytes) {
        let Some((unit, packet)) = decode_media(payload) else {
            return;
        };
        match self.media.get_mut(&unit) {
            Some(mut queues) => queues.push(packet),
            None => debug!(target: "Engine/Tunnel", "Media for unknown unit {unit} dropped"),
        }
    }

    fn on_disconnected(&self, reason: Option<String>) {
        if !self.connected.swap(false, Ordering::Relaxed) {
            return;
        }
        info!(
            target: "Engine/Tunnel",
            "Tunnel lost{}",
            reason.map(|r| format!(": {r}")).unwrap_or_default()
        );
        for mut queues in self.media.iter_mut() {
            queues.finish_recording();
        }
        let units: Vec<UnitKey> = self.units.iter().map(|entry| *entry.key()).collect();
        for unit in units {
            self.bus.post(Event::unit(
                unit.sys_id,
                unit.unit_id,
                EventPayload::TunnelClosed {
                    error: Some(ConnError::CtpDisconnected),
                },
            ));
        }
    }
}

impl NativeEngine for TunnelEngine {
    fn start(&self) -> i32 {
        let code = self.send_command(Channel::Tunnel, &Command::Start);
        if code == ENGINE_OK {
            self.started.store(true, Ordering::Relaxed);
        }
        code
    }

    fn stop(&self) {
        if self.started.swap(false, Ordering::Relaxed) {
            self.send_command(Channel::Tunnel, &Command::Stop);
        }
        for mut queues in self.media.iter_mut() {
            queues.finish_recording();
        }
    }

    fn is_alive(&self) -> bool {
        self.started.load(Ordering::Relaxed) && self.is_connected()
    }

    fn create_system(&self, sys_id: SysId) -> i32 {
        self.send_command(Channel::Tunnel, &Command::CreateSystem { sys_id })
    }

    fn remove_system(&self, sys_id: SysId) -> i32 {
        self.units.retain(|unit, _| unit.sys_id != sys_id);
        self.media.retain(|unit, queues| {
            if unit.sys_id == sys_id {
                queues.finish_recording();
                false
            } else {
                true
            }
        });
        self.send_command(Channel::Tunnel, &Command::RemoveSystem { sys_id })
    }

    fn create_unit(&self, unit: UnitKey, unit_type: UnitType, flags: UnitFlags) -> i32 {
        self.units.insert(unit, unit_type);
        self.media.entry(unit).or_default();
        self.send_unit_command(
            unit,
            &Command::CreateUnit {
                sys_id: unit.sys_id,
                unit_id: unit.unit_id,
                unit_type,
                flags,
            },
        )
    }

    fn remove_unit(&self, unit: UnitKey) -> i32 {
        let code = self.send_unit_command(
            unit,
            &Command::RemoveUnit {
                sys_id: unit.sys_id,
                unit_id: unit.unit_id,
            },
        );
        self.units.remove(&unit);
        if let Some((_, mut queues)) = self.media.remove(&unit) {
            queues.finish_recording();
        }
        code
    }

    fn answer_call(&self, call: FsmKey, call_type: CallType) -> i32 {
        self.send_unit_command(
            call.unit(),
            &Command::AnswerCall {
                sys_id: call.sys_id,
                unit_id: call.unit_id,
                fsm_id: call.fsm_id,
                call_type,
            },
        )
    }

    fn release_call(&self, call: FsmKey, cause: ReleaseCause) -> i32 {
        self.send_unit_command(
            call.unit(),
            &Command::ReleaseCall {
                sys_id: call.sys_id,
                unit_id: call.unit_id,
                fsm_id: call.fsm_id,
                cause,
            },
        )
    }

    fn start_outgoing_call(
        &self,
        call: FsmKey,
        address: &LogicalAddress,
        call_type: CallType,
    ) -> i32 {
        self.send_unit_command(
            call.unit(),
            &Command::StartCall {
                sys_id: call.sys_id,
                unit_id: call.unit_id,
                fsm_id: call.fsm_id,
                address: address.clone(),
                call_type,
            },
        )
    }

    fn send_audio_packet(&self, unit: UnitKey, packet: &AudioPacket) -> i32 {
        self.send_media(unit, MediaPacket::Audio(packet.clone()))
    }

    fn get_audio_packet(&self, unit: UnitKey) -> Option<AudioPacket> {
        self.media.get_mut(&unit)?.audio.pop_front()
    }

    fn send_video_packet(&self, unit: UnitKey, packet: &VideoPacket) -> i32 {
        self.send_media(unit, MediaPacket::Video(packet.clone()))
    }

    fn get_video_frame(&self, unit: UnitKey) -> Option<VideoPacket> {
        self.media.get_mut(&unit)?.video.pop_front()
    }

    fn request_keyframe(&self, unit: UnitKey) -> i32 {
        self.send_unit_command(
            unit,
            &Command::RequestKeyframe {
                sys_id: unit.sys_id,
                unit_id: unit.unit_id,
            },
        )
    }

    fn start_recording(&self, unit: UnitKey, path: &Path) -> i32 {
        let Some(mut queues) = self.media.get_mut(&unit) else {
            return EngineError::UnknownUnit.code();
        };
        if queues.recorder.is_some() {
            return EngineError::InvalidState.code();
        }
        match Recorder::create(path) {
            Ok(recorder) => queues.recorder = Some(recorder),
            Err(e) => {
                warn!(target: "Engine/Tunnel", "Cannot create recording {}: {e}", path.display());
                return EngineError::Generic.code();
            }
        }
        drop(queues);
        // The unit answers with a keyframe so the recording starts decodable.
        self.send_unit_command(
            unit,
            &Command::StartRecording {
                sys_id: unit.sys_id,
                unit_id: unit.unit_id,
            },
        )
    }

    fn stop_recording(&self, unit: UnitKey) -> i32 {
        let Some(mut queues) = self.media.get_mut(&unit) else {
            return EngineError::UnknownUnit.code();
        };
        if !queues.finish_recording() {
            return EngineError::InvalidState.code();
        }
        drop(queues);
        self.send_unit_command(
            unit,
            &Command::StopRecording {
                sys_id: unit.sys_id,
                unit_id: unit.unit_id,
            },
        )
    }

    fn take_snapshot(&self, unit: UnitKey, path: &Path) -> i32 {
        let frame = match self.media.get(&unit) {
            Some(queues) => queues.last_video.clone(),
            None => return EngineError::UnknownUnit.code(),
        };
        let Some(frame) = frame else {
            return EngineError::InvalidState.code();
        };
        match std::fs::write(path, &frame.data) {
            Ok(()) => ENGINE_OK,
            Err(e) => {
                warn!(target: "Engine/Tunnel", "Snapshot to {} failed: {e}", path.display());
                EngineError::Generic.code()
            }
        }
    }

    fn open_door(&self, unit: UnitKey, relay: u8) -> i32 {
        self.send_unit_command(
            unit,
            &Command::OpenDoor {
                sys_id: unit.sys_id,
                unit_id: unit.unit_id,
                relay,
            },
        )
    }

    fn switch_video_source(&self, unit: UnitKey, source: u8) -> i32 {
        self.send_unit_command(
            unit,
            &Command::SwitchVideoSource {
                sys_id: unit.sys_id,
                unit_id: unit.unit_id,
                source,
            },
        )
    }
}

impl std::fmt::Debug for TunnelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEngine")
            .field("units", &self.units.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn write_pump(transport: Arc<dyn Transport>, mut outbound: mpsc::Receiver<(Channel, Vec<u8>)>) {
    while let Some((channel, payload)) = outbound.recv().await {
        if let Err(e) = transport.send_frame(channel, &payload).await {
            warn!(target: "Engine/Tunnel", "Failed to send {channel} frame: {e}");
        }
    }
    debug!(target: "Engine/Tunnel", "Engine dropped, closing tunnel");
    transport.disconnect().await;
}

async fn read_pump(
    engine: Weak<TunnelEngine>,
    mut events: mpsc::Receiver<TransportEvent>,
    parsers: ParserRegistry,
) {
    while let Some(event) = events.recv().await {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Connected => debug!(target: "Engine/Tunnel", "Tunnel up"),
            TransportEvent::FrameReceived(frame) => match frame.channel {
                Channel::Media => engine.handle_media(frame.payload),
                channel => {
                    if let Some(event) = parsers.dispatch(channel, &frame.payload) {
                        trace!(target: "Engine/Tunnel", "<-- {event}");
                        engine.bus.post(event);
                    }
                }
            },
            TransportEvent::Disconnected(reason) => {
                engine.on_disconnected(reason);
                return;
            }
        }
    }
    if let Some(engine) = engine.upgrade() {
        engine.on_disconnected(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingHandler, RecordingTransport};
    use crate::framing::Frame;
    use std::time::Duration;
    use vipcore::EventKind;

    fn unit() -> UnitKey {
        UnitKey::new(SysId::new(1), UnitId::new(2))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_value(Command::StartCall {
            sys_id: SysId::new(1),
            unit_id: UnitId::new(2),
            fsm_id: FsmId::new(3),
            address: LogicalAddress::new("00010002"),
            call_type: CallType::AudioVideo,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "cmd": "startCall",
                "sysId": 1,
                "unitId": 2,
                "fsmId": 3,
                "address": "00010002",
                "callType": "audioVideo"
            })
        );
        assert_eq!(
            serde_json::to_value(Command::Start).unwrap(),
            serde_json::json!({"cmd": "start"})
        );
    }

    #[tokio::test]
    async fn test_commands_use_unit_channel() {
        let (transport, _inbound, handle) = RecordingTransport::open();
        let engine = TunnelEngine::attach(handle, CoreEventBus::new());
        assert_eq!(engine.start(), ENGINE_OK);
        assert!(engine.is_alive());

        let camera = UnitKey::new(SysId::new(1), UnitId::new(3));
        assert_eq!(engine.create_unit(unit(), UnitType::Vip, UnitFlags::AUDIO), ENGINE_OK);
        assert_eq!(engine.create_unit(camera, UnitType::Tvcc, UnitFlags::VIDEO), ENGINE_OK);
        assert_eq!(engine.open_door(unit(), 1), ENGINE_OK);
        assert_eq!(engine.request_keyframe(camera), ENGINE_OK);
        assert_eq!(
            engine.open_door(UnitKey::new(SysId::new(9), UnitId::new(9)), 1),
            EngineError::UnknownUnit.code()
        );
        settle().await;

        let channels: Vec<Channel> = transport.sent().iter().map(|(c, _)| *c).collect();
        assert_eq!(
            channels,
            vec![Channel::Tunnel, Channel::Vip, Channel::Rtsp, Channel::Vip, Channel::Rtsp]
        );
        let door: serde_json::Value = serde_json::from_slice(&transport.sent()[3].1).unwrap();
        assert_eq!(door["cmd"], "openDoor");
        assert_eq!(door["relay"], 1);
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_bus_and_queues() {
        let (_transport, inbound, handle) = RecordingTransport::open();
        let bus = CoreEventBus::new();
        let recorder = RecordingHandler::new();
        let _sub = bus.register(&recorder);
        let engine = TunnelEngine::attach(handle, bus.clone());
        engine.create_unit(unit(), UnitType::Vip, UnitFlags::AUDIO);

        inbound
            .send(TransportEvent::FrameReceived(Frame {
                channel: Channel::Vip,
                payload: Bytes::from_static(
                    br#"{"type":"outAlerting","sysId":1,"unitId":2,"fsmId":1}"#,
                ),
            }))
            .await
            .unwrap();
        let audio = MediaPacket::Audio(AudioPacket::silence(5, 1600));
        inbound
            .send(TransportEvent::FrameReceived(Frame {
                channel: Channel::Media,
                payload: Bytes::from(encode_media(unit(), &audio)),
            }))
            .await
            .unwrap();
        settle().await;

        assert_eq!(recorder.events_of(EventKind::OutAlerting).len(), 1);
        assert_eq!(engine.get_audio_packet(unit()).map(|p| p.seq), Some(5));
        assert_eq!(engine.get_audio_packet(unit()), None);
    }

    #[tokio::test]
    async fn test_disconnect_closes_units() {
        let (_transport, inbound, handle) = RecordingTransport::open();
        let bus = CoreEventBus::new();
        let recorder = RecordingHandler::new();
        let _sub = bus.register(&recorder);
        let engine = TunnelEngine::attach(handle, bus.clone());
        engine.start();
        engine.create_unit(unit(), UnitType::Vip, UnitFlags::AUDIO);

        inbound
            .send(TransportEvent::Disconnected(Some("reset".into())))
            .await
            .unwrap();
        settle().await;

        assert!(!engine.is_alive());
        let closed = recorder.events_of(EventKind::TunnelClosed);
        assert_eq!(closed.len(), 1);
        assert_eq!(
            closed[0].payload,
            EventPayload::TunnelClosed {
                error: Some(ConnError::CtpDisconnected)
            }
        );
        assert_eq!(engine.open_door(unit(), 1), EngineError::Transport.code());
    }

    #[tokio::test]
    async fn test_recording_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (_transport, inbound, handle) = RecordingTransport::open();
        let engine = TunnelEngine::attach(handle, CoreEventBus::new());
        engine.create_unit(unit(), UnitType::Vip, UnitFlags::VIDEO);

        let snapshot = dir.path().join("snap.h264");
        assert_eq!(
            engine.take_snapshot(unit(), &snapshot),
            EngineError::InvalidState.code()
        );

        let recording = dir.path().join("call.vrec");
        assert_eq!(engine.start_recording(unit(), &recording), ENGINE_OK);
        assert_eq!(
            engine.start_recording(unit(), &recording),
            EngineError::InvalidState.code()
        );

        let video = MediaPacket::Video(VideoPacket {
            seq: 1,
            timestamp: 0,
            keyframe: true,
            width: 320,
            height: 240,
            data: Bytes::from_static(b"idr"),
        });
        inbound
            .send(TransportEvent::FrameReceived(Frame {
                channel: Channel::Media,
                payload: Bytes::from(encode_media(unit(), &video)),
            }))
            .await
            .unwrap();
        settle().await;

        assert_eq!(engine.stop_recording(unit()), ENGINE_OK);
        assert_eq!(engine.stop_recording(unit()), EngineError::InvalidState.code());
        let packets = super::super::recorder::read_recording(&recording).unwrap();
        assert_eq!(packets, vec![video]);

        assert_eq!(engine.take_snapshot(unit(), &snapshot), ENGINE_OK);
        assert_eq!(std::fs::read(&snapshot).unwrap(), b"idr");
    }
}
