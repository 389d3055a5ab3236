use std::path::Path;
use vipcore::media::{AudioPacket, VideoPacket};
use vipcore::types::{
    CallType, FsmKey, LogicalAddress, ReleaseCause, SysId, UnitFlags, UnitKey, UnitType,
};

/// The native call-processing library.
///
/// Every call is a synchronous request that returns immediately with a
/// status code: `0` accepted, negative rejected (see
/// [`crate::error::EngineError::from_code`]). Protocol progress is reported
/// later as events on the bus, so acceptance says nothing about call state.
///
/// Media getters are non-blocking and return `None` when nothing is queued.
pub trait NativeEngine: Send + Sync {
    fn start(&self) -> i32;
    fn stop(&self);
    fn is_alive(&self) -> bool;

    fn create_system(&self, sys_id: SysId) -> i32;
    fn remove_system(&self, sys_id: SysId) -> i32;
    fn create_unit(&self, unit: UnitKey, unit_type: UnitType, flags: UnitFlags) -> i32;
    fn remove_unit(&self, unit: UnitKey) -> i32;

    fn answer_call(&self, call: FsmKey, call_type: CallType) -> i32;
    fn release_call(&self, call: FsmKey, cause: ReleaseCause) -> i32;
    fn start_outgoing_call(
        &self,
        call: FsmKey,
        address: &LogicalAddress,
        call_type: CallType,
    ) -> i32;

    fn send_audio_packet(&self, unit: UnitKey, packet: &AudioPacket) -> i32;
    fn get_audio_packet(&self, unit: UnitKey) -> Option<AudioPacket>;
    fn send_video_packet(&self, unit: UnitKey, packet: &VideoPacket) -> i32;
    fn get_video_frame(&self, unit: UnitKey) -> Option<VideoPacket>;
    fn request_keyframe(&self, unit: UnitKey) -> i32;

    fn start_recording(&self, unit: UnitKey, path: &Path) -> i32;
    fn stop_recording(&self, unit: UnitKey) -> i32;
    fn take_snapshot(&self, unit: UnitKey, path: &Path) -> i32;

    fn open_door(&self, unit: UnitKey, relay: u8) -> i32;
    fn switch_video_source(&self, unit: UnitKey, source: u8) -> i32;
}
