//! The callback surface exposed to the host application.
//!
//! Every method has an empty default so hosts implement only what they
//! render. Callbacks run on the thread delivering the bus event and must
//! not block.

use crate::error::{CmgError, EngineResult};
use vipcore::types::{
    FsmKey, MediaRequest, OutDivertActionResult, ReleaseCause, StatusChange, UnitCapability,
    UnitKey,
};

/// Connection-level notifications.
pub trait CgCallback: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_error(&self, _error: CmgError) {}
}

/// Call lifecycle notifications.
pub trait CgCallEventCallback: Send + Sync {
    /// Every status change of every call, before the specific callbacks.
    fn on_status_change(&self, _call: FsmKey, _change: &StatusChange) {}

    fn on_incoming_call(&self, _call: FsmKey, _change: &StatusChange) {}

    /// The call reached `Connected`.
    fn on_answered(&self, _call: FsmKey) {}

    fn on_capabilities(&self, _call: FsmKey, _capabilities: UnitCapability) {}

    fn on_diverted(&self, _call: FsmKey, _result: OutDivertActionResult) {}

    /// The call closed. Always followed by [`Self::on_call_end`].
    fn on_release(&self, _call: FsmKey, _cause: ReleaseCause) {}

    fn on_call_end(&self, _call: FsmKey) {}

    fn on_media_request(&self, _unit: UnitKey, _request: MediaRequest) {}
}

/// UI-driven actions on the current call.
pub trait CallPresenter {
    /// Answers an alerting call, or releases a call that is already up.
    fn toggle_answer(&self) -> EngineResult<()>;

    /// Returns the new mute state.
    fn toggle_mute(&self) -> EngineResult<bool>;

    fn open_door(&self, relay: u8) -> EngineResult<()>;

    /// Releases the current call with cause `Normal`. Returns the engine's
    /// success code, which tells an already closed call apart.
    fn release(&self) -> EngineResult<i32>;

    fn switch_video_source(&self, source: u8) -> EngineResult<()>;
}
