//! Bus subscriber translating engine events into host callbacks and
//! starting or stopping each call's media.

use super::callbacks::{CgCallEventCallback, CgCallback};
use crate::engine::CallEngine;
use crate::error::CmgError;
use crate::media::{AudioDevice, FrameSink, MediaSession, MediaSessionConfig};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use vipcore::media::VideoDecoder;
use vipcore::types::{CallFsmStatus, FsmKey, StatusChange, UnitKey};
use vipcore::{Event, EventHandler, EventKind, EventPayload};

/// Builds the platform's hardware decoder for a new media session.
pub type DecoderFactory = Arc<dyn Fn() -> Option<Box<dyn VideoDecoder>> + Send + Sync>;

/// How calls get their media. Without an audio device no media session is
/// started and the host drives media through the engine itself.
#[derive(Clone, Default)]
pub struct MediaWiring {
    pub device: Option<Arc<dyn AudioDevice>>,
    pub sink: Option<Arc<dyn FrameSink>>,
    pub decoder: Option<DecoderFactory>,
    pub config: MediaSessionConfig,
}

pub(crate) struct CallbackBridge {
    engine: Weak<CallEngine>,
    callback: Option<Weak<dyn CgCallback>>,
    call_events: Option<Weak<dyn CgCallEventCallback>>,
    media: MediaWiring,
    sessions: Mutex<HashMap<UnitKey, MediaSession>>,
    tunnel_lost: AtomicBool,
}

impl CallbackBridge {
    pub(crate) fn new(
        engine: &Arc<CallEngine>,
        callback: Option<Weak<dyn CgCallback>>,
        call_events: Option<Weak<dyn CgCallEventCallback>>,
        media: MediaWiring,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::downgrade(engine),
            callback,
            call_events,
            media,
            sessions: Mutex::new(HashMap::new()),
            tunnel_lost: AtomicBool::new(false),
        })
    }

    fn callback(&self) -> Option<Arc<dyn CgCallback>> {
        self.callback.as_ref()?.upgrade()
    }

    fn call_events(&self) -> Option<Arc<dyn CgCallEventCallback>> {
        self.call_events.as_ref()?.upgrade()
    }

    pub(crate) fn with_session<R>(&self, unit: UnitKey, f: impl FnOnce(&MediaSession) -> R) -> Option<R> {
        let sessions = self.sessions.lock().expect("Mutex should not be poisoned");
        sessions.get(&unit).map(f)
    }

    pub(crate) fn stop_all_media(&self) {
        let sessions: Vec<MediaSession> = self
            .sessions
            .lock()
            .expect("Mutex should not be poisoned")
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.stop();
        }
    }

    fn start_media(&self, call: FsmKey) {
        let Some(device) = self.media.device.clone() else {
            return;
        };
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let unit = call.unit();
        let mut sessions = self.sessions.lock().expect("Mutex should not be poisoned");
        if sessions.contains_key(&unit) {
            return;
        }
        let session = MediaSession::new(engine, unit, self.media.config.clone());
        let platform = self.media.decoder.as_ref().and_then(|factory| factory());
        match session.start(device, self.media.sink.clone(), platform) {
            Ok(()) => {
                sessions.insert(unit, session);
            }
            Err(e) => warn!("{call}: cannot start media: {e}"),
        }
    }

    fn stop_media(&self, unit: UnitKey) {
        let session = self
            .sessions
            .lock()
            .expect("Mutex should not be poisoned")
            .remove(&unit);
        if let Some(session) = session {
            session.stop();
        }
    }

    fn on_status_change(&self, call: FsmKey, change: &StatusChange) {
        let listener = self.call_events();
        if let Some(listener) = &listener {
            listener.on_status_change(call, change);
        }
        if change.status == change.previous {
            if let (Some(listener), Some(divert)) = (&listener, &change.divert) {
                listener.on_diverted(call, divert.result);
            }
            return;
        }
        match change.status {
            CallFsmStatus::InAlerting => {
                if let Some(listener) = &listener {
                    listener.on_incoming_call(call, change);
                }
            }
            CallFsmStatus::Connected => {
                self.start_media(call);
                if let Some(listener) = &listener {
                    listener.on_capabilities(call, change.capabilities);
                    listener.on_answered(call);
                }
            }
            CallFsmStatus::Closed => {
                self.stop_media(call.unit());
                if let Some(listener) = &listener {
                    if let Some(divert) = &change.divert {
                        listener.on_diverted(call, divert.result);
                    }
                    if let Some(cause) = change.cause {
                        listener.on_release(call, cause);
                    }
                    listener.on_call_end(call);
                }
            }
            _ => {}
        }
    }

    fn on_tunnel_closed(&self) {
        if self.tunnel_lost.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_all_media();
        if let Some(callback) = self.callback() {
            callback.on_error(CmgError::Connection("tunnel lost".into()));
            callback.on_disconnected();
        }
    }
}

impl EventHandler for CallbackBridge {
    fn interested_in(&self, kind: EventKind) -> bool {
        matches!(
            kind,
            EventKind::CallFsmStatusChange
                | EventKind::RtspFsmStatusChange
                | EventKind::CapReport
                | EventKind::HandleMediaReq
                | EventKind::TunnelClosed
        )
    }

    fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::CallFsmStatusChange(change) | EventPayload::RtspFsmStatusChange(change) => {
                match event.fsm_key() {
                    Some(call) => self.on_status_change(call, change),
                    None => debug!("Status change without fsm id on {}", event.unit_key()),
                }
            }
            EventPayload::CapReport { capabilities, .. } => {
                if let (Some(call), Some(listener)) = (event.fsm_key(), self.call_events()) {
                    listener.on_capabilities(call, *capabilities);
                }
            }
            EventPayload::HandleMediaReq { request } => {
                if let Some(listener) = self.call_events() {
                    listener.on_media_request(event.unit_key(), *request);
                }
            }
            EventPayload::TunnelClosed { .. } => self.on_tunnel_closed(),
            _ => {}
        }
    }
}
