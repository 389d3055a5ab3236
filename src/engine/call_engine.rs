//! The call engine context.
//!
//! [`CallEngine`] owns the system/unit/call registry, forwards requests to
//! the [`NativeEngine`] and drives every [`CallFsm`] from events delivered
//! on the bus. It registers itself as a bus handler on construction, so
//! inbound protocol events reach the state machines without further wiring.
//!
//! The registry lock is never held while posting to the bus or calling the
//! native engine: bus delivery is synchronous and may re-enter the engine.

use super::native::NativeEngine;
use crate::config::CallTimers;
use crate::error::{ENGINE_ALREADY_CLOSED, ENGINE_OK, EngineError, EngineResult, MediaError};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use vipcore::fsm::{CallFsm, CallSetup, FsmFlavour, FsmInput, FsmOutput};
use vipcore::media::{AudioPacket, DecoderKind, VideoPacket};
use vipcore::types::{
    CallFsmStatus, CallType, FsmId, FsmKey, LogicalAddress, MediaRequest, ReleaseCause, SysId,
    SubscriptionId, UnitCapability, UnitFlags, UnitId, UnitKey, UnitType,
};
use vipcore::{CoreEventBus, Event, EventHandler, EventKind, EventPayload};

/// Current time on the tokio clock, so paused-time tests drive the dwell
/// timers. Falls back to the system clock outside a runtime.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Outgoing call accepted locally but not yet by the native engine. Inputs
/// that arrive for it in the meantime are replayed once the FSM exists.
struct Dialing {
    fsm_id: FsmId,
    deferred: Vec<FsmInput>,
}

struct UnitEntry {
    unit_type: UnitType,
    flags: UnitFlags,
    calls: HashMap<FsmId, CallFsm>,
    next_fsm: u32,
    dialing: Option<Dialing>,
    recording: Option<PathBuf>,
}

impl UnitEntry {
    fn new(unit_type: UnitType, flags: UnitFlags) -> Self {
        Self {
            unit_type,
            flags,
            calls: HashMap::new(),
            next_fsm: 0,
            dialing: None,
            recording: None,
        }
    }

    fn active_calls(&self) -> impl Iterator<Item = &CallFsm> {
        self.calls.values().filter(|c| !c.is_closed())
    }

    fn is_busy(&self) -> bool {
        self.dialing.is_some() || self.active_calls().next().is_some()
    }

    /// Next id not held by a live call. Closed calls are tombstones and
    /// their ids may be reused.
    fn allocate_fsm_id(&mut self) -> FsmId {
        loop {
            self.next_fsm = self.next_fsm.wrapping_add(1).max(1);
            let id = FsmId::new(self.next_fsm);
            match self.calls.get(&id) {
                Some(call) if !call.is_closed() => continue,
                _ => return id,
            }
        }
    }

    fn setup(&self, timers: &CallTimers, call_type: CallType) -> CallSetup {
        CallSetup {
            call_type,
            main_address: LogicalAddress::default(),
            sub_address: LogicalAddress::default(),
            capabilities: UnitCapability::NONE,
            times: timers.get(self.unit_type),
            flavour: FsmFlavour::for_unit_type(self.unit_type),
        }
    }
}

#[derive(Default)]
struct SystemEntry {
    units: HashMap<UnitId, UnitEntry>,
    next_unit: u32,
}

#[derive(Default)]
struct Registry {
    systems: HashMap<SysId, SystemEntry>,
    next_sys: u32,
}

impl Registry {
    fn system_mut(&mut self, sys_id: SysId) -> EngineResult<&mut SystemEntry> {
        self.systems
            .get_mut(&sys_id)
            .ok_or(EngineError::UnknownSystem)
    }

    fn unit(&self, key: UnitKey) -> EngineResult<&UnitEntry> {
        self.systems
            .get(&key.sys_id)
            .ok_or(EngineError::UnknownSystem)?
            .units
            .get(&key.unit_id)
            .ok_or(EngineError::UnknownUnit)
    }

    fn unit_mut(&mut self, key: UnitKey) -> EngineResult<&mut UnitEntry> {
        self.system_mut(key.sys_id)?
            .units
            .get_mut(&key.unit_id)
            .ok_or(EngineError::UnknownUnit)
    }

    fn call_mut(&mut self, key: FsmKey) -> EngineResult<&mut CallFsm> {
        self.unit_mut(key.unit())?
            .calls
            .get_mut(&key.fsm_id)
            .ok_or(EngineError::UnknownFsm)
    }
}

/// Side effects collected under the registry lock and applied after it
/// is released.
#[derive(Default)]
struct Effects {
    events: Vec<Event>,
    keyframe_for: Option<UnitKey>,
}

impl Effects {
    fn collect(&mut self, call: &CallFsm, outputs: Vec<FsmOutput>) {
        for output in outputs {
            match output {
                FsmOutput::StatusChange(change) => self.events.push(call.status_event(change)),
                FsmOutput::Media(MediaRequest::KeyFrame) => {
                    self.keyframe_for = Some(call.key().unit());
                }
                FsmOutput::Media(request) => {
                    debug!("{}: media request {request:?} left to the media session", call.key());
                }
                FsmOutput::Renegotiate(error) => {
                    info!("{}: media path reported {error}, requesting keyframe", call.key());
                    self.keyframe_for = Some(call.key().unit());
                }
            }
        }
    }
}

pub struct CallEngine {
    native: Arc<dyn NativeEngine>,
    bus: CoreEventBus,
    timers: CallTimers,
    registry: Mutex<Registry>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl CallEngine {
    /// Creates the engine and registers it on `bus`.
    pub fn new(native: Arc<dyn NativeEngine>, bus: CoreEventBus, timers: CallTimers) -> Arc<Self> {
        let engine = Arc::new(Self {
            native,
            bus,
            timers,
            registry: Mutex::new(Registry::default()),
            subscription: Mutex::new(None),
        });
        let id = engine.bus.register(&engine);
        *engine
            .subscription
            .lock()
            .expect("Mutex should not be poisoned") = Some(id);
        engine
    }

    pub fn bus(&self) -> &CoreEventBus {
        &self.bus
    }

    pub fn native(&self) -> &Arc<dyn NativeEngine> {
        &self.native
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("Mutex should not be poisoned")
    }

    fn apply(&self, effects: Effects) {
        if let Some(unit) = effects.keyframe_for
            && let Some(err) = EngineError::from_code(self.native.request_keyframe(unit))
        {
            debug!("{unit}: keyframe request rejected: {err}");
        }
        for event in effects.events {
            self.bus.post(event);
        }
    }

    // Lifecycle

    pub fn start(&self) -> EngineResult<()> {
        EngineError::check(self.native.start())?;
        info!("Call engine started");
        Ok(())
    }

    /// Closes every live call, drops all systems and stops the native engine.
    pub fn stop(&self) {
        let mut effects = Effects::default();
        {
            let mut registry = self.registry();
            for system in registry.systems.values_mut() {
                for unit in system.units.values_mut() {
                    close_all(unit, ReleaseCause::Cancelled, &mut effects);
                }
            }
            registry.systems.clear();
        }
        self.native.stop();
        self.apply(effects);
        info!("Call engine stopped");
    }

    pub fn is_alive(&self) -> bool {
        self.native.is_alive()
    }

    fn ensure_alive(&self) -> EngineResult<()> {
        if self.native.is_alive() {
            Ok(())
        } else {
            Err(EngineError::NotStarted)
        }
    }

    // Systems and units

    pub fn create_base_system(&self) -> EngineResult<SysId> {
        self.ensure_alive()?;
        let sys_id = {
            let mut registry = self.registry();
            registry.next_sys = registry.next_sys.wrapping_add(1).max(1);
            SysId::new(registry.next_sys)
        };
        EngineError::check(self.native.create_system(sys_id))?;
        self.registry()
            .systems
            .insert(sys_id, SystemEntry::default());
        debug!("Created system {sys_id}");
        Ok(sys_id)
    }

    pub fn remove_system(&self, sys_id: SysId) -> EngineResult<()> {
        if !self.registry().systems.contains_key(&sys_id) {
            return Err(EngineError::UnknownSystem);
        }
        EngineError::check(self.native.remove_system(sys_id))?;
        let mut effects = Effects::default();
        if let Some(mut system) = self.registry().systems.remove(&sys_id) {
            for unit in system.units.values_mut() {
                close_all(unit, ReleaseCause::Cancelled, &mut effects);
            }
        }
        self.apply(effects);
        debug!("Removed system {sys_id}");
        Ok(())
    }

    pub fn create_unit(
        &self,
        sys_id: SysId,
        unit_type: UnitType,
        flags: UnitFlags,
    ) -> EngineResult<UnitId> {
        self.ensure_alive()?;
        let key = {
            let mut registry = self.registry();
            let system = registry.system_mut(sys_id)?;
            system.next_unit = system.next_unit.wrapping_add(1).max(1);
            UnitKey::new(sys_id, UnitId::new(system.next_unit))
        };
        EngineError::check(self.native.create_unit(key, unit_type, flags))?;
        self.registry()
            .system_mut(sys_id)?
            .units
            .insert(key.unit_id, UnitEntry::new(unit_type, flags));
        debug!("Created {} unit {key}", unit_type.as_str());
        Ok(key.unit_id)
    }

    pub fn remove_unit(&self, unit: UnitKey) -> EngineResult<()> {
        self.registry().unit(unit)?;
        EngineError::check(self.native.remove_unit(unit))?;
        let mut effects = Effects::default();
        if let Ok(system) = self.registry().system_mut(unit.sys_id)
            && let Some(mut entry) = system.units.remove(&unit.unit_id)
        {
            close_all(&mut entry, ReleaseCause::Cancelled, &mut effects);
        }
        self.apply(effects);
        debug!("Removed unit {unit}");
        Ok(())
    }

    pub fn unit_type(&self, unit: UnitKey) -> Option<UnitType> {
        self.registry().unit(unit).ok().map(|u| u.unit_type)
    }

    /// Decoder selected for the unit's video, fixed at unit creation.
    pub fn decoder_kind(&self, unit: UnitKey) -> Option<DecoderKind> {
        self.registry().unit(unit).ok().map(|u| {
            if u.flags.contains(UnitFlags::SOFTWARE_DECODE) {
                DecoderKind::Software
            } else {
                DecoderKind::Hardware
            }
        })
    }

    // Calls

    /// Asks the native engine to answer an alerting call. Returns once the
    /// request is accepted; the call stays alerting until the unit confirms
    /// the connection with an event.
    pub fn answer_call(&self, call: FsmKey) -> EngineResult<()> {
        let call_type = {
            let mut registry = self.registry();
            let fsm = registry.call_mut(call)?;
            if fsm.status() != CallFsmStatus::InAlerting {
                return Err(EngineError::InvalidState);
            }
            fsm.call_type()
        };
        EngineError::check(self.native.answer_call(call, call_type))?;
        let mut registry = self.registry();
        if let Ok(fsm) = registry.call_mut(call)
            && let Err(e) = fsm.handle(FsmInput::LocalAnswer, now())
        {
            debug!("{call}: answer raced with {e}");
        }
        Ok(())
    }

    /// Releases a call. Returns [`ENGINE_ALREADY_CLOSED`] without touching
    /// the native engine when the call is already closed, and [`ENGINE_OK`]
    /// when a release is already in progress.
    pub fn release_call(&self, call: FsmKey, cause: ReleaseCause) -> EngineResult<i32> {
        {
            let mut registry = self.registry();
            let fsm = registry.call_mut(call)?;
            if fsm.is_closed() {
                return Ok(ENGINE_ALREADY_CLOSED);
            }
            if fsm.is_closing() {
                return Ok(ENGINE_OK);
            }
        }
        EngineError::check(self.native.release_call(call, cause))?;
        let mut effects = Effects::default();
        {
            let mut registry = self.registry();
            if let Ok(fsm) = registry.call_mut(call) {
                match fsm.handle(FsmInput::LocalRelease { cause }, now()) {
                    Ok(outputs) => effects.collect(fsm, outputs),
                    Err(e) => warn!("{call}: {e}"),
                }
            }
        }
        self.apply(effects);
        Ok(ENGINE_OK)
    }

    /// Starts an outgoing call from `unit` to `address`.
    ///
    /// The fsm id is reserved under the same lock as the busy check, so a
    /// concurrent dial sees the unit busy and a reply that beats the native
    /// engine's return is held until the call exists.
    pub fn start_outgoing_call(
        &self,
        unit: UnitKey,
        address: LogicalAddress,
        call_type: CallType,
    ) -> EngineResult<FsmId> {
        self.ensure_alive()?;
        let (key, mut setup) = {
            let mut registry = self.registry();
            let entry = registry.unit_mut(unit)?;
            if entry.is_busy() {
                return Err(EngineError::Busy);
            }
            let fsm_id = entry.allocate_fsm_id();
            entry.dialing = Some(Dialing {
                fsm_id,
                deferred: Vec::new(),
            });
            (unit.fsm(fsm_id), entry.setup(&self.timers, call_type))
        };

        if let Err(err) = EngineError::check(self.native.start_outgoing_call(key, &address, call_type)) {
            if let Ok(entry) = self.registry().unit_mut(unit) {
                entry.dialing = None;
            }
            return Err(err);
        }
        setup.main_address = address;

        let mut effects = Effects::default();
        {
            let mut registry = self.registry();
            let entry = registry.unit_mut(unit)?;
            let deferred = entry
                .dialing
                .take()
                .filter(|d| d.fsm_id == key.fsm_id)
                .map(|d| d.deferred)
                .unwrap_or_default();
            let at = now();
            let (mut fsm, change) = CallFsm::new_outgoing(key, setup, at);
            effects.events.push(fsm.status_event(change));
            for input in deferred {
                debug!("{key}: replaying {input:?} received while dialing");
                match fsm.handle(input, at) {
                    Ok(outputs) => effects.collect(&fsm, outputs),
                    Err(e) => warn!("{key}: dropping event, {e}"),
                }
            }
            entry.calls.insert(key.fsm_id, fsm);
        }
        self.apply(effects);
        Ok(key.fsm_id)
    }

    pub fn call_status(&self, call: FsmKey) -> Option<CallFsmStatus> {
        self.registry().call_mut(call).ok().map(|fsm| fsm.status())
    }

    pub fn call_capabilities(&self, call: FsmKey) -> Option<UnitCapability> {
        self.registry().call_mut(call).ok().map(|fsm| fsm.capabilities())
    }

    /// The unit's live call, if any.
    pub fn active_call(&self, unit: UnitKey) -> Option<FsmKey> {
        let registry = self.registry();
        let entry = registry.unit(unit).ok()?;
        entry.active_calls().next().map(|c| c.key())
    }

    // Media

    pub fn send_audio_packet(&self, unit: UnitKey, packet: &AudioPacket) -> EngineResult<()> {
        self.registry().unit(unit)?;
        EngineError::check(self.native.send_audio_packet(unit, packet)).map(drop)
    }

    /// Next received audio packet, or `None` when nothing is queued.
    pub fn get_audio_packet(&self, unit: UnitKey) -> Option<AudioPacket> {
        self.native.get_audio_packet(unit)
    }

    pub fn send_video_packet(&self, unit: UnitKey, packet: &VideoPacket) -> EngineResult<()> {
        self.registry().unit(unit)?;
        EngineError::check(self.native.send_video_packet(unit, packet)).map(drop)
    }

    pub fn get_video_frame(&self, unit: UnitKey) -> Option<VideoPacket> {
        self.native.get_video_frame(unit)
    }

    pub fn request_keyframe(&self, unit: UnitKey) -> EngineResult<()> {
        self.registry().unit(unit)?;
        EngineError::check(self.native.request_keyframe(unit)).map(drop)
    }

    /// Starts recording the unit's media to `path`. Fails while another
    /// recording is active on the unit.
    pub fn start_recording(&self, unit: UnitKey, path: &Path) -> Result<(), MediaError> {
        {
            let mut registry = self.registry();
            let entry = registry.unit_mut(unit)?;
            if entry.recording.is_some() {
                return Err(MediaError::RecordingActive);
            }
            entry.recording = Some(path.to_path_buf());
        }
        if let Err(err) = EngineError::check(self.native.start_recording(unit, path)) {
            if let Ok(entry) = self.registry().unit_mut(unit) {
                entry.recording = None;
            }
            return Err(err.into());
        }
        info!("{unit}: recording to {}", path.display());
        Ok(())
    }

    /// Stops the active recording and returns its path.
    pub fn stop_recording(&self, unit: UnitKey) -> Result<PathBuf, MediaError> {
        let path = self
            .registry()
            .unit_mut(unit)?
            .recording
            .take()
            .ok_or(MediaError::NoRecording)?;
        EngineError::check(self.native.stop_recording(unit))?;
        Ok(path)
    }

    pub fn is_recording(&self, unit: UnitKey) -> bool {
        self.registry()
            .unit(unit)
            .map(|u| u.recording.is_some())
            .unwrap_or(false)
    }

    pub fn take_snapshot(&self, unit: UnitKey, path: &Path) -> Result<(), MediaError> {
        self.registry().unit(unit)?;
        EngineError::check(self.native.take_snapshot(unit, path))?;
        Ok(())
    }

    // Actuators

    /// Capabilities reported by the unit's live call. Empty when no call is
    /// up or the unit has not reported yet.
    fn reported_capabilities(&self, unit: UnitKey) -> EngineResult<UnitCapability> {
        let registry = self.registry();
        let entry = registry.unit(unit)?;
        Ok(entry
            .active_calls()
            .fold(UnitCapability::NONE, |acc, c| acc | c.capabilities()))
    }

    fn require_capability(&self, unit: UnitKey, cap: UnitCapability) -> EngineResult<()> {
        let caps = self.reported_capabilities(unit)?;
        if !caps.is_empty() && !caps.contains(cap) {
            return Err(EngineError::Unsupported);
        }
        Ok(())
    }

    pub fn open_door(&self, unit: UnitKey, relay: u8) -> EngineResult<()> {
        self.require_capability(unit, UnitCapability::DOOR_OPEN)?;
        EngineError::check(self.native.open_door(unit, relay))?;
        info!("{unit}: door relay {relay} triggered");
        Ok(())
    }

    pub fn switch_video_source(&self, unit: UnitKey, source: u8) -> EngineResult<()> {
        self.require_capability(unit, UnitCapability::VIDEO_SOURCE_SWITCH)?;
        EngineError::check(self.native.switch_video_source(unit, source)).map(drop)
    }

    // Timers

    /// Posts `TimerExpired` for every live call whose dwell deadline has
    /// passed. Returns how many calls expired.
    pub fn expire_timers(&self, now: Instant) -> usize {
        let expired: Vec<FsmKey> = {
            let registry = self.registry();
            registry
                .systems
                .values()
                .flat_map(|s| s.units.values())
                .flat_map(|u| u.calls.values())
                .filter(|c| c.is_expired(now))
                .map(|c| c.key())
                .collect()
        };
        for key in &expired {
            debug!(target: "Engine/Timers", "{key}: dwell timer expired");
            self.bus.post(Event::fsm(*key, EventPayload::TimerExpired));
        }
        expired.len()
    }

    /// Earliest pending dwell deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        let registry = self.registry();
        registry
            .systems
            .values()
            .flat_map(|s| s.units.values())
            .flat_map(|u| u.calls.values())
            .filter_map(|c| c.deadline())
            .min()
    }

    /// Spawns a task calling [`Self::expire_timers`] every `tick`. The task
    /// ends when the engine is dropped.
    pub fn spawn_timer_driver(self: &Arc<Self>, tick: Duration) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.expire_timers(now());
            }
            debug!(target: "Engine/Timers", "Engine dropped, timer driver exiting");
        })
    }

    // Inbound events

    fn on_incoming(&self, event: &Event) -> (Effects, Option<FsmKey>) {
        let mut effects = Effects::default();
        let EventPayload::IncomingCall {
            call_type,
            main_address,
            sub_address,
            capabilities,
        } = &event.payload
        else {
            return (effects, None);
        };
        let Some(key) = event.fsm_key() else {
            warn!("Incoming call without fsm id on {}", event.unit_key());
            return (effects, None);
        };

        let mut registry = self.registry();
        let entry = match registry.unit_mut(key.unit()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Dropping incoming call {key}: {e}");
                return (effects, None);
            }
        };
        if entry.calls.get(&key.fsm_id).is_some_and(|c| !c.is_closed()) {
            warn!("Dropping incoming call {key}: fsm id still in use");
            return (effects, None);
        }

        let mut setup = entry.setup(&self.timers, *call_type);
        setup.main_address = main_address.clone();
        setup.sub_address = sub_address.clone();
        setup.capabilities = *capabilities;
        let (fsm, change) = CallFsm::new_incoming(key, setup, now());
        effects.events.push(fsm.status_event(change));
        entry.calls.insert(key.fsm_id, fsm);
        info!("Incoming {call_type:?} call {key} from {main_address}");

        let auto_answer = entry.flags.contains(UnitFlags::AUTO_ANSWER).then_some(key);
        (effects, auto_answer)
    }

    fn on_tunnel_closed(&self, unit: UnitKey) -> Effects {
        let mut effects = Effects::default();
        if let Ok(entry) = self.registry().unit_mut(unit) {
            close_all(entry, ReleaseCause::CtpDisconnected, &mut effects);
        }
        effects
    }

    fn drive(&self, key: FsmKey, input: FsmInput) -> Effects {
        let mut effects = Effects::default();
        let mut registry = self.registry();
        let entry = match registry.unit_mut(key.unit()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Dropping {input:?} for {key}: {e}");
                return effects;
            }
        };
        let Some(fsm) = entry.calls.get_mut(&key.fsm_id) else {
            match entry.dialing.as_mut() {
                Some(dialing) if dialing.fsm_id == key.fsm_id => {
                    debug!("{key}: holding {input:?} until the dial is accepted");
                    dialing.deferred.push(input);
                }
                _ => warn!("Dropping {input:?} for {key}: {}", EngineError::UnknownFsm),
            }
            return effects;
        };
        match fsm.handle(input, now()) {
            Ok(outputs) => effects.collect(fsm, outputs),
            Err(e) => warn!("{key}: dropping event, {e}"),
        }
        effects
    }
}

/// Closes every live call on `unit` with `cause`.
fn close_all(unit: &mut UnitEntry, cause: ReleaseCause, effects: &mut Effects) {
    let at = now();
    for fsm in unit.calls.values_mut().filter(|c| !c.is_closed()) {
        match fsm.handle(FsmInput::Released { cause }, at) {
            Ok(outputs) => effects.collect(fsm, outputs),
            Err(e) => warn!("{}: {e}", fsm.key()),
        }
    }
}

impl EventHandler for CallEngine {
    fn interested_in(&self, kind: EventKind) -> bool {
        !kind.is_status_change()
    }

    fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::IncomingCall { .. } => {
                let (effects, auto_answer) = self.on_incoming(event);
                self.apply(effects);
                if let Some(key) = auto_answer
                    && let Err(e) = self.answer_call(key)
                {
                    warn!("{key}: auto-answer failed: {e}");
                }
            }
            EventPayload::TunnelOpened => {
                debug!("Tunnel opened for {}", event.unit_key());
            }
            EventPayload::TunnelClosed { error } => {
                info!("Tunnel closed for {} ({error:?})", event.unit_key());
                let effects = self.on_tunnel_closed(event.unit_key());
                self.apply(effects);
            }
            payload => match (event.fsm_key(), FsmInput::from_payload(payload)) {
                (Some(key), Some(input)) => {
                    let effects = self.drive(key, input);
                    self.apply(effects);
                }
                (None, Some(FsmInput::ConnectionError { error })) => {
                    info!("{}: connection error {error}", event.unit_key());
                    self.apply(Effects {
                        events: Vec::new(),
                        keyframe_for: Some(event.unit_key()),
                    });
                }
                (None, Some(input)) => {
                    warn!("Dropping {input:?} without fsm id on {}", event.unit_key());
                }
                (_, None) => {
                    if let EventPayload::UnitStatusReport { status, .. } = payload {
                        debug!("{event}: unit reports {status}, nothing to drive");
                    }
                }
            },
        }
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        if let Ok(mut subscription) = self.subscription.lock()
            && let Some(id) = subscription.take()
        {
            self.bus.unregister(id);
        }
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("alive", &self.native.is_alive())
            .finish_non_exhaustive()
    }
}
