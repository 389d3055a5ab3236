//! The application façade.
//!
//! [`ConnectionHandler`] is what a host application holds: it opens the
//! tunnel, builds the [`CallEngine`] over it, creates the base system and
//! the unit, and turns bus events into [`CgCallback`] and
//! [`CgCallEventCallback`] calls. UI actions come back in through
//! [`CallPresenter`].

pub mod bridge;
pub mod callbacks;
pub mod push;

pub use bridge::{DecoderFactory, MediaWiring};
pub use callbacks::{CallPresenter, CgCallEventCallback, CgCallback};
pub use push::{PushAction, PushPayload, PushType, decode_push};

use crate::config::{ConnectionParams, DirectTunnelParams};
use crate::engine::{CallEngine, TunnelEngine};
use crate::error::{CmgError, EngineError, EngineResult, TunnelError};
use crate::tunnel::signaling::MqttClient;
use crate::tunnel::{P2pNegotiator, TunnelHandle, direct};
use bridge::CallbackBridge;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::task::JoinHandle;
use vipcore::CoreEventBus;
use vipcore::net::HttpClient;
use vipcore::p2p::P2pParameters;
use vipcore::types::{
    CallFsmStatus, CallType, FsmKey, LogicalAddress, ReleaseCause, SubscriptionId, SysId, UnitFlags,
    UnitId, UnitKey, UnitType,
};

const TIMER_TICK: Duration = Duration::from_millis(100);

/// Key for connection-scoped events posted before any system exists.
const CONNECTION_UNIT: UnitKey = UnitKey::new(SysId::new(0), UnitId::new(0));

/// How the tunnel to the unit is opened.
#[derive(Debug, Clone)]
pub enum TunnelMode {
    /// TCP to the connection's hostname and port.
    Direct,
    /// ICE negotiation. `session` names the rendezvous; a push may
    /// override it.
    P2p {
        params: P2pParameters,
        session: String,
    },
}

struct Connection {
    engine: Arc<CallEngine>,
    tunnel: Arc<TunnelEngine>,
    unit: UnitKey,
    bridge: Arc<CallbackBridge>,
    subscription: SubscriptionId,
    timer_task: JoinHandle<()>,
}

pub struct ConnectionHandler {
    bus: CoreEventBus,
    http: Arc<dyn HttpClient>,
    mqtt: Option<Arc<dyn MqttClient>>,
    callback: Mutex<Option<Weak<dyn CgCallback>>>,
    call_events: Mutex<Option<Weak<dyn CgCallEventCallback>>>,
    media: Mutex<MediaWiring>,
    configured: Mutex<Option<(ConnectionParams, TunnelMode)>>,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl ConnectionHandler {
    pub fn new(http: Arc<dyn HttpClient>) -> Arc<Self> {
        Self::build(http, None, CoreEventBus::new())
    }

    /// Handler that can use MQTT for P2P signaling.
    pub fn with_mqtt(http: Arc<dyn HttpClient>, mqtt: Arc<dyn MqttClient>) -> Arc<Self> {
        Self::build(http, Some(mqtt), CoreEventBus::new())
    }

    /// Handler posting on an existing bus, so other subscribers see the
    /// engine's events too.
    pub fn with_bus(http: Arc<dyn HttpClient>, bus: CoreEventBus) -> Arc<Self> {
        Self::build(http, None, bus)
    }

    fn build(
        http: Arc<dyn HttpClient>,
        mqtt: Option<Arc<dyn MqttClient>>,
        bus: CoreEventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            http,
            mqtt,
            callback: Mutex::new(None),
            call_events: Mutex::new(None),
            media: Mutex::new(MediaWiring::default()),
            configured: Mutex::new(None),
            connection: Mutex::new(None),
        })
    }

    pub fn bus(&self) -> &CoreEventBus {
        &self.bus
    }

    /// The handler keeps only a weak reference; the host owns the callback.
    pub fn set_callback<C: CgCallback + 'static>(&self, callback: &Arc<C>) {
        let weak: Weak<dyn CgCallback> = Arc::downgrade(callback) as Weak<dyn CgCallback>;
        *self.callback.lock().expect("Mutex should not be poisoned") = Some(weak);
    }

    pub fn set_call_event_callback<C: CgCallEventCallback + 'static>(&self, callback: &Arc<C>) {
        let weak: Weak<dyn CgCallEventCallback> =
            Arc::downgrade(callback) as Weak<dyn CgCallEventCallback>;
        *self.call_events.lock().expect("Mutex should not be poisoned") = Some(weak);
    }

    /// Media wiring for calls set up by later connections.
    pub fn set_media(&self, media: MediaWiring) {
        *self.media.lock().expect("Mutex should not be poisoned") = media;
    }

    fn callback(&self) -> Option<Arc<dyn CgCallback>> {
        self.callback
            .lock()
            .expect("Mutex should not be poisoned")
            .as_ref()?
            .upgrade()
    }

    fn connection(&self) -> EngineResult<Arc<Connection>> {
        self.connection
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
            .ok_or(EngineError::NotStarted)
    }

    pub fn is_connected(&self) -> bool {
        self.connection()
            .map(|c| c.tunnel.is_connected())
            .unwrap_or(false)
    }

    pub fn engine(&self) -> Option<Arc<CallEngine>> {
        self.connection().ok().map(|c| c.engine.clone())
    }

    /// The unit created for this connection.
    pub fn unit(&self) -> Option<UnitKey> {
        self.connection().ok().map(|c| c.unit)
    }

    /// Opens the tunnel and brings the engine up. Errors are also reported
    /// through [`CgCallback::on_error`].
    pub async fn connect(&self, params: ConnectionParams, mode: TunnelMode) -> Result<(), CmgError> {
        let result = self.connect_inner(params, mode).await;
        match &result {
            Ok(()) => {
                if let Some(callback) = self.callback() {
                    callback.on_connected();
                }
            }
            Err(e) => {
                warn!("Connect failed: {e}");
                if let Some(callback) = self.callback() {
                    callback.on_error(e.clone());
                }
            }
        }
        result
    }

    async fn connect_inner(&self, params: ConnectionParams, mode: TunnelMode) -> Result<(), CmgError> {
        if self.connection().is_ok() {
            return Err(CmgError::Generic("already connected".into()));
        }
        *self.configured.lock().expect("Mutex should not be poisoned") =
            Some((params.clone(), mode.clone()));

        let handle = self.open_tunnel(&params, &mode).await.map_err(|e| match e {
            TunnelError::Unauthorized => CmgError::ActivationCode,
            e => CmgError::Connection(e.to_string()),
        })?;
        self.attach(handle, params)
    }

    async fn open_tunnel(
        &self,
        params: &ConnectionParams,
        mode: &TunnelMode,
    ) -> Result<TunnelHandle, TunnelError> {
        match mode {
            TunnelMode::Direct => {
                let addr = lookup_host((params.hostname(), params.port()))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        TunnelError::Io(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("cannot resolve {}", params.hostname()),
                        ))
                    })?;
                direct::connect(&DirectTunnelParams::new(addr.ip(), addr.port())).await
            }
            TunnelMode::P2p {
                params: p2p,
                session,
            } => {
                let mut negotiator =
                    P2pNegotiator::new(p2p.clone(), self.bus.clone(), self.http.clone());
                if let Some(mqtt) = &self.mqtt {
                    negotiator = negotiator.with_mqtt(mqtt.clone());
                }
                negotiator.negotiate(CONNECTION_UNIT, session).await
            }
        }
    }

    /// Builds the engine stack over an open tunnel.
    pub fn attach(&self, handle: TunnelHandle, params: ConnectionParams) -> Result<(), CmgError> {
        let tunnel = TunnelEngine::attach(handle, self.bus.clone());
        let engine = CallEngine::new(tunnel.clone(), self.bus.clone(), params.timers().clone());
        let engine_error = |e: EngineError| CmgError::Connection(format!("engine: {e}"));

        engine.start().map_err(engine_error)?;
        let sys_id = engine.create_base_system().map_err(engine_error)?;
        let mode = params.mode();
        let mut flags = UnitFlags::AUDIO | UnitFlags::VIDEO;
        if mode.software_decode {
            flags |= UnitFlags::SOFTWARE_DECODE;
        }
        if !mode.with_ui {
            flags |= UnitFlags::AUTO_ANSWER;
        }
        let unit_id = engine
            .create_unit(sys_id, UnitType::Vip, flags)
            .map_err(engine_error)?;
        let unit = UnitKey::new(sys_id, unit_id);

        let bridge = CallbackBridge::new(
            &engine,
            self.callback.lock().expect("Mutex should not be poisoned").clone(),
            self.call_events
                .lock()
                .expect("Mutex should not be poisoned")
                .clone(),
            self.media.lock().expect("Mutex should not be poisoned").clone(),
        );
        let subscription = self.bus.register(&bridge);
        let timer_task = engine.spawn_timer_driver(TIMER_TICK);

        info!("Connected to {}:{}, unit {unit}", params.hostname(), params.port());
        *self.connection.lock().expect("Mutex should not be poisoned") = Some(Arc::new(Connection {
            engine,
            tunnel,
            unit,
            bridge,
            subscription,
            timer_task,
        }));
        Ok(())
    }

    /// Closes every call and drops the tunnel. A no-op when not connected.
    pub fn disconnect(&self) {
        let Some(connection) = self
            .connection
            .lock()
            .expect("Mutex should not be poisoned")
            .take()
        else {
            return;
        };
        connection.bridge.stop_all_media();
        connection.engine.stop();
        connection.timer_task.abort();
        self.bus.unregister(connection.subscription);
        info!("Disconnected");
        if let Some(callback) = self.callback() {
            callback.on_disconnected();
        }
    }

    /// Creates an additional unit on the connection's system, e.g. a camera.
    pub fn add_unit(&self, unit_type: UnitType, flags: UnitFlags) -> EngineResult<UnitKey> {
        let connection = self.connection()?;
        let sys_id = connection.unit.sys_id;
        let unit_id = connection.engine.create_unit(sys_id, unit_type, flags)?;
        Ok(UnitKey::new(sys_id, unit_id))
    }

    /// Dials `address` from the connection's unit.
    pub fn dial(&self, address: LogicalAddress, call_type: CallType) -> EngineResult<FsmKey> {
        let connection = self.connection()?;
        let fsm_id = connection
            .engine
            .start_outgoing_call(connection.unit, address, call_type)?;
        Ok(connection.unit.fsm(fsm_id))
    }

    fn current_call(&self) -> EngineResult<(Arc<Connection>, FsmKey)> {
        let connection = self.connection()?;
        let call = connection
            .engine
            .active_call(connection.unit)
            .ok_or(EngineError::InvalidState)?;
        Ok((connection, call))
    }

    /// Handles a push. Only the payload is decoded on the calling thread;
    /// connecting happens on a spawned task using the parameters of the
    /// last [`Self::connect`]. Must be called within a tokio runtime.
    pub fn handle_push_notification(
        self: &Arc<Self>,
        payload: &[u8],
        kind: PushType,
    ) -> Result<(), CmgError> {
        let push = decode_push(payload, kind)?;
        debug!("Push {:?} from {}", push.action, push.caller);
        if push.action == PushAction::Cancel || self.is_connected() {
            return Ok(());
        }
        let (params, mut mode) = self
            .configured
            .lock()
            .expect("Mutex should not be poisoned")
            .clone()
            .ok_or_else(|| CmgError::Generic("push received before any connect".into()))?;
        if let (TunnelMode::P2p { session, .. }, Some(pushed)) = (&mut mode, push.session) {
            *session = pushed;
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CmgError::Generic("no async runtime for push handling".into()))?;

        // A stale connection whose tunnel dropped is replaced.
        self.disconnect();
        let handler = self.clone();
        runtime.spawn(async move {
            if let Err(e) = handler.connect(params, mode).await {
                debug!("Connect on push failed: {e}");
            }
        });
        Ok(())
    }
}

impl CallPresenter for ConnectionHandler {
    fn toggle_answer(&self) -> EngineResult<()> {
        let (connection, call) = self.current_call()?;
        match connection.engine.call_status(call) {
            Some(CallFsmStatus::InAlerting) => connection.engine.answer_call(call),
            Some(_) => connection
                .engine
                .release_call(call, ReleaseCause::Normal)
                .map(drop),
            None => Err(EngineError::UnknownFsm),
        }
    }

    fn toggle_mute(&self) -> EngineResult<bool> {
        let connection = self.connection()?;
        connection
            .bridge
            .with_session(connection.unit, |session| session.toggle_mute())
            .ok_or(EngineError::InvalidState)
    }

    fn open_door(&self, relay: u8) -> EngineResult<()> {
        let connection = self.connection()?;
        connection.engine.open_door(connection.unit, relay)
    }

    fn release(&self) -> EngineResult<i32> {
        let (connection, call) = self.current_call()?;
        connection.engine.release_call(call, ReleaseCause::Normal)
    }

    fn switch_video_source(&self, source: u8) -> EngineResult<()> {
        let connection = self.connection()?;
        connection
            .engine
            .switch_video_source(connection.unit, source)
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if let Ok(mut connection) = self.connection.lock()
            && let Some(connection) = connection.take()
        {
            connection.bridge.stop_all_media();
            connection.engine.stop();
            connection.timer_task.abort();
            self.bus.unregister(connection.subscription);
        }
    }
}
