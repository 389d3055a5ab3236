use crate::types::call::{
    CallDirection, CallFsmStatus, CallType, ConnError, DivertInfo, MediaRequest,
    OutDivertActionResult, ReleaseCause,
};
use crate::types::unit::{FsmId, FsmKey, LogicalAddress, SysId, UnitCapability, UnitId, UnitKey};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::ThreadId;

/// Progress notification reported by an RTSP-style unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum RtspEvent {
    /// Stream described and set up, waiting for play.
    Ready,
    Playing,
    Teardown { cause: ReleaseCause },
    Error,
}

/// Snapshot of a call FSM published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub status: CallFsmStatus,
    pub previous: CallFsmStatus,
    pub direction: CallDirection,
    pub call_type: CallType,
    pub capabilities: UnitCapability,
    pub main_address: LogicalAddress,
    pub sub_address: LogicalAddress,
    /// Set on the terminal `Closed` change.
    pub cause: Option<ReleaseCause>,
    pub divert: Option<DivertInfo>,
}

impl StatusChange {
    pub fn is_terminal(&self) -> bool {
        self.status.is_closed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "data")]
pub enum EventPayload {
    /// Peer is ringing us.
    IncomingCall {
        call_type: CallType,
        main_address: LogicalAddress,
        sub_address: LogicalAddress,
        capabilities: UnitCapability,
    },
    /// Our outgoing call is ringing at the peer.
    OutAlerting,
    CapReport {
        capabilities: UnitCapability,
        answered: bool,
    },
    Connected,
    VipCallRelease {
        cause: ReleaseCause,
    },
    VipDiverted {
        direction: CallDirection,
        address: LogicalAddress,
        result: OutDivertActionResult,
    },
    TimerExpired,
    ConnectionError {
        error: ConnError,
    },
    HandleMediaReq {
        request: MediaRequest,
    },
    RtspFsmEvent {
        event: RtspEvent,
    },
    TunnelOpened,
    TunnelClosed {
        error: Option<ConnError>,
    },
    /// Call status as seen by firmware running its own FSM. Drives the
    /// local FSM like any other input; it is never republished as a
    /// status change.
    UnitStatusReport {
        status: CallFsmStatus,
        cause: Option<ReleaseCause>,
    },
    CallFsmStatusChange(StatusChange),
    RtspFsmStatusChange(StatusChange),
}

/// Discriminant of [`EventPayload`], used for subscriber filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    IncomingCall,
    OutAlerting,
    CapReport,
    Connected,
    VipCallRelease,
    VipDiverted,
    TimerExpired,
    ConnectionError,
    HandleMediaReq,
    RtspFsmEvent,
    TunnelOpened,
    TunnelClosed,
    UnitStatusReport,
    CallFsmStatusChange,
    RtspFsmStatusChange,
}

impl EventKind {
    /// Status changes are produced by the FSM; everything else drives it.
    pub const fn is_status_change(&self) -> bool {
        matches!(self, Self::CallFsmStatusChange | Self::RtspFsmStatusChange)
    }
}

/// A unit event. `fsm_id` is present for call-scoped events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub sys_id: SysId,
    pub unit_id: UnitId,
    pub fsm_id: Option<FsmId>,
    pub payload: EventPayload,
}

impl Event {
    pub fn unit(sys_id: SysId, unit_id: UnitId, payload: EventPayload) -> Self {
        Self {
            sys_id,
            unit_id,
            fsm_id: None,
            payload,
        }
    }

    pub fn fsm(key: FsmKey, payload: EventPayload) -> Self {
        Self {
            sys_id: key.sys_id,
            unit_id: key.unit_id,
            fsm_id: Some(key.fsm_id),
            payload,
        }
    }

    pub fn unit_key(&self) -> UnitKey {
        UnitKey::new(self.sys_id, self.unit_id)
    }

    pub fn fsm_key(&self) -> Option<FsmKey> {
        self.fsm_id.map(|fsm_id| self.unit_key().fsm(fsm_id))
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::IncomingCall { .. } => EventKind::IncomingCall,
            EventPayload::OutAlerting => EventKind::OutAlerting,
            EventPayload::CapReport { .. } => EventKind::CapReport,
            EventPayload::Connected => EventKind::Connected,
            EventPayload::VipCallRelease { .. } => EventKind::VipCallRelease,
            EventPayload::VipDiverted { .. } => EventKind::VipDiverted,
            EventPayload::TimerExpired => EventKind::TimerExpired,
            EventPayload::ConnectionError { .. } => EventKind::ConnectionError,
            EventPayload::HandleMediaReq { .. } => EventKind::HandleMediaReq,
            EventPayload::RtspFsmEvent { .. } => EventKind::RtspFsmEvent,
            EventPayload::TunnelOpened => EventKind::TunnelOpened,
            EventPayload::TunnelClosed { .. } => EventKind::TunnelClosed,
            EventPayload::UnitStatusReport { .. } => EventKind::UnitStatusReport,
            EventPayload::CallFsmStatusChange(_) => EventKind::CallFsmStatusChange,
            EventPayload::RtspFsmStatusChange(_) => EventKind::RtspFsmStatusChange,
        }
    }

    /// The status change carried by this event, for either protocol flavour.
    pub fn status_change(&self) -> Option<&StatusChange> {
        match &self.payload {
            EventPayload::CallFsmStatusChange(change) | EventPayload::RtspFsmStatusChange(change) => {
                Some(change)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fsm_id {
            Some(fsm_id) => write!(
                f,
                "{:?}@{}/{}/{}",
                self.kind(),
                self.sys_id,
                self.unit_id,
                fsm_id
            ),
            None => write!(f, "{:?}@{}/{}", self.kind(), self.sys_id, self.unit_id),
        }
    }
}

pub trait EventHandler: Send + Sync {
    /// Whether this subscriber wants events of `kind`. Uninterested
    /// subscribers are skipped entirely.
    fn interested_in(&self, _kind: EventKind) -> bool {
        true
    }

    fn handle_event(&self, event: &Event);
}

/// Handle returned by [`CoreEventBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: Weak<dyn EventHandler>,
}

#[derive(Default)]
struct BusInner {
    handlers: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    pending: Mutex<VecDeque<Event>>,
    /// Serialises delivery so subscribers never observe two events at once.
    delivery: Mutex<()>,
    /// Thread currently draining `pending`. A `post` from that thread is a
    /// re-entrant post and only enqueues.
    drain_owner: Mutex<Option<ThreadId>>,
}

/// Synchronous publish/subscribe dispatcher.
///
/// Subscribers are held by weak reference; dropping the last `Arc` to a
/// handler unsubscribes it. Each event reaches subscribers in registration
/// order and [`post`](Self::post) returns only after it has. Delivery runs
/// on the posting thread unless another thread is already delivering; that
/// thread then delivers the new event too while the poster waits. An event
/// posted from inside a handler is delivered after the current event has
/// reached every subscriber.
#[derive(Default, Clone)]
pub struct CoreEventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for CoreEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreEventBus")
            .field("handlers", &self.handler_count())
            .finish_non_exhaustive()
    }
}

impl CoreEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: EventHandler + 'static>(&self, handler: &Arc<H>) -> SubscriptionId {
        let weak: Weak<dyn EventHandler> = Arc::downgrade(handler) as Weak<H>;
        self.push_subscription(weak)
    }

    pub fn register_dyn(&self, handler: &Arc<dyn EventHandler>) -> SubscriptionId {
        self.push_subscription(Arc::downgrade(handler))
    }

    fn push_subscription(&self, handler: Weak<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(Subscription { id, handler });
        id
    }

    /// Removes a subscriber. Unknown ids are ignored.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .expect("RwLock should not be poisoned");
        let before = handlers.len();
        handlers.retain(|sub| sub.id != id);
        handlers.len() != before
    }

    /// Returns true if there are any live subscribers.
    pub fn has_handlers(&self) -> bool {
        self.inner
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
            .any(|sub| sub.handler.strong_count() > 0)
    }

    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
            .filter(|sub| sub.handler.strong_count() > 0)
            .count()
    }

    /// Queues `event` and blocks until it has been delivered, possibly by
    /// the thread already delivering. Re-entrant posts return at once.
    pub fn post(&self, event: Event) {
        self.inner
            .pending
            .lock()
            .expect("Mutex should not be poisoned")
            .push_back(event);

        let me = std::thread::current().id();
        if *self
            .inner
            .drain_owner
            .lock()
            .expect("Mutex should not be poisoned")
            == Some(me)
        {
            return;
        }

        let _delivery = self
            .inner
            .delivery
            .lock()
            .expect("Mutex should not be poisoned");
        *self
            .inner
            .drain_owner
            .lock()
            .expect("Mutex should not be poisoned") = Some(me);
        let inner = &self.inner;
        let _owner = scopeguard::guard((), |_| {
            if let Ok(mut owner) = inner.drain_owner.lock() {
                *owner = None;
            }
        });

        loop {
            let next = self
                .inner
                .pending
                .lock()
                .expect("Mutex should not be poisoned")
                .pop_front();
            let Some(event) = next else { break };
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &Event) {
        let kind = event.kind();
        let snapshot: Vec<Arc<dyn EventHandler>> = {
            let mut handlers = self
                .inner
                .handlers
                .write()
                .expect("RwLock should not be poisoned");
            handlers.retain(|sub| sub.handler.strong_count() > 0);
            handlers.iter().filter_map(|sub| sub.handler.upgrade()).collect()
        };

        log::trace!(target: "Bus", "delivering {event} to {} subscribers", snapshot.len());
        for handler in snapshot {
            if handler.interested_in(kind) {
                handler.handle_event(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect {
        kinds: Option<Vec<EventKind>>,
        seen: Mutex<Vec<Event>>,
    }

    impl Collect {
        fn all() -> Arc<Self> {
            Arc::new(Self {
                kinds: None,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn only(kinds: Vec<EventKind>) -> Arc<Self> {
            Arc::new(Self {
                kinds: Some(kinds),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Event> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl EventHandler for Collect {
        fn interested_in(&self, kind: EventKind) -> bool {
            self.kinds.as_ref().is_none_or(|kinds| kinds.contains(&kind))
        }

        fn handle_event(&self, event: &Event) {
            self.seen.lock().unwrap().push(event.clone());
        }
    }

    fn ev(fsm: u32, payload: EventPayload) -> Event {
        Event::fsm(UnitKey::new(SysId(1), UnitId(1)).fsm(FsmId(fsm)), payload)
    }

    #[test]
    fn filters_by_declared_interest() {
        let bus = CoreEventBus::new();
        let all = Collect::all();
        let connected_only = Collect::only(vec![EventKind::Connected]);
        bus.register(&all);
        bus.register(&connected_only);

        bus.post(ev(1, EventPayload::OutAlerting));
        bus.post(ev(1, EventPayload::Connected));

        assert_eq!(all.seen().len(), 2);
        let seen = connected_only.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind(), EventKind::Connected);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = CoreEventBus::new();
        let keep = Collect::all();
        bus.register(&keep);
        {
            let gone = Collect::all();
            bus.register(&gone);
            assert_eq!(bus.handler_count(), 2);
        }
        bus.post(ev(1, EventPayload::Connected));
        assert_eq!(bus.handler_count(), 1);
        assert_eq!(keep.seen().len(), 1);
    }

    #[test]
    fn unregister_stops_delivery() {
        let bus = CoreEventBus::new();
        let sub = Collect::all();
        let id = bus.register(&sub);
        assert!(bus.unregister(id));
        assert!(!bus.unregister(id));
        bus.post(ev(1, EventPayload::Connected));
        assert!(sub.seen().is_empty());
    }

    struct Unregisterer {
        bus: CoreEventBus,
        target: Mutex<Option<SubscriptionId>>,
        calls: Mutex<u32>,
    }

    impl EventHandler for Unregisterer {
        fn handle_event(&self, _event: &Event) {
            *self.calls.lock().unwrap() += 1;
            if let Some(id) = self.target.lock().unwrap().take() {
                self.bus.unregister(id);
            }
        }
    }

    #[test]
    fn unregistering_during_delivery_does_not_skip_others() {
        let bus = CoreEventBus::new();
        let first = Arc::new(Unregisterer {
            bus: bus.clone(),
            target: Mutex::new(None),
            calls: Mutex::new(0),
        });
        let second = Collect::all();
        let third = Collect::all();
        bus.register(&first);
        let second_id = bus.register(&second);
        bus.register(&third);
        *first.target.lock().unwrap() = Some(second_id);

        bus.post(ev(1, EventPayload::Connected));
        // Snapshot taken before delivery: everyone sees the first event.
        assert_eq!(second.seen().len(), 1);
        assert_eq!(third.seen().len(), 1);

        bus.post(ev(1, EventPayload::TimerExpired));
        assert_eq!(second.seen().len(), 1);
        assert_eq!(third.seen().len(), 2);
    }

    struct Echoer {
        bus: CoreEventBus,
    }

    impl EventHandler for Echoer {
        fn interested_in(&self, kind: EventKind) -> bool {
            kind == EventKind::Connected
        }

        fn handle_event(&self, event: &Event) {
            self.bus.post(Event {
                payload: EventPayload::TimerExpired,
                ..event.clone()
            });
        }
    }

    #[test]
    fn reentrant_post_is_delivered_after_current_event() {
        let bus = CoreEventBus::new();
        let echo = Arc::new(Echoer { bus: bus.clone() });
        let sink = Collect::all();
        bus.register(&echo);
        bus.register(&sink);

        bus.post(ev(1, EventPayload::Connected));

        let kinds: Vec<_> = sink.seen().iter().map(Event::kind).collect();
        assert_eq!(kinds, vec![EventKind::Connected, EventKind::TimerExpired]);
    }
}
