//! Platform-agnostic core of the intercom call engine: identifiers and
//! events, the event bus, unit message parsers, the call state machine,
//! P2P negotiation types and media primitives.

pub mod fsm;
pub mod media;
pub mod net;
pub mod p2p;
pub mod parser;
pub mod types;

pub use types::events::{CoreEventBus, Event, EventHandler, EventKind, EventPayload};
