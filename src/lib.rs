// Re-export the platform-agnostic core
pub use vipcore::{fsm, net, p2p, parser, types};
pub use vipcore::{CoreEventBus, Event, EventHandler, EventKind, EventPayload};

pub mod config;
pub mod engine;
pub mod error;
pub mod framing;
pub mod handler;
pub mod http;
pub mod media;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod tunnel;

pub use config::{CallTimers, ConnectionParams, DirectTunnelParams, ModeFlags};
pub use engine::{CallEngine, NativeEngine, TunnelEngine};
pub use error::{CmgError, EngineError, MediaError, TunnelError};
pub use handler::{CallPresenter, CgCallEventCallback, CgCallback, ConnectionHandler, TunnelMode};
pub use http::UreqHttpClient;
