//! Call processing: the [`CallEngine`] context over a [`NativeEngine`].

pub mod call_engine;
pub mod native;
pub mod recorder;
pub mod tunnel_engine;

pub use call_engine::CallEngine;
pub use native::NativeEngine;
pub use recorder::{Recorder, read_recording};
pub use tunnel_engine::TunnelEngine;
