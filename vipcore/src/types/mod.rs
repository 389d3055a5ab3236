pub mod call;
pub mod events;
pub mod unit;

pub use call::*;
pub use events::*;
pub use unit::*;
