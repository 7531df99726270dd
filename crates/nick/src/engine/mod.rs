//! Backend-neutral operation engines
//!
//! Each engine is generic over `PageDriver` and owns all of its
//! per-operation state; nothing survives past the call.

pub mod condition;
pub mod fetch;
pub mod injection;
pub mod navigation;

pub use condition::{Operator, Selectors, WaitArg, WaitMode, WaitSpec};
pub use fetch::{ErrorRingBuffer, FetchState};
pub use injection::InjectSource;
pub use navigation::NavigationOutcome;
