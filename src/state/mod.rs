//! Cache lifecycle state machine.
//!
//! [`CacheState`] is the snapshot handed to observers. Its
//! [`StateMachine`] is the only way to move to the next snapshot, and every
//! transition attempted from the wrong state fails with
//! [`IllegalTransition`] instead of being clamped.

mod cache_state;
mod machine;

pub use cache_state::{CacheState, CacheStatus};
pub use machine::{IllegalTransition, StateMachine};
