//! Task execution primitives shared by the kiln build manager.
//!
//! * [`spawn`] / [`spawn_blocking`]: classified spawning onto the ambient
//!   runtime, or onto a fixed-size global pool when none is current.
//! * [`SerialQueue`]: per-key ordered execution.
//! * [`DebounceTimer`]: restartable single-shot timer.

mod class;
mod serial;
mod spawn;
mod timer;

pub use class::TaskClass;
pub use serial::SerialQueue;
pub use spawn::{DEFAULT_POOL_SIZE, panic_message, set_pool_size, spawn, spawn_blocking};
pub use timer::DebounceTimer;
