//! Out-of-process build orchestration.
//!
//! A [`BuildManager`] runs every build in a separate process that connects back
//! over loopback TCP, announces its session and receives its
//! [`BuildParameters`](kiln_proto::BuildParameters). Builds of one target are
//! serialized; builds of different targets overlap.
//!
//! * [`changes`]: per-target file change deltas with monotonic ordinals.
//! * [`dispatcher`]: session registry routing frames to handlers.
//! * [`listener`]: the loopback transport.
//! * [`launcher`]: process spawning and exit supervision.
//! * [`future`]: cancellable handle to a scheduled build.
//! * [`automake`]: debounced make-on-save.

#![warn(missing_docs)]

pub mod automake;
pub mod changes;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod future;
pub mod handler;
pub mod launcher;
pub mod listener;
pub mod manager;
pub mod project;
pub mod settings;

pub use automake::AutoMakeScheduler;
pub use changes::ChangeTracker;
pub use config::{ConfigError, KilnConfig};
pub use dispatcher::MessageDispatcher;
pub use error::{Error, Result};
pub use future::{FutureState, RequestFuture};
pub use handler::{BuildEvent, BuildEvents, MessageHandler};
pub use launcher::{BuildLauncher, LaunchRequest, ProcessLauncher, RunningBuild};
pub use manager::{BuildKind, BuildManager, BuildScope};
pub use project::{BuildTarget, ProjectModel, StaticProject};
