/// Execution classes used to label spawned work in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Build process launch and supervision.
	Build,
	/// Ordered filesystem notification processing.
	Events,
	/// Auto-make timer callbacks and cycles.
	Scheduler,
	/// Socket accept and per-connection I/O.
	Transport,
	/// Blocking filesystem work executed on the blocking pool.
	IoBlocking,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Build => "build",
			Self::Events => "events",
			Self::Scheduler => "scheduler",
			Self::Transport => "transport",
			Self::IoBlocking => "io_blocking",
		}
	}
}
