//! Error taxonomy for build orchestration.

use kiln_proto::Failure;

/// A convenient type alias for `Result` with `E` = [`enum@Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Build orchestration errors.
///
/// Errors are `Clone` so a single outcome can be observed by every waiter of a
/// [`RequestFuture`](crate::future::RequestFuture).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// No usable toolchain, or the transport listener could not be bound.
	#[error("configuration error: {0}")]
	Configuration(String),
	/// The operating system refused to start the build process.
	#[error("failed to start build process `{command}`: {reason}")]
	Spawn {
		/// Executable that was started.
		command: String,
		/// OS error text.
		reason: String,
	},
	/// Malformed frame or socket failure.
	#[error("build process disconnected: {0}")]
	Transport(String),
	/// The build process exited with a non-zero status.
	#[error("{}", abnormal_message(.code, .stderr))]
	AbnormalTermination {
		/// Exit code, if the process was not killed by a signal.
		code: Option<i32>,
		/// Captured, bounded stderr text.
		stderr: String,
	},
	/// The build was cancelled by its caller.
	#[error("build cancelled")]
	CancelledByUser,
}

/// Message used when a process dies without writing anything to stderr.
pub const ABNORMAL_TERMINATION: &str = "Abnormal build process termination";

fn abnormal_message(code: &Option<i32>, stderr: &str) -> String {
	let stderr = stderr.trim();
	match (stderr.is_empty(), code) {
		(true, Some(code)) => format!("{ABNORMAL_TERMINATION} (exit code {code})"),
		(true, None) => ABNORMAL_TERMINATION.to_string(),
		(false, _) => stderr.to_string(),
	}
}

impl Error {
	/// Converts the error into the protocol failure delivered to handlers.
	#[must_use]
	pub fn to_failure(&self) -> Failure {
		Failure::new(self.to_string())
	}

	/// True for the cooperative cancellation outcome.
	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::CancelledByUser)
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Self::Transport(err.to_string())
	}
}

impl From<kiln_proto::CodecError> for Error {
	fn from(err: kiln_proto::CodecError) -> Self {
		Self::Transport(err.to_string())
	}
}
