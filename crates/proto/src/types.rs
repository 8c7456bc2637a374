//! Wire types for the kiln build server protocol.
//!
//! Every frame carries a [`Message`] envelope naming the session it belongs to.
//! The controller (the build manager) sends [`ControllerMessage`]s; the build
//! process answers with [`BuilderMessage`]s or a terminal [`Failure`].

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier correlating one build request with one build
/// process connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
	/// Generates a fresh random session identifier.
	#[must_use]
	pub fn new_v4() -> Self {
		Self(Uuid::new_v4())
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// A single framed protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
	/// Session this message belongs to.
	pub session_id: SessionId,
	/// Message payload.
	pub body: MessageBody,
}

impl Message {
	/// Wraps a controller message for `session_id`.
	#[must_use]
	pub fn controller(session_id: SessionId, msg: ControllerMessage) -> Self {
		Self {
			session_id,
			body: MessageBody::Controller(msg),
		}
	}

	/// Wraps a builder message for `session_id`.
	#[must_use]
	pub fn builder(session_id: SessionId, msg: BuilderMessage) -> Self {
		Self {
			session_id,
			body: MessageBody::Builder(msg),
		}
	}

	/// Wraps a failure for `session_id`.
	#[must_use]
	pub fn failure(session_id: SessionId, failure: Failure) -> Self {
		Self {
			session_id,
			body: MessageBody::Failure(failure),
		}
	}
}

/// The two message families plus out-of-band failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
	/// Build manager to build process.
	Controller(ControllerMessage),
	/// Build process to build manager.
	Builder(BuilderMessage),
	/// Terminal failure raised by either side.
	Failure(Failure),
}

/// Messages sent from the build manager to a build process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerMessage {
	/// The initial build request for the session.
	BuildParameters(BuildParameters),
	/// File changes observed while the build is running.
	FsEvent(FsEvent),
	/// Cooperative cancellation request.
	CancelBuild,
}

/// Kind of build the process should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildType {
	/// Discard all incremental state and build everything.
	Rebuild,
	/// Incremental build of the requested scope.
	Make,
	/// Compile the given paths regardless of their up-to-date status.
	ForcedCompilation,
}

/// Parameters of a build request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildParameters {
	/// Requested build type.
	pub build_type: BuildType,
	/// Canonical path of the project being built.
	pub project_id: String,
	/// Modules to build; empty means all.
	pub modules: Vec<String>,
	/// Artifacts to build.
	pub artifacts: Vec<String>,
	/// Explicit file paths for forced compilation.
	pub file_paths: Vec<String>,
	/// Opaque caller data forwarded to builders.
	pub builder_parameters: Vec<KeyValuePair>,
	/// Global environment the build runs against.
	pub global_settings: GlobalSettings,
	/// File changes since the previous build, or `None` when a full rescan is
	/// required.
	pub fs_event: Option<FsEvent>,
}

/// Delta of file changes since the last consumed build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEvent {
	/// Monotonic ordinal within the current tracking epoch, starting at 1.
	pub ordinal: u64,
	/// Paths created or modified.
	pub changed_paths: Vec<String>,
	/// Paths removed.
	pub deleted_paths: Vec<String>,
}

/// Generic string pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuePair {
	/// Pair key.
	pub key: String,
	/// Pair value.
	pub value: String,
}

impl KeyValuePair {
	/// Creates a pair.
	#[must_use]
	pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			key: key.into(),
			value: value.into(),
		}
	}
}

/// Host-wide settings shared by every build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
	/// Path variables with system-independent values.
	pub path_variables: Vec<KeyValuePair>,
	/// SDKs and global libraries.
	pub global_libraries: Vec<GlobalLibrary>,
	/// Default source encoding.
	pub global_encoding: Option<String>,
	/// Semicolon separated list of ignored file patterns.
	pub ignored_files_patterns: String,
}

/// A global library, optionally describing an SDK.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalLibrary {
	/// Library name.
	pub name: String,
	/// Class roots, system-independent.
	pub paths: Vec<String>,
	/// Present for SDK libraries.
	pub sdk: Option<SdkInfo>,
}

/// SDK-specific library data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkInfo {
	/// SDK installation directory.
	pub home_path: String,
	/// SDK type name.
	pub type_name: String,
	/// Human readable version.
	pub version: Option<String>,
	/// Serialized SDK-type specific data.
	pub additional_data: Option<String>,
}

/// Messages sent from a build process to the build manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BuilderMessage {
	/// First frame of a new process; asks for the session's build parameters.
	ParamRequest,
	/// Compiler diagnostic or progress report.
	CompileMessage(CompileMessage),
	/// Lifecycle event.
	BuildEvent(BuildEvent),
	/// Build failed inside the process.
	Failure(Failure),
}

impl BuilderMessage {
	/// Creates a progress message.
	#[must_use]
	pub fn progress(text: impl Into<String>, done: Option<f32>) -> Self {
		Self::CompileMessage(CompileMessage {
			kind: CompileMessageKind::Progress,
			text: text.into(),
			source_path: None,
			line: None,
			column: None,
			done,
		})
	}

	/// Creates a build completed event.
	#[must_use]
	pub fn build_completed(status: CompletionStatus) -> Self {
		Self::BuildEvent(BuildEvent {
			kind: BuildEventKind::BuildCompleted,
			description: None,
			status: Some(status),
			generated_files: Vec::new(),
			custom: None,
		})
	}
}

/// Severity of a [`CompileMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompileMessageKind {
	/// Compilation error.
	Error,
	/// Compiler warning.
	Warning,
	/// Informational note.
	Info,
	/// Progress text.
	Progress,
}

/// A compiler diagnostic or progress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileMessage {
	/// Severity.
	pub kind: CompileMessageKind,
	/// Message text.
	pub text: String,
	/// File the message refers to.
	pub source_path: Option<String>,
	/// One-based line.
	pub line: Option<u64>,
	/// One-based column.
	pub column: Option<u64>,
	/// Fraction of work done in `0.0..=1.0`.
	pub done: Option<f32>,
}

/// Kind of [`BuildEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildEventKind {
	/// The build finished; see [`BuildEvent::status`].
	BuildCompleted,
	/// Output files were written.
	FilesGenerated,
	/// Builder-specific message.
	Custom,
}

/// Completion status reported with [`BuildEventKind::BuildCompleted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
	/// Build succeeded.
	Success,
	/// Build finished with compilation errors.
	Errors,
	/// Build observed a cancel request.
	Canceled,
	/// Nothing needed to be built.
	UpToDate,
}

/// A build lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
	/// Event kind.
	pub kind: BuildEventKind,
	/// Optional human readable description.
	pub description: Option<String>,
	/// Completion status for [`BuildEventKind::BuildCompleted`].
	pub status: Option<CompletionStatus>,
	/// Files for [`BuildEventKind::FilesGenerated`].
	pub generated_files: Vec<GeneratedFile>,
	/// Payload for [`BuildEventKind::Custom`].
	pub custom: Option<CustomBuilderMessage>,
}

/// An output produced by the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
	/// Output root directory.
	pub output_root: String,
	/// Path relative to the output root.
	pub relative_path: String,
}

/// Builder-specific payload carried by [`BuildEventKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomBuilderMessage {
	/// Builder that produced the message.
	pub builder_id: String,
	/// Builder-defined message type.
	pub message_type: String,
	/// Message body.
	pub message_text: String,
}

/// A terminal failure description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
	/// What went wrong.
	pub description: String,
	/// Optional stack trace or diagnostic dump.
	pub stacktrace: Option<String>,
}

impl Failure {
	/// Creates a failure without a stack trace.
	#[must_use]
	pub fn new(description: impl Into<String>) -> Self {
		Self {
			description: description.into(),
			stacktrace: None,
		}
	}
}

impl fmt::Display for Failure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.description)
	}
}
