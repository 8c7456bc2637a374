//! Build process launcher abstraction for production and testing.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use kiln_proto::SessionId;
use kiln_worker::{TaskClass, spawn, spawn_blocking};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::{KilnConfig, ProcessConfig, ToolchainConfig};
use crate::error::{Error, Result};

/// Name of the logging configuration expected in the working directory.
pub const LOG_CONFIG_FILE: &str = "log.xml";

const DEFAULT_LOG_CONFIG: &str = include_str!("../resources/default_log.xml");

/// How long output readers may lag behind process exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a launched build process must connect back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
	/// Session the process announces in its first frame.
	pub session_id: SessionId,
	/// Listener host.
	pub host: String,
	/// Listener port.
	pub port: u16,
}

/// How a build process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
	/// The process exited. `code` is `None` when killed by a signal.
	Exited {
		/// Exit code.
		code: Option<i32>,
		/// Captured stderr, bounded by the capture limit.
		stderr: String,
	},
	/// Waiting on the process failed.
	WaitFailed(String),
}

impl ProcessExit {
	/// Maps the exit onto a build outcome.
	pub fn into_result(self) -> Result<()> {
		match self {
			Self::Exited { code: Some(0), .. } => Ok(()),
			Self::Exited { code, stderr } => Err(Error::AbnormalTermination { code, stderr }),
			Self::WaitFailed(reason) => Err(Error::Transport(reason)),
		}
	}
}

/// A started build process.
#[async_trait]
pub trait RunningBuild: Send {
	/// Waits for the process to exit.
	async fn wait(self: Box<Self>) -> ProcessExit;
}

/// Trait for launching build processes.
///
/// This abstraction allows the manager to use real subprocesses in production
/// and in-process fake build servers for testing.
#[async_trait]
pub trait BuildLauncher: Send + Sync + 'static {
	/// Starts a build process that connects back to `request.host:request.port`.
	///
	/// # Errors
	///
	/// [`Error::Configuration`] when no toolchain can be resolved,
	/// [`Error::Spawn`] when the operating system refuses to start it.
	async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn RunningBuild>>;
}

/// Production launcher that spawns real build processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
	process: ProcessConfig,
	toolchain: ToolchainConfig,
	work_dir: PathBuf,
}

impl ProcessLauncher {
	/// Creates a launcher from configuration.
	#[must_use]
	pub fn new(config: &KilnConfig) -> Self {
		Self {
			process: config.process.clone(),
			toolchain: config.toolchain.clone(),
			work_dir: config.compile_server_dir(),
		}
	}

	/// Working directory of launched processes.
	pub fn work_dir(&self) -> &Path {
		&self.work_dir
	}

	/// Finds the interpreter: configured path, then `JAVA_HOME`, then `PATH`.
	pub fn resolve_interpreter(&self) -> Result<PathBuf> {
		if let Some(path) = &self.toolchain.interpreter {
			if path.is_file() {
				return Ok(path.clone());
			}
			return Err(Error::Configuration(format!(
				"configured interpreter {} does not exist",
				path.display()
			)));
		}
		if let Some(home) = std::env::var_os("JAVA_HOME") {
			let candidate = PathBuf::from(home)
				.join("bin")
				.join(format!("java{}", std::env::consts::EXE_SUFFIX));
			if candidate.is_file() {
				return Ok(candidate);
			}
		}
		which::which("java").map_err(|e| {
			Error::Configuration(format!(
				"no build toolchain found; set toolchain.interpreter or JAVA_HOME ({e})"
			))
		})
	}

	/// Arguments passed to the interpreter.
	pub fn command_args(&self, request: &LaunchRequest) -> Result<Vec<String>> {
		if self.toolchain.classpath.is_empty() {
			return Err(Error::Configuration("build process classpath is empty".into()));
		}
		let classpath = std::env::join_paths(&self.toolchain.classpath)
			.map_err(|e| Error::Configuration(format!("invalid classpath entry: {e}")))?;

		let mut args = vec![
			"-server".to_string(),
			"-XX:ReservedCodeCacheSize=64m".to_string(),
			format!("-Xmx{}m", self.process.heap_size_mb),
			"-Djava.awt.headless=true".to_string(),
		];
		args.extend(self.process.vm_options.split_whitespace().map(str::to_string));
		if let Some(port) = self.process.debug_port {
			args.push("-XX:+HeapDumpOnOutOfMemoryError".to_string());
			args.push(format!(
				"-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address={port}"
			));
		}
		if self.process.use_memory_temp_cache {
			args.push("-Dkiln.use.memory.temp.cache".to_string());
		}
		if self.process.use_external_compiler {
			args.push("-Dkiln.use.external.compiler".to_string());
		}
		args.push(format!("-Dkiln.hostname={}", request.host));

		let locale = self.process.locale.clone().or_else(|| std::env::var("LANG").ok());
		if let Some(locale) = locale {
			args.extend(locale_properties(&locale));
		}

		args.push("-classpath".to_string());
		args.push(classpath.to_string_lossy().into_owned());
		args.push(self.toolchain.main_class.clone());
		args.push(request.host.clone());
		args.push(request.port.to_string());
		args.push(request.session_id.to_string());
		args.push(self.work_dir.to_string_lossy().replace('\\', "/"));
		Ok(args)
	}
}

#[async_trait]
impl BuildLauncher for ProcessLauncher {
	async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn RunningBuild>> {
		let interpreter = self.resolve_interpreter()?;
		let args = self.command_args(request)?;

		let work_dir = self.work_dir.clone();
		if let Err(e) = spawn_blocking(TaskClass::IoBlocking, move || ensure_work_dir(&work_dir)).await {
			tracing::warn!(error = %e, "work directory preparation did not finish");
		}

		tracing::info!(
			session_id = %request.session_id,
			interpreter = %interpreter.display(),
			"starting build process"
		);
		tracing::debug!(session_id = %request.session_id, ?args, "build process command line");

		let mut command = Command::new(&interpreter);
		command.args(&args).current_dir(&self.work_dir);
		let child = ChildProcess::spawn(command, request.session_id, self.process.stderr_capture_limit)?;
		Ok(Box::new(child))
	}
}

/// Creates the working directory and its logging configuration.
///
/// Failures are logged; a missing template only loses build process logs.
fn ensure_work_dir(dir: &Path) {
	if let Err(e) = std::fs::create_dir_all(dir) {
		tracing::error!(dir = %dir.display(), error = %e, "cannot create build process work directory");
		return;
	}
	let log_config = dir.join(LOG_CONFIG_FILE);
	if log_config.exists() {
		return;
	}
	if let Err(e) = std::fs::write(&log_config, DEFAULT_LOG_CONFIG) {
		tracing::error!(path = %log_config.display(), error = %e, "cannot write build process log config");
	}
}

/// `-Duser.*` properties for a POSIX locale name such as `de_CH.UTF-8`.
fn locale_properties(locale: &str) -> Vec<String> {
	let name = locale.split(['.', '@']).next().unwrap_or_default();
	if name.is_empty() || name == "C" || name == "POSIX" {
		return Vec::new();
	}
	let mut parts = name.split('_');
	let mut props = Vec::new();
	if let Some(language) = parts.next().filter(|s| !s.is_empty()) {
		props.push(format!("-Duser.language={language}"));
	}
	if let Some(country) = parts.next().filter(|s| !s.is_empty()) {
		props.push(format!("-Duser.country={country}"));
	}
	if let Some(region) = parts.next().filter(|s| !s.is_empty()) {
		props.push(format!("-Duser.region={region}"));
	}
	props
}

/// A supervised child process with its output echoed to the log.
pub struct ChildProcess {
	child: Child,
	session_id: SessionId,
	stdout: Option<JoinHandle<String>>,
	stderr: Option<JoinHandle<String>>,
}

impl ChildProcess {
	/// Spawns `command` with piped output.
	///
	/// Every output line is logged under the `builder_process` target and up to
	/// `stderr_limit` bytes of stderr are kept for the exit report.
	pub fn spawn(mut command: Command, session_id: SessionId, stderr_limit: usize) -> Result<Self> {
		let program = command.as_std().get_program().to_string_lossy().into_owned();
		let mut child = command
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.spawn()
			.map_err(|e| {
				tracing::error!(%session_id, command = %program, error = %e, "failed to spawn build process");
				Error::Spawn {
					command: program.clone(),
					reason: e.to_string(),
				}
			})?;

		let stdout = child
			.stdout
			.take()
			.map(|out| spawn(TaskClass::Build, echo_lines(out, session_id, "stdout", 0)));
		let stderr = child
			.stderr
			.take()
			.map(|err| spawn(TaskClass::Build, echo_lines(err, session_id, "stderr", stderr_limit)));

		Ok(Self {
			child,
			session_id,
			stdout,
			stderr,
		})
	}
}

#[async_trait]
impl RunningBuild for ChildProcess {
	async fn wait(mut self: Box<Self>) -> ProcessExit {
		let status = self.child.wait().await;
		let stderr = drain(self.stderr.take()).await;
		drain(self.stdout.take()).await;
		match status {
			Ok(status) => {
				tracing::info!(session_id = %self.session_id, %status, "build process exited");
				ProcessExit::Exited {
					code: status.code(),
					stderr,
				}
			}
			Err(e) => {
				tracing::error!(session_id = %self.session_id, error = %e, "failed to wait on build process");
				ProcessExit::WaitFailed(e.to_string())
			}
		}
	}
}

async fn drain(task: Option<JoinHandle<String>>) -> String {
	let Some(task) = task else {
		return String::new();
	};
	match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
		Ok(Ok(captured)) => captured,
		_ => String::new(),
	}
}

async fn echo_lines<R>(reader: R, session_id: SessionId, stream: &'static str, limit: usize) -> String
where
	R: AsyncRead + Unpin,
{
	let mut lines = BufReader::new(reader).lines();
	let mut captured = String::new();
	loop {
		match lines.next_line().await {
			Ok(Some(line)) => {
				tracing::info!(target: "builder_process", %session_id, stream, "{line}");
				capture(&mut captured, &line, limit);
			}
			Ok(None) => break,
			Err(e) => {
				tracing::debug!(%session_id, stream, error = %e, "build process output closed");
				break;
			}
		}
	}
	captured
}

fn capture(buf: &mut String, line: &str, limit: usize) {
	let remaining = limit.saturating_sub(buf.len());
	if remaining == 0 {
		return;
	}
	let mut end = line.len().min(remaining);
	while !line.is_char_boundary(end) {
		end -= 1;
	}
	buf.push_str(&line[..end]);
	if buf.len() < limit {
		buf.push('\n');
	}
}

/// Test helpers for faking build processes.
#[doc(hidden)]
pub mod test_helpers {
	use std::collections::HashMap;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use futures::{SinkExt, StreamExt};
	use kiln_proto::{
		BuildParameters, BuilderMessage, CompletionStatus, ControllerMessage, FsEvent, Message, MessageBody,
		MessageCodec,
	};
	use parking_lot::Mutex;
	use tokio::io::AsyncWriteExt;
	use tokio::net::TcpStream;
	use tokio_util::codec::{FramedRead, FramedWrite};

	use super::*;

	/// Scripted behaviour of a fake build process.
	#[derive(Debug, Clone)]
	pub struct FakeBehavior {
		/// Messages sent after the build "ran".
		pub messages: Vec<BuilderMessage>,
		/// How long the build runs before reporting. Ignored with
		/// `wait_for_cancel`.
		pub hold: Duration,
		/// Run until a `CancelBuild` arrives.
		pub wait_for_cancel: bool,
		/// Keep running after `CancelBuild`, until the connection closes.
		pub ignore_cancel: bool,
		/// Write a malformed frame after the messages.
		pub corrupt_stream: bool,
		/// Exit code reported after the connection closes.
		pub exit_code: i32,
		/// Stderr text reported on exit.
		pub stderr: String,
		/// Fail the launch itself with this error.
		pub launch_error: Option<Error>,
	}

	impl Default for FakeBehavior {
		fn default() -> Self {
			Self {
				messages: vec![BuilderMessage::build_completed(CompletionStatus::Success)],
				hold: Duration::ZERO,
				wait_for_cancel: false,
				ignore_cancel: false,
				corrupt_stream: false,
				exit_code: 0,
				stderr: String::new(),
				launch_error: None,
			}
		}
	}

	/// What one fake build process received.
	#[derive(Debug, Clone)]
	pub struct Received {
		/// Session the process ran for.
		pub session_id: SessionId,
		/// The initial request.
		pub params: BuildParameters,
		/// Deltas streamed while running.
		pub fs_events: Vec<FsEvent>,
		/// Whether a `CancelBuild` arrived.
		pub cancelled: bool,
	}

	#[derive(Default)]
	struct FakeState {
		active: Mutex<HashMap<String, usize>>,
		max_active: Mutex<HashMap<String, usize>>,
		total: AtomicUsize,
		max_total: AtomicUsize,
		launches: AtomicUsize,
		received: Mutex<Vec<Received>>,
	}

	impl FakeState {
		fn enter(&self, project: &str) {
			let now = self.total.fetch_add(1, Ordering::SeqCst) + 1;
			self.max_total.fetch_max(now, Ordering::SeqCst);
			let mut active = self.active.lock();
			let count = active.entry(project.to_string()).or_default();
			*count += 1;
			let mut max = self.max_active.lock();
			let peak = max.entry(project.to_string()).or_default();
			*peak = (*peak).max(*count);
		}

		fn leave(&self, project: &str) {
			self.total.fetch_sub(1, Ordering::SeqCst);
			if let Some(count) = self.active.lock().get_mut(project) {
				*count -= 1;
			}
		}
	}

	/// Launcher whose "processes" are in-process tasks speaking the real
	/// protocol over the real loopback listener.
	#[derive(Default)]
	pub struct FakeLauncher {
		behavior: Mutex<FakeBehavior>,
		state: Arc<FakeState>,
	}

	impl FakeLauncher {
		/// Creates a launcher whose builds succeed immediately.
		#[must_use]
		pub fn new() -> Arc<Self> {
			Arc::new(Self::default())
		}

		/// Creates a launcher with `behavior`.
		#[must_use]
		pub fn with_behavior(behavior: FakeBehavior) -> Arc<Self> {
			let launcher = Self::default();
			*launcher.behavior.lock() = behavior;
			Arc::new(launcher)
		}

		/// Replaces the behaviour of subsequent launches.
		pub fn set_behavior(&self, behavior: FakeBehavior) {
			*self.behavior.lock() = behavior;
		}

		/// Every finished fake process, in completion order.
		pub fn received(&self) -> Vec<Received> {
			self.state.received.lock().clone()
		}

		/// Number of launch attempts.
		pub fn launches(&self) -> usize {
			self.state.launches.load(Ordering::SeqCst)
		}

		/// Peak number of simultaneously running builds for `project`.
		pub fn max_concurrent(&self, project: &str) -> usize {
			self.state.max_active.lock().get(project).copied().unwrap_or(0)
		}

		/// Peak number of simultaneously running builds overall.
		pub fn max_concurrent_total(&self) -> usize {
			self.state.max_total.load(Ordering::SeqCst)
		}
	}

	#[async_trait]
	impl BuildLauncher for FakeLauncher {
		async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn RunningBuild>> {
			self.state.launches.fetch_add(1, Ordering::SeqCst);
			let behavior = self.behavior.lock().clone();
			if let Some(err) = behavior.launch_error.clone() {
				return Err(err);
			}
			let task = spawn(
				TaskClass::Build,
				run_fake(request.clone(), behavior, self.state.clone()),
			);
			Ok(Box::new(FakeProcess { task }))
		}
	}

	struct FakeProcess {
		task: JoinHandle<ProcessExit>,
	}

	#[async_trait]
	impl RunningBuild for FakeProcess {
		async fn wait(self: Box<Self>) -> ProcessExit {
			self.task.await.unwrap_or_else(|e| ProcessExit::WaitFailed(e.to_string()))
		}
	}

	fn exited(code: i32, stderr: impl Into<String>) -> ProcessExit {
		ProcessExit::Exited {
			code: Some(code),
			stderr: stderr.into(),
		}
	}

	async fn run_fake(request: LaunchRequest, behavior: FakeBehavior, state: Arc<FakeState>) -> ProcessExit {
		let stream = match TcpStream::connect((request.host.as_str(), request.port)).await {
			Ok(stream) => stream,
			Err(e) => return exited(2, format!("connect failed: {e}")),
		};
		let (reader, writer) = stream.into_split();
		let mut read = FramedRead::new(reader, MessageCodec::new());
		let mut write = FramedWrite::new(writer, MessageCodec::new());
		let session_id = request.session_id;

		if write.send(Message::builder(session_id, BuilderMessage::ParamRequest)).await.is_err() {
			return exited(2, "cannot send parameter request");
		}
		let params = match read.next().await {
			Some(Ok(Message {
				body: MessageBody::Controller(ControllerMessage::BuildParameters(params)),
				..
			})) => params,
			_ => return exited(3, "no build parameters received"),
		};

		let project = params.project_id.clone();
		state.enter(&project);
		let mut received = Received {
			session_id,
			params,
			fs_events: Vec::new(),
			cancelled: false,
		};

		let deadline = tokio::time::Instant::now() + behavior.hold;
		loop {
			tokio::select! {
				frame = read.next() => match frame {
					Some(Ok(Message { body: MessageBody::Controller(ControllerMessage::FsEvent(event)), .. })) => {
						received.fs_events.push(event);
					}
					Some(Ok(Message { body: MessageBody::Controller(ControllerMessage::CancelBuild), .. })) => {
						received.cancelled = true;
						if !behavior.ignore_cancel {
							break;
						}
					}
					Some(Ok(_)) => {}
					_ => break,
				},
				_ = tokio::time::sleep_until(deadline), if !behavior.wait_for_cancel => break,
			}
		}

		let mut messages = behavior.messages.clone();
		if received.cancelled && !behavior.ignore_cancel {
			messages = vec![BuilderMessage::build_completed(CompletionStatus::Canceled)];
		}
		for msg in messages {
			if write.send(Message::builder(session_id, msg)).await.is_err() {
				break;
			}
		}
		if behavior.corrupt_stream {
			let _ = write.get_mut().write_all(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).await;
		}
		drop(write);
		drop(read);

		state.leave(&project);
		state.received.lock().push(received);
		exited(behavior.exit_code, behavior.stderr)
	}

	/// Launcher running `sh -c <script>` through the real child supervision.
	#[cfg(unix)]
	#[derive(Debug, Clone)]
	pub struct ShellLauncher {
		/// Script passed to `sh -c`.
		pub script: String,
		/// Bytes of stderr captured.
		pub stderr_capture_limit: usize,
	}

	#[cfg(unix)]
	#[async_trait]
	impl BuildLauncher for ShellLauncher {
		async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn RunningBuild>> {
			let mut command = Command::new("sh");
			command.arg("-c").arg(&self.script);
			Ok(Box::new(ChildProcess::spawn(
				command,
				request.session_id,
				self.stderr_capture_limit,
			)?))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request() -> LaunchRequest {
		LaunchRequest {
			session_id: SessionId::new_v4(),
			host: "127.0.0.1".into(),
			port: 4242,
		}
	}

	fn launcher_with(config: impl FnOnce(&mut KilnConfig)) -> ProcessLauncher {
		let mut cfg = KilnConfig {
			system_dir: Some(PathBuf::from("/tmp/kiln-system")),
			..KilnConfig::default()
		};
		cfg.toolchain.classpath = vec![PathBuf::from("/opt/a.jar"), PathBuf::from("/opt/b.jar")];
		cfg.process.locale = Some("de_CH.UTF-8".into());
		config(&mut cfg);
		ProcessLauncher::new(&cfg)
	}

	#[test]
	fn command_line_layout() {
		let launcher = launcher_with(|cfg| {
			cfg.process.vm_options = " -Xss2m  -ea ".into();
			cfg.process.debug_port = Some(5005);
		});
		let req = request();
		let args = launcher.command_args(&req).unwrap();

		assert_eq!(&args[..4], ["-server", "-XX:ReservedCodeCacheSize=64m", "-Xmx512m", "-Djava.awt.headless=true"]);
		assert_eq!(&args[4..6], ["-Xss2m", "-ea"]);
		assert!(args.contains(&"-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address=5005".to_string()));
		assert!(args.contains(&"-Dkiln.use.memory.temp.cache".to_string()));
		assert!(!args.contains(&"-Dkiln.use.external.compiler".to_string()));
		assert!(args.contains(&"-Duser.language=de".to_string()));
		assert!(args.contains(&"-Duser.country=CH".to_string()));

		let tail = &args[args.len() - 7..];
		assert_eq!(tail[0], "-classpath");
		assert!(tail[1].contains("/opt/a.jar") && tail[1].contains("/opt/b.jar"));
		assert_eq!(tail[2], "org.jetbrains.jps.cmdline.BuildMain");
		assert_eq!(tail[3], "127.0.0.1");
		assert_eq!(tail[4], "4242");
		assert_eq!(tail[5], req.session_id.to_string());
		assert_eq!(tail[6], "/tmp/kiln-system/compile-server");
	}

	#[test]
	fn empty_classpath_is_configuration_error() {
		let launcher = launcher_with(|cfg| cfg.toolchain.classpath.clear());
		assert!(matches!(launcher.command_args(&request()), Err(Error::Configuration(_))));
	}

	#[test]
	fn missing_configured_interpreter_is_configuration_error() {
		let launcher = launcher_with(|cfg| cfg.toolchain.interpreter = Some(PathBuf::from("/nonexistent/java")));
		assert!(matches!(launcher.resolve_interpreter(), Err(Error::Configuration(_))));
	}

	#[test]
	fn locale_parsing() {
		assert_eq!(locale_properties("C.UTF-8"), Vec::<String>::new());
		assert_eq!(locale_properties("fr"), vec!["-Duser.language=fr".to_string()]);
		assert_eq!(
			locale_properties("sr_RS@latin"),
			vec!["-Duser.language=sr".to_string(), "-Duser.country=RS".to_string()]
		);
	}

	#[test]
	fn capture_respects_limit_and_char_boundaries() {
		let mut buf = String::new();
		capture(&mut buf, "abc", 8);
		capture(&mut buf, "défg", 8);
		assert_eq!(buf, "abc\ndéf");
		capture(&mut buf, "more", 8);
		assert_eq!(buf.len(), 8);
	}

	#[test]
	fn exit_mapping() {
		let ok = ProcessExit::Exited { code: Some(0), stderr: "noise".into() };
		assert_eq!(ok.into_result(), Ok(()));
		let crashed = ProcessExit::Exited { code: Some(1), stderr: String::new() };
		assert_eq!(crashed.into_result().unwrap_err().to_string(), "Abnormal build process termination (exit code 1)");
		assert!(matches!(ProcessExit::WaitFailed("x".into()).into_result(), Err(Error::Transport(_))));
	}

	#[test]
	fn work_dir_gets_default_log_config_once() {
		let dir = tempfile::tempdir().unwrap();
		let work = dir.path().join("compile-server");
		ensure_work_dir(&work);
		let path = work.join(LOG_CONFIG_FILE);
		assert_eq!(std::fs::read_to_string(&path).unwrap(), DEFAULT_LOG_CONFIG);

		std::fs::write(&path, "custom").unwrap();
		ensure_work_dir(&work);
		assert_eq!(std::fs::read_to_string(&path).unwrap(), "custom");
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn child_stderr_is_captured_on_failure() {
		let mut command = Command::new("sh");
		command.arg("-c").arg("echo out; printf 'bad thing' >&2; exit 3");
		let child = ChildProcess::spawn(command, SessionId::new_v4(), 1024).unwrap();
		let exit = Box::new(child).wait().await;
		assert_eq!(
			exit,
			ProcessExit::Exited {
				code: Some(3),
				stderr: "bad thing\n".into()
			}
		);
	}

	#[tokio::test]
	async fn spawn_failure_names_command() {
		let command = Command::new("/nonexistent/kiln-build-process");
		match ChildProcess::spawn(command, SessionId::new_v4(), 1024) {
			Err(Error::Spawn { command, .. }) => assert_eq!(command, "/nonexistent/kiln-build-process"),
			Err(other) => panic!("unexpected error {other}"),
			Ok(_) => panic!("spawn unexpectedly succeeded"),
		}
	}
}
