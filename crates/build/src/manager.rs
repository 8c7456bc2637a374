//! Build manager facade.
//!
//! Owns per-target change tracking and serial queues, the session registry,
//! the lazily bound transport listener, the settings cache and the auto-make
//! scheduler, and drives each scheduled build from launch to termination.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::FutureExt;
use kiln_proto::{BuildParameters, BuildType, ControllerMessage, Failure, KeyValuePair, SessionId};
use kiln_worker::{SerialQueue, TaskClass};
use parking_lot::Mutex;

use crate::automake::{AutoMakeScheduler, CycleFn, CycleTracker, auto_make_handler};
use crate::changes::ChangeTracker;
use crate::config::KilnConfig;
use crate::dispatcher::MessageDispatcher;
use crate::error::{Error, Result};
use crate::future::RequestFuture;
use crate::handler::MessageHandler;
use crate::launcher::{BuildLauncher, LaunchRequest};
use crate::listener::Listener;
use crate::project::{BuildTarget, ProjectModel};
use crate::settings::SettingsCache;

/// Upper bound on reading the last frames of an exited build process.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What kind of build to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildKind {
	/// Discard incremental state and build everything.
	Rebuild,
	/// Incremental build.
	Make,
	/// Compile the scope's paths regardless of their status.
	ForceCompile,
}

impl From<BuildKind> for BuildType {
	fn from(kind: BuildKind) -> Self {
		match kind {
			BuildKind::Rebuild => Self::Rebuild,
			BuildKind::Make => Self::Make,
			BuildKind::ForceCompile => Self::ForcedCompilation,
		}
	}
}

/// Part of a target to build. Empty means everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildScope {
	/// Module names.
	pub modules: Vec<String>,
	/// Artifact names.
	pub artifacts: Vec<String>,
	/// Source paths, used by [`BuildKind::ForceCompile`].
	pub paths: Vec<String>,
}

struct TargetState {
	changes: Mutex<ChangeTracker>,
	queue: SerialQueue,
}

/// Coordinates builds of every open target.
pub struct BuildManager {
	config: KilnConfig,
	project: Arc<dyn ProjectModel>,
	launcher: Arc<dyn BuildLauncher>,
	dispatcher: Arc<MessageDispatcher>,
	settings: SettingsCache,
	targets: Mutex<HashMap<BuildTarget, Arc<TargetState>>>,
	in_progress: Mutex<HashMap<BuildTarget, SessionId>>,
	events: SerialQueue,
	listener: tokio::sync::Mutex<Option<Listener>>,
	listen_addr: ArcSwapOption<SocketAddr>,
	automake: Arc<AutoMakeScheduler>,
}

impl BuildManager {
	/// Creates a manager. Nothing is bound or spawned until the first build.
	pub fn new(config: KilnConfig, project: Arc<dyn ProjectModel>, launcher: Arc<dyn BuildLauncher>) -> Arc<Self> {
		Arc::new_cyclic(|weak: &Weak<Self>| {
			let weak = weak.clone();
			let cycle: CycleFn = Arc::new(move |tracker| {
				let weak = weak.clone();
				async move {
					if let Some(manager) = weak.upgrade() {
						manager.run_auto_make(tracker).await;
					}
				}
				.boxed()
			});
			Self {
				automake: AutoMakeScheduler::new(config.automake.clone(), cycle),
				config,
				project,
				launcher,
				dispatcher: Arc::new(MessageDispatcher::new()),
				settings: SettingsCache::new(),
				targets: Mutex::new(HashMap::new()),
				in_progress: Mutex::new(HashMap::new()),
				events: SerialQueue::new(TaskClass::Events, "fs-events"),
				listener: tokio::sync::Mutex::new(None),
				listen_addr: ArcSwapOption::empty(),
			}
		})
	}

	/// Session registry.
	pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
		&self.dispatcher
	}

	/// Auto-make scheduler.
	pub fn automake(&self) -> &Arc<AutoMakeScheduler> {
		&self.automake
	}

	/// Port of the transport listener, once bound.
	pub fn listen_port(&self) -> Option<u16> {
		self.listen_addr.load().as_ref().map(|addr| addr.port())
	}

	/// Schedules a build of `target` and returns its future immediately.
	///
	/// Builds of one target run strictly in submission order; builds of
	/// different targets run concurrently. `handler` receives the session's
	/// events, ending with exactly one [`Terminated`](crate::BuildEvent::Terminated).
	///
	/// # Errors
	///
	/// [`Error::Configuration`] when the transport listener cannot be bound.
	/// The handler has then already received the failure and termination.
	pub async fn schedule_build(
		self: &Arc<Self>,
		target: BuildTarget,
		kind: BuildKind,
		scope: BuildScope,
		user_data: Vec<KeyValuePair>,
		handler: MessageHandler,
	) -> Result<RequestFuture> {
		self.schedule(target, kind, scope, user_data, handler, |_| {}).await
	}

	/// Schedules a build; `before_queue` sees the future before its job is
	/// queued.
	async fn schedule(
		self: &Arc<Self>,
		target: BuildTarget,
		kind: BuildKind,
		scope: BuildScope,
		user_data: Vec<KeyValuePair>,
		handler: MessageHandler,
		before_queue: impl FnOnce(&RequestFuture),
	) -> Result<RequestFuture> {
		let state = self.target_state(&target);
		let fs_event = {
			let mut changes = state.changes.lock();
			if kind == BuildKind::Rebuild {
				changes.invalidate();
			}
			changes.consume_delta()
		};

		let settings = self.settings.get_or_compute(|| self.project.global_settings());
		let (modules, artifacts, file_paths) = match kind {
			BuildKind::Rebuild => (Vec::new(), Vec::new(), Vec::new()),
			BuildKind::Make => (scope.modules, scope.artifacts, Vec::new()),
			BuildKind::ForceCompile => (scope.modules, scope.artifacts, scope.paths),
		};
		let params = BuildParameters {
			build_type: kind.into(),
			project_id: target.project_id(),
			modules,
			artifacts,
			file_paths,
			builder_parameters: user_data,
			global_settings: (*settings).clone(),
			fs_event,
		};

		let session_id = SessionId::new_v4();
		tracing::debug!(%session_id, %target, ?kind, "build scheduled");
		self.dispatcher.register_handler(session_id, handler.clone(), params);

		let dispatcher = self.dispatcher.clone();
		let future = RequestFuture::new(
			handler,
			session_id,
			Box::new(move |session_id| {
				dispatcher.cancel_session(session_id);
				Ok(())
			}),
		);

		if let Err(err) = self.ensure_listening().await {
			tracing::error!(%session_id, %target, error = %err, "cannot start build transport");
			self.terminate(session_id, Some(err.to_failure()));
			future.mark_failed(err.clone());
			return Err(err);
		}

		before_queue(&future);
		let this = self.clone();
		let queued = future.clone();
		let job_target = target.clone();
		if !state.queue.submit(async move { this.run_build(job_target, queued).await }) {
			let err = Error::Configuration(format!("build queue for {target} is closed"));
			self.terminate(session_id, Some(err.to_failure()));
			future.mark_failed(err.clone());
			return Err(err);
		}
		Ok(future)
	}

	async fn run_build(self: Arc<Self>, target: BuildTarget, future: RequestFuture) {
		let session_id = future.session_id();
		if self.project.is_disposed(&target) {
			tracing::debug!(%session_id, %target, "target disposed before build started");
			if let Err(e) = future.cancel(false) {
				tracing::warn!(%session_id, error = %e, "cancel failed");
			}
		}
		if future.is_cancelled() {
			self.terminate(session_id, None);
			future.mark_done();
			return;
		}

		let addr = match self.ensure_listening().await {
			Ok(addr) => addr,
			Err(err) => {
				self.terminate(session_id, Some(err.to_failure()));
				future.mark_failed(err);
				return;
			}
		};

		self.in_progress.lock().insert(target.clone(), session_id);
		let request = LaunchRequest {
			session_id,
			host: addr.ip().to_string(),
			port: addr.port(),
		};
		let outcome = match self.launcher.launch(&request).await {
			Ok(process) => {
				let exit = process.wait().await;
				self.drain_connection(session_id).await;
				match (exit.into_result(), self.dispatcher.transport_error(session_id)) {
					(Ok(()), Some(err)) => Err(err),
					(result, _) => result,
				}
			}
			Err(err) => Err(err),
		};
		{
			let mut in_progress = self.in_progress.lock();
			if in_progress.get(&target) == Some(&session_id) {
				in_progress.remove(&target);
			}
		}

		match outcome {
			Ok(()) => {
				tracing::debug!(%session_id, %target, "build process finished");
				self.terminate(session_id, None);
				future.mark_done();
			}
			Err(err) => {
				tracing::warn!(%session_id, %target, error = %err, "build failed");
				self.terminate(session_id, Some(err.to_failure()));
				future.mark_failed(err);
			}
		}
	}

	/// Lets frames written before the process exited reach the handler.
	async fn drain_connection(&self, session_id: SessionId) {
		let Some(mut bound) = self.dispatcher.watch_bound(session_id) else {
			return;
		};
		if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, bound.wait_for(|bound| !*bound))
			.await
			.is_err()
		{
			tracing::debug!(%session_id, "build process connection outlived the process");
		}
	}

	/// Delivers `failure` (at most once) and then `Terminated` (exactly once).
	fn terminate(&self, session_id: SessionId, failure: Option<Failure>) {
		if let Some(failure) = failure {
			self.dispatcher.fail_session(session_id, failure);
		}
		if let Some(handler) = self.dispatcher.unregister_handler(session_id) {
			handler.session_terminated();
		}
	}

	async fn ensure_listening(&self) -> Result<SocketAddr> {
		let mut slot = self.listener.lock().await;
		if let Some(listener) = slot.as_ref() {
			return Ok(listener.local_addr());
		}
		let listener = Listener::bind(
			self.config.transport.bind_address,
			self.dispatcher.clone(),
			self.config.transport.max_frame_len,
		)
		.await?;
		let addr = listener.local_addr();
		self.listen_addr.store(Some(Arc::new(addr)));
		*slot = Some(listener);
		Ok(addr)
	}

	/// Closes the listener and every open connection. The next build binds a
	/// new port.
	pub async fn stop_listening(&self) {
		if let Some(listener) = self.listener.lock().await.take() {
			listener.stop();
			self.listen_addr.store(None);
			tracing::info!(port = listener.port(), "build transport stopped");
		}
	}

	fn target_state(&self, target: &BuildTarget) -> Arc<TargetState> {
		self.targets
			.lock()
			.entry(target.clone())
			.or_insert_with(|| {
				Arc::new(TargetState {
					changes: Mutex::new(ChangeTracker::new()),
					queue: SerialQueue::new(TaskClass::Build, format!("build:{target}")),
				})
			})
			.clone()
	}

	/// Records created or modified paths for every known target.
	pub fn notify_files_changed(self: &Arc<Self>, paths: Vec<String>) {
		self.notify(paths, false);
	}

	/// Records removed paths for every known target.
	pub fn notify_files_deleted(self: &Arc<Self>, paths: Vec<String>) {
		self.notify(paths, true);
	}

	fn notify(self: &Arc<Self>, paths: Vec<String>, deleted: bool) {
		let this = self.clone();
		self.events.submit(async move {
			let targets: Vec<_> = this.targets.lock().iter().map(|(t, s)| (t.clone(), s.clone())).collect();
			for (target, state) in targets {
				let streamed = {
					let mut changes = state.changes.lock();
					if deleted {
						changes.record_deleted(&paths);
					} else {
						changes.record_changed(&paths);
					}
					let live = this.in_progress.lock().get(&target).copied();
					match live {
						Some(session_id) if !changes.needs_full_rescan() && this.dispatcher.is_bound(session_id) => {
							changes.consume_delta().map(|delta| (session_id, delta))
						}
						_ => None,
					}
				};
				if let Some((session_id, delta)) = streamed {
					tracing::debug!(%session_id, %target, ordinal = delta.ordinal, "streaming file changes to running build");
					this.dispatcher.send_to_session(session_id, ControllerMessage::FsEvent(delta));
				}
			}
			this.automake.notify();
		});
	}

	/// Waits until every notification submitted so far has been applied.
	pub async fn flush_notifications(&self) {
		self.events.flush().await;
	}

	/// Forces a full rescan on the next build of `target` and drops the
	/// cached global settings.
	pub fn clear_state(&self, target: &BuildTarget) {
		if let Some(state) = self.targets.lock().get(target) {
			state.changes.lock().invalidate();
		}
		self.settings.invalidate();
		tracing::debug!(%target, "build state cleared");
	}

	/// Drops the cached global settings.
	pub fn invalidate_global_settings(&self) {
		self.settings.invalidate();
	}

	/// Cancels the automatic builds of `target` and returns their futures.
	pub fn cancel_auto_builds(&self, target: &BuildTarget) -> Vec<RequestFuture> {
		self.automake.cancel_auto_builds(target)
	}

	/// Cancels automatic builds of `target`, waits a bounded time for each,
	/// waits (with the same bound) for queued builds to finish, and forgets
	/// the target's state.
	///
	/// A build still queued when the bound expires keeps running on the old
	/// queue and may overlap a build scheduled for the same path afterwards.
	pub async fn close_target(&self, target: &BuildTarget) {
		let wait = self.config.automake.cancel_wait();
		for future in self.cancel_auto_builds(target) {
			if !future.wait_for(Some(wait)).await {
				tracing::warn!(%target, session_id = %future.session_id(), "auto-make build still running after cancel");
			}
		}
		let state = self.targets.lock().get(target).cloned();
		if let Some(state) = state
			&& tokio::time::timeout(wait, state.queue.flush()).await.is_err()
		{
			tracing::warn!(%target, pending = state.queue.pending(), "queued builds still running at close");
		}
		self.targets.lock().remove(target);
		tracing::debug!(%target, "target closed");
	}

	/// Whether a build of `target` is running.
	pub fn is_building(&self, target: &BuildTarget) -> bool {
		self.in_progress.lock().contains_key(target)
	}

	/// One auto-make cycle: a `Make` for every opted-in, open target. Each
	/// build is tracked before it is queued.
	async fn run_auto_make(self: Arc<Self>, tracker: CycleTracker) {
		for target in self.project.auto_make_targets() {
			if self.project.is_disposed(&target) {
				continue;
			}
			let handler = auto_make_handler(target.clone());
			let track = |future: &RequestFuture| tracker.track(&target, future);
			if let Err(e) = self
				.schedule(target.clone(), BuildKind::Make, BuildScope::default(), Vec::new(), handler, track)
				.await
			{
				tracing::warn!(%target, error = %e, "auto-make build not scheduled");
			}
		}
	}
}
