//! Debounced background make-on-save.
//!
//! File notifications re-arm a single [`DebounceTimer`]. When it fires, one
//! cycle schedules a `Make` for every opted-in target and waits for all of
//! them. A timer firing while a cycle is still running re-arms itself with the
//! re-arm interval instead of starting a second cycle.
//!
//! Builds are tracked through a [`CycleTracker`] as they are scheduled, so a
//! target closed halfway through a cycle can still cancel its build.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use kiln_proto::{BuilderMessage, CompileMessageKind};
use kiln_worker::{DebounceTimer, TaskClass};
use parking_lot::Mutex;

use crate::config::AutoMakeConfig;
use crate::future::RequestFuture;
use crate::handler::{BuildEvent, MessageHandler};
use crate::project::BuildTarget;

/// Starts the builds of one cycle, reporting each to the tracker.
pub type CycleFn = Arc<dyn Fn(CycleTracker) -> BoxFuture<'static, ()> + Send + Sync>;

/// Records the builds of one running cycle.
#[derive(Clone)]
pub struct CycleTracker {
	scheduler: Weak<AutoMakeScheduler>,
	builds: Arc<Mutex<Vec<(BuildTarget, RequestFuture)>>>,
}

impl CycleTracker {
	/// Makes `future` cancellable through
	/// [`cancel_auto_builds`](AutoMakeScheduler::cancel_auto_builds) and part
	/// of the cycle.
	pub fn track(&self, target: &BuildTarget, future: &RequestFuture) {
		self.builds.lock().push((target.clone(), future.clone()));
		if let Some(scheduler) = self.scheduler.upgrade() {
			scheduler.track(target, future);
		}
	}
}

/// Shared debounce timer plus per-target tracking of automatic builds.
pub struct AutoMakeScheduler {
	config: AutoMakeConfig,
	timer: DebounceTimer,
	running: AtomicBool,
	cycle: CycleFn,
	in_flight: Mutex<HashMap<BuildTarget, Vec<RequestFuture>>>,
	cycles: AtomicU64,
}

impl AutoMakeScheduler {
	/// Creates an idle scheduler running `cycle` when the timer fires.
	pub fn new(config: AutoMakeConfig, cycle: CycleFn) -> Arc<Self> {
		Arc::new(Self {
			config,
			timer: DebounceTimer::new(TaskClass::Scheduler),
			running: AtomicBool::new(false),
			cycle,
			in_flight: Mutex::new(HashMap::new()),
			cycles: AtomicU64::new(0),
		})
	}

	/// Records a file notification. Restarts the quiet period.
	pub fn notify(self: &Arc<Self>) {
		if !self.config.enabled {
			return;
		}
		self.arm(self.config.quiet_period());
	}

	/// Disarms a pending timer.
	pub fn cancel_pending(&self) {
		self.timer.cancel();
	}

	/// Whether the timer is armed.
	pub fn is_armed(&self) -> bool {
		self.timer.is_armed()
	}

	/// Whether a cycle is running.
	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	/// Number of cycles started so far.
	pub fn cycles_started(&self) -> u64 {
		self.cycles.load(Ordering::Acquire)
	}

	fn arm(self: &Arc<Self>, delay: Duration) {
		let weak = Arc::downgrade(self);
		self.timer.schedule(delay, move || fire(weak));
	}

	/// Cancels the automatic builds of `target` and returns their futures.
	pub fn cancel_auto_builds(&self, target: &BuildTarget) -> Vec<RequestFuture> {
		let futures = self.in_flight.lock().remove(target).unwrap_or_default();
		for future in &futures {
			if let Err(e) = future.cancel(true) {
				tracing::warn!(%target, session_id = %future.session_id(), error = %e, "auto-make cancel failed");
			}
		}
		if !futures.is_empty() {
			tracing::debug!(%target, count = futures.len(), "auto-make builds cancelled");
		}
		futures
	}

	/// Number of tracked automatic builds of `target`.
	pub fn in_flight(&self, target: &BuildTarget) -> usize {
		self.in_flight.lock().get(target).map_or(0, Vec::len)
	}

	fn track(&self, target: &BuildTarget, future: &RequestFuture) {
		self.in_flight.lock().entry(target.clone()).or_default().push(future.clone());
	}

	fn untrack(&self, target: &BuildTarget, future: &RequestFuture) {
		let mut in_flight = self.in_flight.lock();
		if let Some(futures) = in_flight.get_mut(target) {
			futures.retain(|f| f.session_id() != future.session_id());
			if futures.is_empty() {
				in_flight.remove(target);
			}
		}
	}

	async fn run_cycle(self: &Arc<Self>) {
		let cycle = self.cycles.fetch_add(1, Ordering::AcqRel) + 1;
		tracing::debug!(cycle, "auto-make cycle started");
		let tracker = CycleTracker {
			scheduler: Arc::downgrade(self),
			builds: Arc::default(),
		};
		(self.cycle)(tracker.clone()).await;
		let builds = std::mem::take(&mut *tracker.builds.lock());
		for (target, future) in &builds {
			future.wait_for(None).await;
			self.untrack(target, future);
		}
		tracing::debug!(cycle, builds = builds.len(), "auto-make cycle finished");
	}
}

async fn fire(weak: Weak<AutoMakeScheduler>) {
	let Some(scheduler) = weak.upgrade() else {
		return;
	};
	if scheduler.running.swap(true, Ordering::AcqRel) {
		tracing::debug!("auto-make cycle still running; re-arming");
		scheduler.arm(scheduler.config.rearm_interval());
		return;
	}
	scheduler.run_cycle().await;
	scheduler.running.store(false, Ordering::Release);
}

/// Handler for automatic builds: diagnostics go to the log.
pub fn auto_make_handler(target: BuildTarget) -> MessageHandler {
	MessageHandler::from_fn(move |event| match event {
		BuildEvent::Message(BuilderMessage::CompileMessage(msg)) => match msg.kind {
			CompileMessageKind::Error => {
				tracing::warn!(%target, source = ?msg.source_path, line = ?msg.line, "{}", msg.text);
			}
			CompileMessageKind::Warning | CompileMessageKind::Info => {
				tracing::debug!(%target, source = ?msg.source_path, "{}", msg.text);
			}
			CompileMessageKind::Progress => {}
		},
		BuildEvent::Message(BuilderMessage::BuildEvent(ev)) => {
			tracing::debug!(%target, kind = ?ev.kind, status = ?ev.status, "auto-make build event");
		}
		BuildEvent::Message(_) => {}
		BuildEvent::Failure(failure) => {
			tracing::warn!(%target, %failure, "auto-make build failed");
		}
		BuildEvent::Terminated => {
			tracing::trace!(%target, "auto-make session terminated");
		}
	})
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use futures::FutureExt;
	use kiln_proto::SessionId;
	use tokio::sync::Notify;

	use super::*;
	use crate::config::MIN_TIMER_INTERVAL;

	fn config() -> AutoMakeConfig {
		AutoMakeConfig::default()
	}

	fn counting_cycle(counter: Arc<AtomicUsize>) -> CycleFn {
		Arc::new(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
			async {}.boxed()
		})
	}

	fn pending_future() -> RequestFuture {
		let (handler, _events) = MessageHandler::channel();
		RequestFuture::new(handler, SessionId::new_v4(), Box::new(|_| Ok(())))
	}

	#[tokio::test(start_paused = true)]
	async fn notifications_inside_quiet_period_collapse() {
		let cycles = Arc::new(AtomicUsize::new(0));
		let scheduler = AutoMakeScheduler::new(config(), counting_cycle(cycles.clone()));

		for _ in 0..20 {
			scheduler.notify();
			tokio::time::sleep(Duration::from_millis(200)).await;
		}
		assert_eq!(cycles.load(Ordering::SeqCst), 0);

		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(cycles.load(Ordering::SeqCst), 1);
		assert_eq!(scheduler.cycles_started(), 1);
		assert!(!scheduler.is_armed());
	}

	#[tokio::test(start_paused = true)]
	async fn disabled_scheduler_never_arms() {
		let cycles = Arc::new(AtomicUsize::new(0));
		let scheduler = AutoMakeScheduler::new(
			AutoMakeConfig {
				enabled: false,
				..config()
			},
			counting_cycle(cycles.clone()),
		);
		scheduler.notify();
		assert!(!scheduler.is_armed());
		tokio::time::sleep(Duration::from_secs(10)).await;
		assert_eq!(cycles.load(Ordering::SeqCst), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn running_cycle_rearms_instead_of_overlapping() {
		let started = Arc::new(AtomicUsize::new(0));
		let future = pending_future();
		let target = BuildTarget::new("/p");

		let s = started.clone();
		let f = future.clone();
		let t = target.clone();
		let cycle: CycleFn = Arc::new(move |tracker| {
			s.fetch_add(1, Ordering::SeqCst);
			tracker.track(&t, &f);
			async {}.boxed()
		});
		let scheduler = AutoMakeScheduler::new(config(), cycle);

		scheduler.notify();
		tokio::time::sleep(Duration::from_secs(6)).await;
		assert!(scheduler.is_running());
		assert_eq!(started.load(Ordering::SeqCst), 1);

		scheduler.notify();
		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(started.load(Ordering::SeqCst), 1, "second cycle overlapped the first");
		assert!(scheduler.is_armed(), "fire during a running cycle must re-arm");

		future.mark_done();
		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(started.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn zero_rearm_interval_does_not_spin() {
		let future = pending_future();
		let f = future.clone();
		let cycle: CycleFn = Arc::new(move |tracker| {
			tracker.track(&BuildTarget::new("/p"), &f);
			async {}.boxed()
		});
		let scheduler = AutoMakeScheduler::new(
			AutoMakeConfig {
				quiet_period_ms: 0,
				rearm_interval_ms: 0,
				..config()
			},
			cycle,
		);

		scheduler.notify();
		tokio::time::sleep(MIN_TIMER_INTERVAL * 2).await;
		assert!(scheduler.is_running());
		scheduler.notify();
		tokio::time::sleep(MIN_TIMER_INTERVAL * 3 / 2).await;
		assert!(scheduler.is_armed(), "re-arm waits at least the minimum interval");
		assert_eq!(scheduler.cycles_started(), 1);

		future.mark_done();
		tokio::time::sleep(MIN_TIMER_INTERVAL * 4).await;
		assert_eq!(scheduler.cycles_started(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn cancel_auto_builds_cancels_tracked_futures() {
		let target = BuildTarget::new("/p");
		let futures: Vec<_> = (0..3).map(|_| pending_future()).collect();

		let fs = futures.clone();
		let t = target.clone();
		let cycle: CycleFn = Arc::new(move |tracker| {
			for f in &fs {
				tracker.track(&t, f);
			}
			async {}.boxed()
		});
		let scheduler = AutoMakeScheduler::new(config(), cycle);
		scheduler.notify();
		tokio::time::sleep(Duration::from_secs(6)).await;

		let cancelled = scheduler.cancel_auto_builds(&target);
		assert_eq!(cancelled.len(), 3);
		assert!(cancelled.iter().all(RequestFuture::is_cancelled));
		assert!(scheduler.cancel_auto_builds(&target).is_empty());

		for future in &futures {
			assert!(!future.wait_for(Some(Duration::from_millis(500))).await);
			future.mark_done();
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(!scheduler.is_running());
	}

	/// A target closed while later targets are still being scheduled sees its
	/// build cancelled.
	#[tokio::test(start_paused = true)]
	async fn builds_are_cancellable_before_cycle_finishes_scheduling() {
		let first = BuildTarget::new("/first");
		let second = BuildTarget::new("/second");
		let first_future = pending_future();
		let second_future = pending_future();
		let gate = Arc::new(Notify::new());

		let (t1, t2) = (first.clone(), second.clone());
		let (f1, f2) = (first_future.clone(), second_future.clone());
		let g = gate.clone();
		let cycle: CycleFn = Arc::new(move |tracker| {
			tracker.track(&t1, &f1);
			let (t2, f2, g) = (t2.clone(), f2.clone(), g.clone());
			async move {
				g.notified().await;
				tracker.track(&t2, &f2);
			}
			.boxed()
		});
		let scheduler = AutoMakeScheduler::new(config(), cycle);
		scheduler.notify();
		tokio::time::sleep(Duration::from_secs(6)).await;
		assert!(scheduler.is_running());

		let cancelled = scheduler.cancel_auto_builds(&first);
		assert_eq!(cancelled.len(), 1);
		assert!(first_future.is_cancelled());
		assert_eq!(scheduler.in_flight(&second), 0);

		gate.notify_one();
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(scheduler.in_flight(&second), 1);
		assert!(!second_future.is_cancelled());

		first_future.mark_done();
		second_future.mark_done();
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(!scheduler.is_running());
		assert_eq!(scheduler.in_flight(&second), 0);
	}
}
