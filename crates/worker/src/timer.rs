use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{TaskClass, spawn};

#[derive(Debug)]
struct Armed {
	generation: u64,
	cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct TimerState {
	next_generation: u64,
	armed: Option<Armed>,
}

/// Restartable single-shot timer.
///
/// [`schedule`](Self::schedule) cancels whatever was armed before, so a burst
/// of calls collapses into one callback fired `delay` after the last call.
#[derive(Debug, Clone)]
pub struct DebounceTimer {
	class: TaskClass,
	state: Arc<Mutex<TimerState>>,
}

impl DebounceTimer {
	/// Creates an idle timer whose callbacks run with `class`.
	pub fn new(class: TaskClass) -> Self {
		Self {
			class,
			state: Arc::new(Mutex::new(TimerState::default())),
		}
	}

	/// Arms the timer, replacing any pending callback.
	pub fn schedule<F, Fut>(&self, delay: Duration, callback: F)
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let cancel = CancellationToken::new();
		let generation = {
			let mut state = self.state.lock();
			state.next_generation = state.next_generation.wrapping_add(1);
			let generation = state.next_generation;
			if let Some(prev) = state.armed.replace(Armed {
				generation,
				cancel: cancel.clone(),
			}) {
				prev.cancel.cancel();
			}
			generation
		};

		let state = self.state.clone();
		spawn(self.class, async move {
			tokio::select! {
				_ = cancel.cancelled() => return,
				_ = tokio::time::sleep(delay) => {}
			}
			{
				let mut state = state.lock();
				match &state.armed {
					Some(armed) if armed.generation == generation => state.armed = None,
					_ => return,
				}
			}
			tracing::trace!(generation, "debounce timer fired");
			callback().await;
		});
	}

	/// Disarms the timer. No-op when idle.
	pub fn cancel(&self) {
		if let Some(armed) = self.state.lock().armed.take() {
			armed.cancel.cancel();
		}
	}

	/// Returns true while a callback is pending.
	pub fn is_armed(&self) -> bool {
		self.state.lock().armed.is_some()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn burst_collapses_into_one_fire() {
		let timer = DebounceTimer::new(TaskClass::Scheduler);
		let fired = Arc::new(AtomicUsize::new(0));

		for _ in 0..10 {
			let fired = fired.clone();
			timer.schedule(Duration::from_secs(5), move || async move {
				fired.fetch_add(1, Ordering::SeqCst);
			});
			tokio::time::sleep(Duration::from_secs(1)).await;
		}
		assert_eq!(fired.load(Ordering::SeqCst), 0);
		assert!(timer.is_armed());

		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 1);
		assert!(!timer.is_armed());
	}

	#[tokio::test(start_paused = true)]
	async fn cancel_disarms() {
		let timer = DebounceTimer::new(TaskClass::Scheduler);
		let fired = Arc::new(AtomicUsize::new(0));
		let f = fired.clone();
		timer.schedule(Duration::from_millis(100), move || async move {
			f.fetch_add(1, Ordering::SeqCst);
		});
		timer.cancel();
		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 0);
		assert!(!timer.is_armed());
	}

	#[tokio::test(start_paused = true)]
	async fn callback_may_rearm_itself() {
		let timer = DebounceTimer::new(TaskClass::Scheduler);
		let fired = Arc::new(AtomicUsize::new(0));

		let inner_timer = timer.clone();
		let f = fired.clone();
		timer.schedule(Duration::from_millis(100), move || async move {
			f.fetch_add(1, Ordering::SeqCst);
			let f2 = f.clone();
			inner_timer.schedule(Duration::from_millis(100), move || async move {
				f2.fetch_add(1, Ordering::SeqCst);
			});
		});

		tokio::time::sleep(Duration::from_millis(150)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 1);
		assert!(timer.is_armed());
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 2);
	}
}
