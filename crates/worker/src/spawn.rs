use std::future::Future;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinHandle;

use crate::TaskClass;

/// Worker threads used by the global pool when none is configured.
pub const DEFAULT_POOL_SIZE: usize = 4;

static POOL_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_POOL_SIZE);
static GLOBAL_RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

/// Sets the number of worker threads of the global pool.
///
/// Only effective before the first task is spawned outside an ambient runtime.
/// Returns `false` when the pool is already running.
pub fn set_pool_size(threads: usize) -> bool {
	POOL_SIZE.store(threads.max(1), Ordering::Release);
	GLOBAL_RT.get().is_none()
}

fn runtime_handle() -> tokio::runtime::Handle {
	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		return handle;
	}

	let runtime = GLOBAL_RT.get_or_init(|| {
		let threads = POOL_SIZE.load(Ordering::Acquire);
		tracing::debug!(threads, "worker.pool.start");
		tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.worker_threads(threads)
			.thread_name("kiln-worker")
			.build()
			.expect("failed to build kiln-worker global tokio runtime")
	});
	runtime.handle().clone()
}

/// Spawns an async task on the worker pool.
pub fn spawn<F>(class: TaskClass, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(worker_class = class.as_str(), "worker.spawn");
	runtime_handle().spawn(fut)
}

/// Spawns blocking work on the pool's blocking threads.
pub fn spawn_blocking<F, R>(class: TaskClass, f: F) -> JoinHandle<R>
where
	F: FnOnce() -> R + Send + 'static,
	R: Send + 'static,
{
	tracing::trace!(worker_class = class.as_str(), "worker.spawn_blocking");
	runtime_handle().spawn_blocking(f)
}

/// Extracts the panic payload text from a failed join, if it was a panic.
pub fn panic_message(err: tokio::task::JoinError) -> Option<String> {
	let payload = err.try_into_panic().ok()?;
	if let Some(s) = payload.downcast_ref::<&'static str>() {
		return Some((*s).to_string());
	}
	if let Some(s) = payload.downcast_ref::<String>() {
		return Some(s.clone());
	}
	Some("<non-string panic payload>".to_string())
}
