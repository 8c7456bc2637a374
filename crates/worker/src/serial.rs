use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::{TaskClass, panic_message, spawn};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Ordered, single-consumer task queue.
///
/// Jobs submitted to one queue run one at a time in submission order on the
/// worker pool. Distinct queues make progress independently. A panicking job is
/// logged and does not stop the queue. The consumer exits once every handle is
/// dropped and the backlog is drained.
#[derive(Debug, Clone)]
pub struct SerialQueue {
	name: Arc<str>,
	tx: mpsc::UnboundedSender<Job>,
	pending: Arc<AtomicUsize>,
}

impl SerialQueue {
	/// Creates a queue and starts its consumer.
	pub fn new(class: TaskClass, name: impl Into<Arc<str>>) -> Self {
		let name = name.into();
		let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
		let pending = Arc::new(AtomicUsize::new(0));

		let consumer_name = name.clone();
		let consumer_pending = pending.clone();
		spawn(class, async move {
			while let Some(job) = rx.recv().await {
				if let Err(err) = spawn(class, job).await
					&& let Some(msg) = panic_message(err)
				{
					tracing::error!(queue = %consumer_name, panic = %msg, "serial queue job panicked");
				}
				consumer_pending.fetch_sub(1, Ordering::AcqRel);
			}
			tracing::trace!(queue = %consumer_name, "serial queue closed");
		});

		Self { name, tx, pending }
	}

	/// Queue name used in traces.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Appends a job. Returns `false` if the consumer is gone.
	pub fn submit<F>(&self, fut: F) -> bool
	where
		F: Future<Output = ()> + Send + 'static,
	{
		self.pending.fetch_add(1, Ordering::AcqRel);
		if self.tx.send(Box::pin(fut)).is_err() {
			self.pending.fetch_sub(1, Ordering::AcqRel);
			tracing::warn!(queue = %self.name, "submit to closed serial queue");
			return false;
		}
		true
	}

	/// Number of jobs submitted but not yet finished.
	pub fn pending(&self) -> usize {
		self.pending.load(Ordering::Acquire)
	}

	/// Resolves once every job submitted before this call has finished.
	pub async fn flush(&self) {
		let (tx, rx) = oneshot::channel();
		if self.submit(async move {
			let _ = tx.send(());
		}) {
			let _ = rx.await;
		}
	}
}
