//! Caller-facing handle for one in-flight build.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kiln_proto::SessionId;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::handler::MessageHandler;

/// How a [`RequestFuture`] asks the remote session to stop.
pub type CancelAction = Box<dyn Fn(SessionId) -> Result<()> + Send + Sync>;

/// Lifecycle of a [`RequestFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
	/// The build is queued or running.
	Pending,
	/// Cancellation was requested; waiting for the build to wind down.
	Cancelling,
	/// Terminal.
	Done,
}

#[derive(Debug, Clone)]
struct Slot {
	state: FutureState,
	outcome: Option<Result<()>>,
}

struct Inner {
	session_id: SessionId,
	handler: MessageHandler,
	slot: watch::Sender<Slot>,
	cancel_action: CancelAction,
}

/// Shared handle to an asynchronous, cancellable build.
///
/// Clones observe the same state. Exactly one terminal transition happens; the
/// first of [`mark_done`](Self::mark_done) / [`mark_failed`](Self::mark_failed)
/// wins and later calls are ignored.
#[derive(Clone)]
pub struct RequestFuture {
	inner: Arc<Inner>,
}

impl fmt::Debug for RequestFuture {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RequestFuture")
			.field("session_id", &self.inner.session_id)
			.field("state", &self.state())
			.finish()
	}
}

impl RequestFuture {
	/// Creates a pending future for `session_id`.
	pub fn new(handler: MessageHandler, session_id: SessionId, cancel_action: CancelAction) -> Self {
		let (slot, _) = watch::channel(Slot {
			state: FutureState::Pending,
			outcome: None,
		});
		Self {
			inner: Arc::new(Inner {
				session_id,
				handler,
				slot,
				cancel_action,
			}),
		}
	}

	/// Session this future tracks.
	pub fn session_id(&self) -> SessionId {
		self.inner.session_id
	}

	/// Handler receiving the session's events.
	pub fn handler(&self) -> &MessageHandler {
		&self.inner.handler
	}

	/// Current state.
	pub fn state(&self) -> FutureState {
		self.inner.slot.borrow().state
	}

	/// True once terminal.
	pub fn is_done(&self) -> bool {
		self.state() == FutureState::Done
	}

	/// True if cancellation was requested, whether or not it has completed.
	pub fn is_cancelled(&self) -> bool {
		let slot = self.inner.slot.borrow();
		match slot.state {
			FutureState::Cancelling => true,
			FutureState::Done => matches!(slot.outcome, Some(Err(Error::CancelledByUser))),
			FutureState::Pending => false,
		}
	}

	/// Terminal outcome, once done.
	pub fn outcome(&self) -> Option<Result<()>> {
		self.inner.slot.borrow().outcome.clone()
	}

	/// Requests cancellation.
	///
	/// Moves a pending future to [`FutureState::Cancelling`]. With
	/// `cancel_build` the cancel action also tells the remote session to stop.
	/// Calling this again, or on a finished future, does nothing.
	pub fn cancel(&self, cancel_build: bool) -> Result<()> {
		let transitioned = self.inner.slot.send_if_modified(|slot| {
			if slot.state == FutureState::Pending {
				slot.state = FutureState::Cancelling;
				true
			} else {
				false
			}
		});
		if !transitioned {
			return Ok(());
		}
		tracing::debug!(session_id = %self.inner.session_id, cancel_build, "build cancel requested");
		if cancel_build {
			(self.inner.cancel_action)(self.inner.session_id)?;
		}
		Ok(())
	}

	/// Waits until done or until `timeout` elapses; returns whether it is done.
	///
	/// Holds no lock while waiting, so it is safe to call from any task.
	pub async fn wait_for(&self, timeout: Option<Duration>) -> bool {
		let mut rx = self.inner.slot.subscribe();
		let done = async move { rx.wait_for(|slot| slot.state == FutureState::Done).await.is_ok() };
		match timeout {
			Some(timeout) => tokio::time::timeout(timeout, done).await.unwrap_or(false),
			None => done.await,
		}
	}

	/// Completes the future successfully, or as cancelled when a cancel was
	/// requested first.
	pub fn mark_done(&self) {
		self.complete(Ok(()));
	}

	/// Completes the future with `error`.
	pub fn mark_failed(&self, error: Error) {
		self.complete(Err(error));
	}

	fn complete(&self, result: Result<()>) {
		let session_id = self.inner.session_id;
		self.inner.slot.send_if_modified(|slot| {
			let outcome = match (slot.state, result) {
				(FutureState::Done, _) => return false,
				(FutureState::Cancelling, Ok(())) => Err(Error::CancelledByUser),
				(_, result) => result,
			};
			tracing::debug!(%session_id, ?outcome, "build future done");
			slot.state = FutureState::Done;
			slot.outcome = Some(outcome);
			true
		});
	}
}
