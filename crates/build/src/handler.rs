//! Per-session event delivery.
//!
//! Each build session reports to its caller through one ordered channel of
//! [`BuildEvent`]s. The channel ends with exactly one [`BuildEvent::Terminated`].

use kiln_proto::{BuilderMessage, Failure};
use tokio::sync::mpsc;

/// Events delivered to the owner of a build session.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
	/// Progress, diagnostics or lifecycle events from the build process.
	Message(BuilderMessage),
	/// The build failed. Delivered at most once per session.
	Failure(Failure),
	/// The session is over. Always the last event.
	Terminated,
}

/// Sending half of a session's event channel.
#[derive(Debug, Clone)]
pub struct MessageHandler {
	tx: mpsc::UnboundedSender<BuildEvent>,
}

/// Receiving half of a session's event channel.
#[derive(Debug)]
pub struct BuildEvents {
	rx: mpsc::UnboundedReceiver<BuildEvent>,
}

impl MessageHandler {
	/// Creates a connected handler/receiver pair.
	#[must_use]
	pub fn channel() -> (Self, BuildEvents) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, BuildEvents { rx })
	}

	/// Creates a handler that feeds every event to `f` on a worker task.
	pub fn from_fn<F>(mut f: F) -> Self
	where
		F: FnMut(BuildEvent) + Send + 'static,
	{
		let (handler, mut events) = Self::channel();
		kiln_worker::spawn(kiln_worker::TaskClass::Build, async move {
			while let Some(event) = events.recv().await {
				let last = event == BuildEvent::Terminated;
				f(event);
				if last {
					break;
				}
			}
		});
		handler
	}

	/// Delivers a message from the build process.
	pub fn handle_build_message(&self, msg: BuilderMessage) {
		self.deliver(BuildEvent::Message(msg));
	}

	/// Delivers a failure.
	pub fn handle_failure(&self, failure: Failure) {
		self.deliver(BuildEvent::Failure(failure));
	}

	/// Signals the end of the session.
	pub fn session_terminated(&self) {
		self.deliver(BuildEvent::Terminated);
	}

	fn deliver(&self, event: BuildEvent) {
		if self.tx.send(event).is_err() {
			tracing::trace!("build event receiver dropped");
		}
	}
}

impl BuildEvents {
	/// Receives the next event, or `None` once the handler side is gone.
	pub async fn recv(&mut self) -> Option<BuildEvent> {
		self.rx.recv().await
	}

	/// Receives an event without waiting.
	pub fn try_recv(&mut self) -> Option<BuildEvent> {
		self.rx.try_recv().ok()
	}

	/// Collects events up to and including [`BuildEvent::Terminated`].
	pub async fn until_terminated(mut self) -> Vec<BuildEvent> {
		let mut out = Vec::new();
		while let Some(event) = self.rx.recv().await {
			let last = event == BuildEvent::Terminated;
			out.push(event);
			if last {
				break;
			}
		}
		out
	}
}
