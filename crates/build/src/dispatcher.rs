//! Session registry and inbound message routing.
//!
//! A session is registered with its handler and initial request before any
//! build process exists. When the process connects and announces itself with
//! [`BuilderMessage::ParamRequest`], its connection is bound to the session and
//! the buffered request is sent. From then on every frame arriving on that
//! connection is routed to the session's handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use kiln_proto::{BuildParameters, BuilderMessage, ControllerMessage, Failure, Message, MessageBody, SessionId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::Error;
use crate::handler::MessageHandler;

/// Identifies one accepted transport connection.
pub type ConnectionId = u64;

/// Outbound half of a transport connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	id: ConnectionId,
	tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
	/// Wraps the writer channel of connection `id`.
	pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Message>) -> Self {
		Self { id, tx }
	}

	/// Connection id.
	pub fn id(&self) -> ConnectionId {
		self.id
	}

	/// Queues a frame. Returns `false` once the writer is gone.
	pub fn send(&self, msg: Message) -> bool {
		self.tx.send(msg).is_ok()
	}
}

struct SessionEntry {
	handler: MessageHandler,
	initial_request: Option<BuildParameters>,
	connection: Option<ConnectionHandle>,
	bound: watch::Sender<bool>,
	cancel_requested: bool,
	failure_delivered: bool,
	transport_error: Option<Error>,
}

#[derive(Default)]
struct Registry {
	sessions: HashMap<SessionId, SessionEntry>,
	connections: HashMap<ConnectionId, SessionId>,
}

impl Registry {
	fn fail(&mut self, session_id: SessionId, failure: Failure) -> bool {
		let Some(entry) = self.sessions.get_mut(&session_id) else {
			tracing::debug!(%session_id, %failure, "failure for unknown session dropped");
			return false;
		};
		if entry.failure_delivered {
			tracing::debug!(%session_id, %failure, "duplicate session failure dropped");
			return false;
		}
		entry.failure_delivered = true;
		entry.handler.handle_failure(failure);
		true
	}
}

/// Registry of live build sessions.
///
/// Every mutation happens under a single lock; handler delivery is a
/// non-blocking channel send performed while holding it, so events for one
/// session are never reordered against its unregistration.
#[derive(Default)]
pub struct MessageDispatcher {
	registry: Mutex<Registry>,
	next_connection: AtomicU64,
}

impl MessageDispatcher {
	/// Creates an empty registry.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Allocates an id for a newly accepted connection.
	pub fn next_connection_id(&self) -> ConnectionId {
		self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
	}

	/// Records `handler` and the request to send once the process connects.
	pub fn register_handler(&self, session_id: SessionId, handler: MessageHandler, initial_request: BuildParameters) {
		let mut registry = self.registry.lock();
		let previous = registry.sessions.insert(
			session_id,
			SessionEntry {
				handler,
				initial_request: Some(initial_request),
				connection: None,
				bound: watch::Sender::new(false),
				cancel_requested: false,
				failure_delivered: false,
				transport_error: None,
			},
		);
		debug_assert!(previous.is_none(), "session id reused");
	}

	/// Removes the session and returns its handler. Only the first call for a
	/// session gets `Some`.
	pub fn unregister_handler(&self, session_id: SessionId) -> Option<MessageHandler> {
		let mut registry = self.registry.lock();
		let entry = registry.sessions.remove(&session_id)?;
		if let Some(conn) = &entry.connection {
			registry.connections.remove(&conn.id);
		}
		Some(entry.handler)
	}

	/// Binds `connection` to `session_id` and sends the buffered request.
	///
	/// Unknown sessions, and sessions already bound to another connection, are
	/// rejected and the connection is told to cancel. Rebinding the same
	/// connection is a no-op.
	pub fn bind_connection(&self, session_id: SessionId, connection: ConnectionHandle) -> bool {
		let mut registry = self.registry.lock();
		let Some(entry) = registry.sessions.get_mut(&session_id) else {
			tracing::warn!(%session_id, connection = connection.id, "connection for unknown session");
			connection.send(Message::controller(session_id, ControllerMessage::CancelBuild));
			return false;
		};
		match &entry.connection {
			Some(bound) if bound.id == connection.id => return true,
			Some(bound) => {
				tracing::warn!(
					%session_id,
					bound = bound.id,
					connection = connection.id,
					"session already bound to another connection"
				);
				connection.send(Message::controller(session_id, ControllerMessage::CancelBuild));
				return false;
			}
			None => {}
		}

		if let Some(params) = entry.initial_request.take() {
			connection.send(Message::controller(session_id, ControllerMessage::BuildParameters(params)));
		}
		if entry.cancel_requested {
			connection.send(Message::controller(session_id, ControllerMessage::CancelBuild));
		}
		tracing::debug!(%session_id, connection = connection.id, "session bound");
		let id = connection.id;
		entry.connection = Some(connection);
		entry.bound.send_replace(true);
		registry.connections.insert(id, session_id);
		true
	}

	/// Routes an inbound frame from `connection` to its session's handler.
	pub fn dispatch(&self, connection: ConnectionId, msg: Message) {
		let mut registry = self.registry.lock();
		let Some(&session_id) = registry.connections.get(&connection) else {
			tracing::warn!(connection, session_id = %msg.session_id, "message on unbound connection ignored");
			return;
		};
		if msg.session_id != session_id {
			tracing::warn!(
				connection,
				%session_id,
				claimed = %msg.session_id,
				"message names a different session than its connection"
			);
		}
		match msg.body {
			MessageBody::Builder(BuilderMessage::Failure(failure)) | MessageBody::Failure(failure) => {
				registry.fail(session_id, failure);
			}
			MessageBody::Builder(BuilderMessage::ParamRequest) => {
				tracing::debug!(%session_id, connection, "repeated parameter request ignored");
			}
			MessageBody::Builder(builder) => {
				if let Some(entry) = registry.sessions.get(&session_id) {
					entry.handler.handle_build_message(builder);
				}
			}
			MessageBody::Controller(_) => {
				tracing::warn!(%session_id, connection, "controller message from build process ignored");
			}
		}
	}

	/// Asks the bound build process to stop. Before binding, the cancel is sent
	/// right after the initial request. Repeated calls send nothing new.
	pub fn cancel_session(&self, session_id: SessionId) {
		let mut registry = self.registry.lock();
		let Some(entry) = registry.sessions.get_mut(&session_id) else {
			return;
		};
		if std::mem::replace(&mut entry.cancel_requested, true) {
			return;
		}
		if let Some(conn) = &entry.connection {
			conn.send(Message::controller(session_id, ControllerMessage::CancelBuild));
		}
	}

	/// Sends `msg` to the session's build process if it is connected.
	pub fn send_to_session(&self, session_id: SessionId, msg: ControllerMessage) -> bool {
		let registry = self.registry.lock();
		registry
			.sessions
			.get(&session_id)
			.and_then(|entry| entry.connection.as_ref())
			.is_some_and(|conn| conn.send(Message::controller(session_id, msg)))
	}

	/// Delivers `failure` unless one was already delivered to this session.
	pub fn fail_session(&self, session_id: SessionId, failure: Failure) -> bool {
		self.registry.lock().fail(session_id, failure)
	}

	/// Unbinds a connection that failed and fails its session.
	pub fn connection_lost(&self, connection: ConnectionId, reason: &str) {
		let mut registry = self.registry.lock();
		let Some(session_id) = registry.connections.remove(&connection) else {
			tracing::debug!(connection, reason, "unbound connection lost");
			return;
		};
		tracing::warn!(%session_id, connection, reason, "build process connection lost");
		let error = Error::Transport(reason.to_string());
		let failure = error.to_failure();
		if let Some(entry) = registry.sessions.get_mut(&session_id) {
			entry.connection = None;
			entry.transport_error.get_or_insert(error);
			entry.bound.send_replace(false);
		}
		registry.fail(session_id, failure);
	}

	/// The transport error that ended the session's connection, if any.
	pub fn transport_error(&self, session_id: SessionId) -> Option<Error> {
		self.registry
			.lock()
			.sessions
			.get(&session_id)
			.and_then(|entry| entry.transport_error.clone())
	}

	/// Unbinds a connection closed cleanly by the build process.
	pub fn connection_closed(&self, connection: ConnectionId) {
		let mut registry = self.registry.lock();
		if let Some(session_id) = registry.connections.remove(&connection) {
			tracing::debug!(%session_id, connection, "build process connection closed");
			if let Some(entry) = registry.sessions.get_mut(&session_id) {
				entry.connection = None;
				entry.bound.send_replace(false);
			}
		}
	}

	/// Whether `session_id` is registered.
	pub fn has_session(&self, session_id: SessionId) -> bool {
		self.registry.lock().sessions.contains_key(&session_id)
	}

	/// Whether `session_id` has a live connection.
	pub fn is_bound(&self, session_id: SessionId) -> bool {
		self.registry
			.lock()
			.sessions
			.get(&session_id)
			.is_some_and(|entry| entry.connection.is_some())
	}

	/// Observes whether `session_id` has a live connection. The channel closes
	/// when the session is unregistered.
	pub fn watch_bound(&self, session_id: SessionId) -> Option<watch::Receiver<bool>> {
		self.registry
			.lock()
			.sessions
			.get(&session_id)
			.map(|entry| entry.bound.subscribe())
	}

	/// Number of registered sessions.
	pub fn session_count(&self) -> usize {
		self.registry.lock().sessions.len()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::thread;

	use kiln_proto::{BuildType, CompletionStatus, GlobalSettings};

	use super::*;
	use crate::handler::BuildEvent;

	fn params() -> BuildParameters {
		BuildParameters {
			build_type: BuildType::Make,
			project_id: "/p".into(),
			modules: Vec::new(),
			artifacts: Vec::new(),
			file_paths: Vec::new(),
			builder_parameters: Vec::new(),
			global_settings: GlobalSettings::default(),
			fs_event: None,
		}
	}

	fn connection(dispatcher: &MessageDispatcher) -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(ConnectionHandle::new(dispatcher.next_connection_id(), tx), rx)
	}

	fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<MessageBody> {
		let mut out = Vec::new();
		while let Ok(msg) = rx.try_recv() {
			out.push(msg.body);
		}
		out
	}

	#[test]
	fn bind_sends_buffered_request_once() {
		let dispatcher = MessageDispatcher::new();
		let session = SessionId::new_v4();
		let (handler, _events) = MessageHandler::channel();
		dispatcher.register_handler(session, handler, params());

		let (conn, mut rx) = connection(&dispatcher);
		assert!(dispatcher.bind_connection(session, conn.clone()));
		assert!(dispatcher.bind_connection(session, conn));
		let sent = drain(&mut rx);
		assert_eq!(sent.len(), 1);
		assert!(matches!(sent[0], MessageBody::Controller(ControllerMessage::BuildParameters(_))));
		assert!(dispatcher.is_bound(session));
	}

	#[test]
	fn bind_rejects_unknown_and_second_connection() {
		let dispatcher = MessageDispatcher::new();
		let (stray, mut stray_rx) = connection(&dispatcher);
		assert!(!dispatcher.bind_connection(SessionId::new_v4(), stray));
		assert_eq!(drain(&mut stray_rx), vec![MessageBody::Controller(ControllerMessage::CancelBuild)]);

		let session = SessionId::new_v4();
		let (handler, _events) = MessageHandler::channel();
		dispatcher.register_handler(session, handler, params());
		let (first, _first_rx) = connection(&dispatcher);
		let (second, mut second_rx) = connection(&dispatcher);
		assert!(dispatcher.bind_connection(session, first));
		assert!(!dispatcher.bind_connection(session, second));
		assert_eq!(drain(&mut second_rx), vec![MessageBody::Controller(ControllerMessage::CancelBuild)]);
	}

	#[test]
	fn dispatch_routes_to_bound_session_only() {
		let dispatcher = MessageDispatcher::new();
		let session = SessionId::new_v4();
		let (handler, mut events) = MessageHandler::channel();
		dispatcher.register_handler(session, handler, params());

		let (conn, _rx) = connection(&dispatcher);
		let id = conn.id();
		dispatcher.dispatch(id, Message::builder(session, BuilderMessage::progress("early", None)));
		assert!(events.try_recv().is_none());

		dispatcher.bind_connection(session, conn);
		let done = BuilderMessage::build_completed(CompletionStatus::Success);
		dispatcher.dispatch(id, Message::builder(session, done.clone()));
		assert_eq!(events.try_recv(), Some(BuildEvent::Message(done)));
	}

	#[test]
	fn cancel_before_bind_is_sent_after_request() {
		let dispatcher = MessageDispatcher::new();
		let session = SessionId::new_v4();
		let (handler, _events) = MessageHandler::channel();
		dispatcher.register_handler(session, handler, params());
		dispatcher.cancel_session(session);
		dispatcher.cancel_session(session);

		let (conn, mut rx) = connection(&dispatcher);
		dispatcher.bind_connection(session, conn);
		let sent = drain(&mut rx);
		assert_eq!(sent.len(), 2);
		assert_eq!(sent[1], MessageBody::Controller(ControllerMessage::CancelBuild));

		dispatcher.cancel_session(session);
		assert!(drain(&mut rx).is_empty());
	}

	#[test]
	fn failures_are_delivered_at_most_once() {
		let dispatcher = MessageDispatcher::new();
		let session = SessionId::new_v4();
		let (handler, mut events) = MessageHandler::channel();
		dispatcher.register_handler(session, handler, params());
		let (conn, _rx) = connection(&dispatcher);
		let id = conn.id();
		dispatcher.bind_connection(session, conn);

		dispatcher.dispatch(id, Message::failure(session, Failure::new("boom")));
		dispatcher.connection_lost(id, "reset by peer");
		assert!(!dispatcher.fail_session(session, Failure::new("again")));

		assert_eq!(events.try_recv(), Some(BuildEvent::Failure(Failure::new("boom"))));
		assert!(events.try_recv().is_none());
		assert!(!dispatcher.is_bound(session));
	}

	#[test]
	fn connection_lost_fails_bound_session() {
		let dispatcher = MessageDispatcher::new();
		let session = SessionId::new_v4();
		let (handler, mut events) = MessageHandler::channel();
		dispatcher.register_handler(session, handler, params());
		let (conn, _rx) = connection(&dispatcher);
		let id = conn.id();
		dispatcher.bind_connection(session, conn);

		assert_eq!(dispatcher.transport_error(session), None);
		dispatcher.connection_lost(id, "malformed frame length prefix");
		match events.try_recv() {
			Some(BuildEvent::Failure(failure)) => assert!(failure.description.contains("disconnected")),
			other => panic!("expected failure, got {other:?}"),
		}
		assert_eq!(
			dispatcher.transport_error(session),
			Some(Error::Transport("malformed frame length prefix".into()))
		);
	}

	#[test]
	fn clean_close_records_no_transport_error() {
		let dispatcher = MessageDispatcher::new();
		let session = SessionId::new_v4();
		let (handler, mut events) = MessageHandler::channel();
		dispatcher.register_handler(session, handler, params());
		let (conn, _rx) = connection(&dispatcher);
		let id = conn.id();
		dispatcher.bind_connection(session, conn);

		dispatcher.connection_closed(id);
		assert!(!dispatcher.is_bound(session));
		assert_eq!(dispatcher.transport_error(session), None);
		assert!(events.try_recv().is_none());
	}

	#[test]
	fn send_to_session_requires_binding() {
		let dispatcher = MessageDispatcher::new();
		let session = SessionId::new_v4();
		let (handler, _events) = MessageHandler::channel();
		dispatcher.register_handler(session, handler, params());
		assert!(!dispatcher.send_to_session(session, ControllerMessage::CancelBuild));

		let (conn, mut rx) = connection(&dispatcher);
		dispatcher.bind_connection(session, conn);
		drain(&mut rx);
		assert!(dispatcher.send_to_session(session, ControllerMessage::CancelBuild));
		assert_eq!(drain(&mut rx).len(), 1);
	}

	/// Racing unregistration from several threads hands the handler out once.
	#[test]
	fn unregister_races_yield_one_handler() {
		for _ in 0..64 {
			let dispatcher = Arc::new(MessageDispatcher::new());
			let session = SessionId::new_v4();
			let (handler, _events) = MessageHandler::channel();
			dispatcher.register_handler(session, handler, params());

			let winners: usize = (0..4)
				.map(|_| {
					let d = dispatcher.clone();
					thread::spawn(move || d.unregister_handler(session).is_some())
				})
				.collect::<Vec<_>>()
				.into_iter()
				.map(|h| usize::from(h.join().unwrap()))
				.sum();
			assert_eq!(winners, 1);
			assert_eq!(dispatcher.session_count(), 0);
		}
	}
}
