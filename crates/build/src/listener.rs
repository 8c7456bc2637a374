//! Loopback TCP listener accepting build process connections.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use kiln_proto::{BuilderMessage, Message, MessageBody, MessageCodec};
use kiln_worker::{TaskClass, spawn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{ConnectionHandle, MessageDispatcher};
use crate::error::{Error, Result};

/// Running accept loop. Dropping it stops listening.
#[derive(Debug)]
pub struct Listener {
	addr: SocketAddr,
	shutdown: CancellationToken,
}

impl Listener {
	/// Binds `addr` and starts accepting connections that feed `dispatcher`.
	///
	/// # Errors
	///
	/// Returns [`Error::Configuration`] if the address cannot be bound.
	pub async fn bind(addr: SocketAddr, dispatcher: Arc<MessageDispatcher>, max_frame_len: usize) -> Result<Self> {
		let listener = TcpListener::bind(addr)
			.await
			.map_err(|e| Error::Configuration(format!("cannot listen on {addr}: {e}")))?;
		let addr = listener
			.local_addr()
			.map_err(|e| Error::Configuration(format!("cannot resolve listen address: {e}")))?;
		tracing::info!(%addr, "build transport listening");

		let shutdown = CancellationToken::new();
		spawn(TaskClass::Transport, accept_loop(listener, dispatcher, max_frame_len, shutdown.clone()));
		Ok(Self { addr, shutdown })
	}

	/// Bound address.
	pub fn local_addr(&self) -> SocketAddr {
		self.addr
	}

	/// Bound port.
	pub fn port(&self) -> u16 {
		self.addr.port()
	}

	/// Stops accepting and closes every open connection.
	pub fn stop(&self) {
		self.shutdown.cancel();
	}
}

impl Drop for Listener {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<MessageDispatcher>, max_frame_len: usize, shutdown: CancellationToken) {
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => {
				tracing::info!("build transport shutting down");
				break;
			}
			res = listener.accept() => match res {
				Ok((stream, peer)) => {
					tracing::debug!(%peer, "build process connected");
					spawn(
						TaskClass::Transport,
						handle_connection(stream, dispatcher.clone(), max_frame_len, shutdown.child_token()),
					);
				}
				Err(e) => tracing::error!(error = %e, "failed to accept build process connection"),
			}
		}
	}
}

/// Serves one build process connection until it closes or the listener stops.
async fn handle_connection(
	stream: TcpStream,
	dispatcher: Arc<MessageDispatcher>,
	max_frame_len: usize,
	shutdown: CancellationToken,
) {
	let id = dispatcher.next_connection_id();
	if let Err(e) = stream.set_nodelay(true) {
		tracing::warn!(connection = id, error = %e, "failed to set TCP_NODELAY");
	}
	let (reader, writer) = stream.into_split();
	let mut frames = FramedRead::new(reader, MessageCodec::with_max_frame_len(max_frame_len));

	let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
	let handle = ConnectionHandle::new(id, tx);

	let writer_shutdown = shutdown.clone();
	spawn(TaskClass::Transport, async move {
		let mut sink = FramedWrite::new(writer, MessageCodec::with_max_frame_len(max_frame_len));
		loop {
			tokio::select! {
				_ = writer_shutdown.cancelled() => break,
				msg = rx.recv() => match msg {
					Some(msg) => {
						if let Err(e) = sink.send(msg).await {
							tracing::warn!(connection = id, error = %e, "write to build process failed");
							break;
						}
					}
					None => break,
				}
			}
		}
	});

	let lost = loop {
		tokio::select! {
			_ = shutdown.cancelled() => break Some("listener stopped".to_string()),
			frame = frames.next() => match frame {
				Some(Ok(msg)) => route(&dispatcher, &handle, msg),
				Some(Err(e)) => break Some(e.to_string()),
				None => break None,
			}
		}
	};
	match lost {
		Some(reason) => dispatcher.connection_lost(id, &reason),
		None => dispatcher.connection_closed(id),
	}
}

fn route(dispatcher: &MessageDispatcher, handle: &ConnectionHandle, msg: Message) {
	if matches!(msg.body, MessageBody::Builder(BuilderMessage::ParamRequest)) {
		dispatcher.bind_connection(msg.session_id, handle.clone());
	} else {
		dispatcher.dispatch(handle.id(), msg);
	}
}
