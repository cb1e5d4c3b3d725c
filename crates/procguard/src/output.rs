use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;

use crate::types::StreamKind;

const RING_BUFFER_SIZE: usize = 64 * 1024;
const CHANNEL_CAPACITY: usize = 256;

/// Captured output of one stream of one attempt.
///
/// Keeps the most recent bytes in a ring buffer and fans live chunks out to
/// every attached [`OutputPipe`]. Once the child closes the stream the
/// capture is closed: attached pipes drain and then see EOF, later pipes get
/// the backlog followed by EOF.
#[derive(Clone)]
pub struct OutputCapture {
	generation: u64,
	stream: StreamKind,
	inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for OutputCapture {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OutputCapture")
			.field("generation", &self.generation)
			.field("stream", &self.stream)
			.finish_non_exhaustive()
	}
}

struct Inner {
	ring: VecDeque<u8>,
	sender: Option<broadcast::Sender<Vec<u8>>>,
}

impl OutputCapture {
	pub fn new(generation: u64, stream: StreamKind) -> Self {
		let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
		Self {
			generation,
			stream,
			inner: Arc::new(Mutex::new(Inner {
				ring: VecDeque::with_capacity(RING_BUFFER_SIZE),
				sender: Some(sender),
			})),
		}
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn stream(&self) -> StreamKind {
		self.stream
	}

	pub async fn write(&self, data: &[u8]) {
		// Send under the lock so subscribe() never sees a gap or a duplicate.
		let mut inner = self.inner.lock().await;
		let tail = &data[data.len().saturating_sub(RING_BUFFER_SIZE)..];
		let overflow = (inner.ring.len() + tail.len()).saturating_sub(RING_BUFFER_SIZE);
		inner.ring.drain(..overflow);
		inner.ring.extend(tail);
		if let Some(sender) = &inner.sender {
			let _ = sender.send(data.to_vec());
		}
	}

	/// Mark the stream as ended. Pipes see EOF after draining.
	pub async fn close(&self) {
		self.inner.lock().await.sender = None;
	}

	pub async fn is_closed(&self) -> bool {
		self.inner.lock().await.sender.is_none()
	}

	pub async fn snapshot(&self) -> Vec<u8> {
		let inner = self.inner.lock().await;
		inner.ring.iter().copied().collect()
	}

	/// Attach a pipe that first yields the buffered backlog, then live chunks.
	pub async fn subscribe(&self) -> OutputPipe {
		let inner = self.inner.lock().await;
		let backlog: Vec<u8> = inner.ring.iter().copied().collect();
		let receiver = match &inner.sender {
			Some(sender) => sender.subscribe(),
			None => broadcast::channel(1).1,
		};
		drop(inner);

		OutputPipe {
			generation: self.generation,
			stream: self.stream,
			backlog: if backlog.is_empty() { None } else { Some(backlog) },
			receiver,
		}
	}
}

/// Read side of a child's stdout or stderr, bound to one attempt.
///
/// A restart does not redirect an existing pipe: it yields EOF when its own
/// process closes the stream. Compare [`OutputPipe::generation`] with the
/// guard's current attempt and re-acquire after each restart.
pub struct OutputPipe {
	generation: u64,
	stream: StreamKind,
	backlog: Option<Vec<u8>>,
	receiver: broadcast::Receiver<Vec<u8>>,
}

impl OutputPipe {
	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn stream(&self) -> StreamKind {
		self.stream
	}

	/// Next chunk of output, or `None` at EOF.
	pub async fn read(&mut self) -> Option<Vec<u8>> {
		if let Some(backlog) = self.backlog.take() {
			return Some(backlog);
		}
		loop {
			match self.receiver.recv().await {
				Ok(chunk) => return Some(chunk),
				Err(RecvError::Lagged(skipped)) => {
					tracing::debug!(
						generation = self.generation,
						stream = %self.stream,
						skipped,
						"output pipe lagged, chunks dropped"
					);
				}
				Err(RecvError::Closed) => return None,
			}
		}
	}

	pub async fn read_to_end(mut self) -> Vec<u8> {
		let mut out = Vec::new();
		while let Some(chunk) = self.read().await {
			out.extend_from_slice(&chunk);
		}
		out
	}
}

/// Copy a child stream into its capture until EOF.
pub(crate) async fn pump<R: AsyncRead + Unpin>(mut reader: R, output: OutputCapture) {
	let mut buf = [0u8; 4096];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => output.write(&buf[..n]).await,
			Err(e) => {
				tracing::debug!(
					generation = output.generation(),
					stream = %output.stream(),
					error = %e,
					"output pump stopped"
				);
				break;
			}
		}
	}
	output.close().await;
}
