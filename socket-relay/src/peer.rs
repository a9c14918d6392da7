use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
    time::timeout,
};
use tracing::debug;

use crate::registry::Member;

pub type PeerId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Longest a close may spend flushing and shutting down the writer. The
/// writer is dropped once it passes.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// One connection accepted by a [`Host`](crate::host::Host).
///
/// Clones share the same socket. The writer is taken out on the first
/// [`close`](Peer::close), after which every send fails with
/// `NotConnected`.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    id: PeerId,
    label: String,
    writer: Mutex<Option<BoxedWriter>>,
}

impl Peer {
    pub fn new<W>(label: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(PeerInner {
                id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                writer: Mutex::new(Some(Box::new(writer))),
            }),
        }
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Writes and flushes `frame`, giving up once `deadline` has passed.
    ///
    /// The deadline covers waiting for a concurrent close as well as the
    /// write itself.
    pub async fn send(&self, frame: &[u8], deadline: Duration) -> io::Result<()> {
        let attempt = async {
            let mut writer = self.inner.writer.lock().await;
            let writer = writer
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "peer is closed"))?;
            writer.write_all(frame).await?;
            writer.flush().await
        };

        match timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write did not complete within {deadline:?}"),
            )),
        }
    }

    /// Shuts the socket down, giving up after [`CLOSE_TIMEOUT`]. Returns
    /// `false` if it was already closed.
    pub async fn close(&self) -> bool {
        let Some(mut writer) = self.inner.writer.lock().await.take() else {
            return false;
        };

        match timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!(peer = %self.label(), ?error, "peer shutdown failed"),
            Err(_) => debug!(peer = %self.label(), "peer shutdown timed out, dropping writer"),
        }
        true
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.writer.lock().await.is_none()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .finish()
    }
}

impl Member for Peer {
    fn same_as(&self, other: &Self) -> bool {
        self.id() == other.id()
    }

    async fn release(&self) {
        if self.close().await {
            debug!(peer = %self.label(), "peer closed");
        }
    }
}
