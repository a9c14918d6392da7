use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    io::AsyncReadExt,
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    framer::LineFramer,
    registry::{Member, RegistryHandle, registry},
    transport::{ConnectionInfo, Dialer},
};

/// Consumer of decoded lines.
///
/// Called from the dispatch loop with the delimiter already stripped. Any
/// `Fn(&str)` closure is a handler.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: &str);
}

impl<F> Handler for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn handle(&self, message: &str) {
        self(message)
    }
}

/// Registered handler. Two refs are the same registration when they point
/// at the same allocation.
pub type HandlerRef = Arc<dyn Handler>;

impl Member for HandlerRef {
    fn same_as(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(self), Arc::as_ptr(other))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Fixed pause between failed dial attempts.
    pub retry_interval: Duration,
    /// Largest single read from the socket.
    pub read_chunk: usize,
    /// Upper bound on one handler call. `None` runs handlers inline on the
    /// dispatch task, where a panic stops dispatching altogether.
    pub handler_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            read_chunk: 512,
            handler_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Dials a host, keeps the connection alive and hands every received line
/// to the registered handlers.
///
/// The handler registry starts with the client, so handlers can be added
/// through [`Client::handlers`] before [`Client::run`] is called.
pub struct Client<D: Dialer = ConnectionInfo> {
    dialer: D,
    config: ClientConfig,
    handlers: RegistryHandle<HandlerRef>,
    registry_task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl<D: Dialer> Client<D> {
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(dialer: D) -> Self {
        Self::with_config(dialer, ClientConfig::default())
    }

    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(dialer: D, config: ClientConfig) -> Self {
        let shutdown = CancellationToken::new();
        let (handlers, registry) = registry("handlers");
        let registry_task = tokio::spawn(registry.run(shutdown.clone()));

        Self {
            dialer,
            config,
            handlers,
            registry_task,
            shutdown,
        }
    }

    /// Add/remove surface of the handler set.
    pub fn handlers(&self) -> RegistryHandle<HandlerRef> {
        self.handlers.clone()
    }

    /// Cancelling the token closes the connection and stops every loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Dials until it works. Returns `None` only if shutdown is requested
    /// first.
    pub async fn connect(&self) -> Option<D::Stream> {
        connect(&self.dialer, self.config.retry_interval, &self.shutdown).await
    }

    /// Connects, then receives and dispatches until shutdown.
    pub async fn run(self) {
        let Client {
            dialer,
            config,
            handlers,
            registry_task,
            shutdown,
        } = self;

        info!(host = %dialer.label(), "starting client");
        let Some(stream) = connect(&dialer, config.retry_interval, &shutdown).await else {
            join_task(registry_task, "handler registry").await;
            return;
        };
        info!(host = %dialer.label(), "connection established");

        let (line_tx, line_rx) = mpsc::channel(1);
        let dispatch = tokio::spawn(dispatch_loop(
            line_rx,
            handlers,
            config.handler_timeout,
            shutdown.clone(),
        ));
        let receive = tokio::spawn(receive_loop(
            stream,
            dialer,
            line_tx,
            config,
            shutdown.clone(),
        ));

        join_task(receive, "receive loop").await;
        // Dispatch and the registry only stop on cancellation.
        shutdown.cancel();
        join_task(dispatch, "dispatch loop").await;
        join_task(registry_task, "handler registry").await;
        info!("client stopped");
    }

    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let token = self.shutdown.clone();
        let run = self.run();
        tokio::pin!(run, shutdown);

        select! {
            _ = &mut run => return,
            _ = &mut shutdown => {
                info!("client shutting down");
                token.cancel();
            }
        }

        run.await;
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await;
    }
}

async fn join_task(task: JoinHandle<()>, name: &'static str) {
    if let Err(err) = task.await {
        error!(task = name, error = ?err, "client task panicked");
    }
}

async fn connect<D: Dialer>(
    dialer: &D,
    retry_interval: Duration,
    shutdown: &CancellationToken,
) -> Option<D::Stream> {
    loop {
        let attempt = select! {
            _ = shutdown.cancelled() => return None,
            attempt = dialer.dial() => attempt,
        };

        match attempt {
            Ok(stream) => return Some(stream),
            Err(err) => {
                warn!(host = %dialer.label(), error = ?err, retry_in = ?retry_interval, "failed to dial");
            }
        }

        select! {
            _ = shutdown.cancelled() => return None,
            _ = sleep(retry_interval) => {}
        }
    }
}

/// Reads chunks, decodes them into lines and queues the lines for
/// dispatch. A read error or end of stream drops the connection and dials
/// again; the framer keeps any partial line across the switch.
async fn receive_loop<D: Dialer>(
    mut stream: D::Stream,
    dialer: D,
    lines: mpsc::Sender<String>,
    config: ClientConfig,
    shutdown: CancellationToken,
) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; config.read_chunk.max(1)];

    loop {
        let read = select! {
            _ = shutdown.cancelled() => break,
            read = stream.read(&mut buf) => read,
        };

        let count = match read {
            Ok(0) => {
                warn!(host = %dialer.label(), "connection closed by host, reconnecting");
                None
            }
            Ok(count) => Some(count),
            Err(err) => {
                warn!(host = %dialer.label(), error = ?err, "read failed, reconnecting");
                None
            }
        };

        let Some(count) = count else {
            drop(stream);
            match connect(&dialer, config.retry_interval, &shutdown).await {
                Some(fresh) => {
                    info!(host = %dialer.label(), "reconnected");
                    stream = fresh;
                    continue;
                }
                None => break,
            }
        };

        for line in framer.push(&buf[..count]) {
            select! {
                _ = shutdown.cancelled() => return,
                sent = lines.send(line) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    debug!("receive loop stopped");
}

async fn dispatch_loop(
    mut lines: mpsc::Receiver<String>,
    handlers: RegistryHandle<HandlerRef>,
    handler_timeout: Option<Duration>,
    shutdown: CancellationToken,
) {
    let mut overrun = Overrun::default();

    loop {
        let line = select! {
            biased;
            _ = shutdown.cancelled() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let Ok(targets) = handlers.snapshot().await else {
            break;
        };
        overrun.reap();
        for handler in targets {
            if overrun.contains(&handler) {
                debug!("handler still busy with an earlier line, skipping");
                continue;
            }
            if let Some(call) = call_handler(&handler, &line, handler_timeout).await {
                overrun.push(handler, call);
            }
        }
    }

    debug!("dispatch loop stopped");
}

/// Handler calls that outlived their timeout and still hold a blocking
/// thread. Their handlers get no new lines until the call returns, so a
/// hung handler pins one thread instead of one per line.
#[derive(Default)]
struct Overrun {
    calls: Vec<(HandlerRef, JoinHandle<()>)>,
}

impl Overrun {
    fn reap(&mut self) {
        self.calls.retain(|(_, call)| !call.is_finished());
    }

    fn contains(&self, handler: &HandlerRef) -> bool {
        self.calls.iter().any(|(busy, _)| busy.same_as(handler))
    }

    fn push(&mut self, handler: HandlerRef, call: JoinHandle<()>) {
        self.calls.push((handler, call));
    }
}

/// Runs one handler call. Returns the still-running call when it overran
/// `handler_timeout`.
async fn call_handler(
    handler: &HandlerRef,
    line: &str,
    handler_timeout: Option<Duration>,
) -> Option<JoinHandle<()>> {
    let Some(limit) = handler_timeout else {
        handler.handle(line);
        return None;
    };

    let message = line.to_owned();
    let target = Arc::clone(handler);
    let mut call = tokio::task::spawn_blocking(move || target.handle(&message));
    match timeout(limit, &mut call).await {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            warn!(error = ?err, "handler panicked");
            None
        }
        Err(_) => {
            warn!(?limit, "handler did not return in time, moving on");
            Some(call)
        }
    }
}
