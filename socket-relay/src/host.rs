use std::{future::Future, io, time::Duration};

use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinSet,
    time::{Instant, interval, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::RelayError,
    framer::encode_line,
    peer::Peer,
    registry::{RegistryHandle, registry},
    transport::{ConnectionInfo, Listener},
};

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);
const WATCHDOG_TICK: Duration = Duration::from_millis(100);

// errno values shared by Linux and the BSDs.
const ENOMEM: i32 = 12;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Per-peer deadline for writing one message.
    pub write_timeout: Duration,
    /// Fail the host when no message has been broadcast for this long.
    pub idle_timeout: Option<Duration>,
    /// Outbound messages buffered before [`HostSender::send`] waits.
    pub outbound_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(1),
            idle_timeout: None,
            outbound_capacity: 1,
        }
    }
}

/// Accepts connections and broadcasts lines to every one of them.
///
/// [`Host::bind`] claims the socket; [`Host::run`] (or one of the
/// `run_until` variants) drives the accept, registry and broadcast loops
/// until the shutdown token is cancelled. Shutting down closes the
/// listener and every accepted peer.
pub struct Host {
    listener: Listener,
    config: HostConfig,
    peers: RegistryHandle<Peer>,
    registry_task: tokio::task::JoinHandle<()>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
}

/// Queues messages for broadcast.
#[derive(Debug, Clone)]
pub struct HostSender {
    tx: mpsc::Sender<String>,
}

impl HostSender {
    /// Queues one message. A trailing `\n` is added on the way out if the
    /// message lacks one.
    pub async fn send(&self, message: impl Into<String>) -> Result<(), RelayError> {
        self.tx
            .send(message.into())
            .await
            .map_err(|_| RelayError::Closed("host"))
    }
}

impl Host {
    pub async fn bind(info: &ConnectionInfo) -> Result<Self, RelayError> {
        Self::bind_with_config(info, HostConfig::default()).await
    }

    /// Binds the listener and starts the peer registry.
    ///
    /// For Unix sockets anything already at the path is removed first.
    pub async fn bind_with_config(
        info: &ConnectionInfo,
        config: HostConfig,
    ) -> Result<Self, RelayError> {
        let listener = Listener::bind(info).await?;
        let shutdown = CancellationToken::new();

        let (peers, registry) = registry("peers");
        let registry_task = tokio::spawn(registry.run(shutdown.clone()));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));

        info!(address = %info, "host bound");
        Ok(Self {
            listener,
            config,
            peers,
            registry_task,
            outbound_tx,
            outbound_rx,
            shutdown,
        })
    }

    /// Address actually bound, with any port 0 resolved.
    pub fn local_info(&self) -> io::Result<ConnectionInfo> {
        self.listener.local_info()
    }

    pub fn sender(&self) -> HostSender {
        HostSender {
            tx: self.outbound_tx.clone(),
        }
    }

    /// Add/remove surface of the connected peer set.
    pub fn peers(&self) -> RegistryHandle<Peer> {
        self.peers.clone()
    }

    /// Cancelling the token stops the host.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until shutdown is requested or a loop fails fatally.
    ///
    /// Fatal conditions are an accept error that is not transient and,
    /// when configured, the idle timeout. Either one stops every loop and
    /// is returned.
    pub async fn run(self) -> Result<(), RelayError> {
        let Host {
            listener,
            config,
            peers,
            registry_task,
            outbound_tx,
            outbound_rx,
            shutdown,
        } = self;
        // Only callers' senders keep the outbound queue open.
        drop(outbound_tx);

        let (activity_tx, activity_rx) = watch::channel(Instant::now());
        let mut tasks = JoinSet::new();
        tasks.spawn(accept_loop(listener, peers.clone(), shutdown.clone()));
        tasks.spawn(broadcast_loop(
            outbound_rx,
            peers,
            activity_tx,
            config.write_timeout,
            shutdown.clone(),
        ));
        if let Some(idle_timeout) = config.idle_timeout {
            tasks.spawn(liveness_watchdog(activity_rx, idle_timeout, shutdown.clone()));
        }

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    shutdown.cancel();
                    if outcome.is_ok() {
                        outcome = Err(err);
                    }
                }
                Err(err) => {
                    error!(error = ?err, "host task panicked");
                    shutdown.cancel();
                }
            }
        }

        // Loops are gone; the registry closes whatever peers are left.
        shutdown.cancel();
        if let Err(err) = registry_task.await {
            error!(error = ?err, "peer registry panicked");
        }

        info!("host stopped");
        outcome
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send,
    {
        let token = self.shutdown.clone();
        let run = self.run();
        tokio::pin!(run, shutdown);

        select! {
            result = &mut run => return result,
            _ = &mut shutdown => {
                info!("host shutting down");
                token.cancel();
            }
        }

        run.await
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), RelayError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

async fn accept_loop(
    listener: Listener,
    peers: RegistryHandle<Peer>,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let mut backoff = ACCEPT_BACKOFF_START;

    loop {
        let accepted = select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, label)) => {
                backoff = ACCEPT_BACKOFF_START;
                info!(peer = %label, "peer connected");
                if peers.add(Peer::new(label, stream)).await.is_err() {
                    break;
                }
            }
            Err(err) if is_transient(&err) => {
                warn!(error = ?err, retry_in = ?backoff, "transient accept failure");
                select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
            }
            Err(err) => {
                error!(error = ?err, "accept failed");
                return Err(RelayError::Accept(err));
            }
        }
    }

    debug!("accept loop stopped");
    Ok(())
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) || matches!(err.raw_os_error(), Some(ENOMEM | ENFILE | EMFILE))
}

async fn broadcast_loop(
    mut outbound: mpsc::Receiver<String>,
    peers: RegistryHandle<Peer>,
    activity: watch::Sender<Instant>,
    write_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    loop {
        let message = select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => {
                    debug!("every host sender dropped");
                    break;
                }
            },
        };
        activity.send_replace(Instant::now());

        let Ok(targets) = peers.snapshot().await else {
            break;
        };
        if deliver(&message, &targets, &peers, write_timeout)
            .await
            .is_err()
        {
            break;
        }
    }

    debug!("broadcast loop stopped");
    Ok(())
}

/// Writes `message` to each target in order and evicts the ones that fail.
/// Returns how many peers got it.
async fn deliver(
    message: &str,
    targets: &[Peer],
    peers: &RegistryHandle<Peer>,
    write_timeout: Duration,
) -> Result<usize, RelayError> {
    let frame = encode_line(message);
    let mut delivered = 0;

    for peer in targets {
        match peer.send(frame.as_bytes(), write_timeout).await {
            Ok(()) => delivered += 1,
            Err(err) => {
                warn!(peer = %peer.label(), error = ?err, "dropping unreachable peer");
                peers.remove(peer.clone()).await?;
            }
        }
    }

    trace!(delivered, total = targets.len(), "broadcast complete");
    Ok(delivered)
}

async fn liveness_watchdog(
    activity: watch::Receiver<Instant>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let mut ticker = interval(WATCHDOG_TICK);

    loop {
        select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let idle = activity.borrow().elapsed();
        if idle > idle_timeout {
            error!(?idle, "no message broadcast within the idle timeout");
            return Err(RelayError::Idle(idle_timeout));
        }
    }
}
