use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use socket_relay::{
    Client, ClientConfig, ConnectionInfo, HandlerRef, Host, HostSender, RelayError, peer::Peer,
    registry::RegistryHandle,
};
use tokio::{
    sync::mpsc::{UnboundedReceiver, unbounded_channel},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(3);

struct RunningHost {
    info: ConnectionInfo,
    sender: HostSender,
    peers: RegistryHandle<Peer>,
    stop: CancellationToken,
    task: JoinHandle<Result<(), RelayError>>,
}

impl RunningHost {
    async fn start(info: &ConnectionInfo) -> Result<Self> {
        let host = Host::bind(info).await?;
        Ok(Self {
            info: host.local_info()?,
            sender: host.sender(),
            peers: host.peers(),
            stop: host.shutdown_token(),
            task: tokio::spawn(host.run()),
        })
    }

    async fn shutdown(self) -> Result<()> {
        self.stop.cancel();
        timeout(WAIT, self.task).await???;
        Ok(())
    }
}

struct RunningClient {
    lines: UnboundedReceiver<String>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningClient {
    async fn start(info: &ConnectionInfo) -> Result<Self> {
        let config = ClientConfig {
            retry_interval: Duration::from_millis(20),
            ..ClientConfig::default()
        };
        let client = Client::with_config(info.clone(), config);

        let (tx, lines) = unbounded_channel();
        let handler: HandlerRef = Arc::new(move |message: &str| {
            let _ = tx.send(message.to_string());
        });
        client.handlers().add(handler).await?;

        Ok(Self {
            lines,
            stop: client.shutdown_token(),
            task: tokio::spawn(client.run()),
        })
    }

    async fn next_line(&mut self) -> Result<String> {
        timeout(WAIT, self.lines.recv())
            .await
            .context("timed out waiting for a line")?
            .ok_or_else(|| anyhow!("handler channel closed"))
    }

    async fn shutdown(self) -> Result<()> {
        self.stop.cancel();
        timeout(WAIT, self.task).await??;
        Ok(())
    }
}

#[tokio::test]
async fn client_handler_receives_tcp_broadcast() -> Result<()> {
    let host = RunningHost::start(&ConnectionInfo::tcp("127.0.0.1:0")).await?;
    let mut client = RunningClient::start(&host.info).await?;
    wait_for_peers(&host.peers, 1).await?;

    host.sender.send("hello").await?;
    assert_eq!(client.next_line().await?, "hello");

    // Embedded delimiters are not escaped; the client sees two lines.
    host.sender.send("a\nb").await?;
    assert_eq!(client.next_line().await?, "a");
    assert_eq!(client.next_line().await?, "b");

    client.shutdown().await?;
    host.shutdown().await
}

#[tokio::test]
async fn client_handler_receives_unix_broadcast() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let info = ConnectionInfo::unix(dir.path().join("relay.sock"));
    let host = RunningHost::start(&info).await?;
    let mut client = RunningClient::start(&host.info).await?;
    wait_for_peers(&host.peers, 1).await?;

    host.sender.send("over a unix socket").await?;
    assert_eq!(client.next_line().await?, "over a unix socket");

    client.shutdown().await?;
    host.shutdown().await
}

#[tokio::test]
async fn every_client_receives_each_message_once() -> Result<()> {
    let host = RunningHost::start(&ConnectionInfo::tcp("127.0.0.1:0")).await?;
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(RunningClient::start(&host.info).await?);
    }
    wait_for_peers(&host.peers, 3).await?;

    for message in ["one", "two", "three"] {
        host.sender.send(message).await?;
    }
    for client in &mut clients {
        for expected in ["one", "two", "three"] {
            assert_eq!(client.next_line().await?, expected);
        }
        assert!(client.lines.try_recv().is_err(), "no duplicate deliveries");
    }

    for client in clients {
        client.shutdown().await?;
    }
    host.shutdown().await
}

#[tokio::test]
async fn client_reconnects_after_forced_disconnect() -> Result<()> {
    let host = RunningHost::start(&ConnectionInfo::tcp("127.0.0.1:0")).await?;
    let mut client = RunningClient::start(&host.info).await?;
    let original = wait_for_peers(&host.peers, 1).await?.remove(0);

    host.sender.send("before").await?;
    assert_eq!(client.next_line().await?, "before");

    // Evicting the peer closes the socket underneath the client.
    host.peers.remove(original.clone()).await?;
    let replacement = timeout(WAIT, async {
        loop {
            let peers = host.peers.snapshot().await?;
            if let Some(peer) = peers.into_iter().find(|peer| peer.id() != original.id()) {
                return Ok::<_, RelayError>(peer);
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await??;
    assert!(original.is_closed().await);
    assert!(!replacement.is_closed().await);

    host.sender.send("after").await?;
    assert_eq!(client.next_line().await?, "after");

    client.shutdown().await?;
    host.shutdown().await
}

#[tokio::test]
async fn client_started_before_host_connects_once_it_binds() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let info = ConnectionInfo::unix(dir.path().join("late.sock"));
    let mut client = RunningClient::start(&info).await?;

    // Let a few dial attempts fail first.
    sleep(Duration::from_millis(100)).await;
    let host = RunningHost::start(&info).await?;
    wait_for_peers(&host.peers, 1).await?;

    host.sender.send("finally").await?;
    assert_eq!(client.next_line().await?, "finally");

    client.shutdown().await?;
    host.shutdown().await
}

async fn wait_for_peers(peers: &RegistryHandle<Peer>, count: usize) -> Result<Vec<Peer>> {
    let snapshot = timeout(WAIT, async {
        loop {
            let snapshot = peers.snapshot().await?;
            if snapshot.len() == count {
                return Ok::<_, RelayError>(snapshot);
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await??;
    Ok(snapshot)
}
