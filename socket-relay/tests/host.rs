use std::time::Duration;

use anyhow::Result;
use socket_relay::{
    ConnectionInfo, Host, HostConfig, RelayError, Transport, peer::Peer, registry::RegistryHandle,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader},
    net::{TcpStream, UnixStream},
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn tcp_peers_receive_every_broadcast() -> Result<()> {
    let host = Host::bind(&ConnectionInfo::tcp("127.0.0.1:0")).await?;
    let addr = host.local_info()?;
    let sender = host.sender();
    let peers = host.peers();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(host.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    let mut alice = BufReader::new(TcpStream::connect(addr.address()).await?);
    let mut bob = BufReader::new(TcpStream::connect(addr.address()).await?);
    wait_for_peers(&peers, 2).await?;

    sender.send("hello").await?;
    sender.send("already terminated\n").await?;

    for reader in [&mut alice, &mut bob] {
        assert_eq!(read_line(reader).await?.as_deref(), Some("hello\n"));
        assert_eq!(
            read_line(reader).await?.as_deref(),
            Some("already terminated\n")
        );
    }

    let _ = shutdown_tx.send(());
    timeout(WAIT, server).await???;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_every_peer() -> Result<()> {
    let host = Host::bind(&ConnectionInfo::tcp("127.0.0.1:0")).await?;
    let addr = host.local_info()?;
    let peers = host.peers();
    let stop = host.shutdown_token();
    let server = tokio::spawn(host.run());

    let mut reader = BufReader::new(TcpStream::connect(addr.address()).await?);
    wait_for_peers(&peers, 1).await?;

    stop.cancel();
    timeout(WAIT, server).await???;

    assert_eq!(read_line(&mut reader).await?, None);
    assert!(matches!(
        peers.snapshot().await,
        Err(RelayError::Closed("peers"))
    ));
    Ok(())
}

#[tokio::test]
async fn sending_after_shutdown_fails() -> Result<()> {
    let host = Host::bind(&ConnectionInfo::tcp("127.0.0.1:0")).await?;
    let sender = host.sender();
    let stop = host.shutdown_token();
    stop.cancel();
    timeout(WAIT, host.run()).await??;

    assert!(matches!(
        sender.send("too late").await,
        Err(RelayError::Closed("host"))
    ));
    Ok(())
}

#[tokio::test]
async fn unix_host_replaces_stale_file_and_cleans_up() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("relay.sock");
    std::fs::write(&path, b"left over from a crashed run")?;

    let host = Host::bind(&ConnectionInfo::unix(&path)).await?;
    assert_eq!(host.local_info()?, ConnectionInfo::unix(&path));
    let sender = host.sender();
    let peers = host.peers();
    let stop = host.shutdown_token();
    let server = tokio::spawn(host.run());

    let mut reader = BufReader::new(UnixStream::connect(&path).await?);
    wait_for_peers(&peers, 1).await?;
    sender.send("over unix").await?;
    assert_eq!(read_line(&mut reader).await?.as_deref(), Some("over unix\n"));

    stop.cancel();
    timeout(WAIT, server).await???;
    assert!(!path.exists(), "socket file should be removed on shutdown");
    Ok(())
}

#[tokio::test]
async fn bind_failures_are_reported() -> Result<()> {
    let first = Host::bind(&ConnectionInfo::tcp("127.0.0.1:0")).await?;
    let taken = first.local_info()?;
    let err = Host::bind(&taken).await.err().expect("port already bound");
    assert!(matches!(
        err,
        RelayError::Bind {
            transport: Transport::Tcp,
            ..
        }
    ));

    let dir = tempfile::tempdir()?;
    let unreachable = dir.path().join("missing").join("relay.sock");
    let err = Host::bind(&ConnectionInfo::unix(&unreachable))
        .await
        .err()
        .expect("parent directory does not exist");
    assert!(matches!(
        err,
        RelayError::Bind {
            transport: Transport::Unix,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn idle_host_fails_with_watchdog_error() -> Result<()> {
    let config = HostConfig {
        idle_timeout: Some(Duration::from_millis(200)),
        ..HostConfig::default()
    };
    let host = Host::bind_with_config(&ConnectionInfo::tcp("127.0.0.1:0"), config).await?;
    let _sender = host.sender();

    let result = timeout(WAIT, host.run()).await?;
    assert!(matches!(result, Err(RelayError::Idle(_))));
    Ok(())
}

#[tokio::test]
async fn externally_added_peer_joins_the_broadcast() -> Result<()> {
    let host = Host::bind(&ConnectionInfo::tcp("127.0.0.1:0")).await?;
    let sender = host.sender();
    let peers = host.peers();
    let stop = host.shutdown_token();
    let server = tokio::spawn(host.run());

    let (writer, mut reader) = tokio::io::duplex(64);
    let manual = Peer::new("in-memory", writer);
    peers.add(manual.clone()).await?;

    sender.send("ping").await?;
    let mut buf = [0u8; 5];
    timeout(WAIT, reader.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"ping\n");

    peers.remove(manual.clone()).await?;
    wait_for_peers(&peers, 0).await?;
    assert!(manual.is_closed().await);

    stop.cancel();
    timeout(WAIT, server).await???;
    Ok(())
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

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes = timeout(WAIT, reader.read_line(&mut line)).await??;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}
