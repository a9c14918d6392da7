use std::{io::Write, sync::Arc};

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use socket_relay::{
    cli::{Cli, ClientArgs, Command, HostArgs},
    client::{Client, Handler, HandlerRef},
    host::{Host, HostSender},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stdout carries received lines in client mode, so logs go to stderr.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Host(args) => run_host(args).await?,
        Command::Client(args) => run_client(args).await?,
    }

    Ok(())
}

async fn run_host(args: HostArgs) -> Result<()> {
    let host = Host::bind_with_config(&args.listen, args.config()).await?;
    info!("host listening on {}", host.local_info()?);

    let stop_on_eof = (!args.keep_running).then(|| host.shutdown_token());
    let pump = tokio::spawn(forward_stdin(host.sender(), stop_on_eof));
    let result = host.run_until_ctrl_c().await;
    pump.abort();

    if let Err(err) = &result {
        warn!("host exited with error: {err:?}");
    }
    Ok(result?)
}

/// Broadcasts stdin line by line. Cancels `stop_on_eof`, if given, once
/// stdin closes.
async fn forward_stdin(sender: HostSender, stop_on_eof: Option<CancellationToken>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if sender.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = ?err, "failed to read stdin");
                break;
            }
        }
    }
    match stop_on_eof {
        Some(shutdown) => shutdown.cancel(),
        None => info!("stdin closed, host keeps running until ctrl-c"),
    }
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let config = args.config();
    let client = Client::with_config(args.connect, config);
    let printer: HandlerRef = Arc::new(StdoutHandler);
    client.handlers().add(printer).await?;
    client.run_until_ctrl_c().await;
    Ok(())
}

struct StdoutHandler;

impl Handler for StdoutHandler {
    fn handle(&self, message: &str) {
        let mut stdout = std::io::stdout().lock();
        if let Err(err) = writeln!(stdout, "{message}").and_then(|()| stdout.flush()) {
            warn!(error = ?err, "failed to write to stdout");
        }
    }
}
