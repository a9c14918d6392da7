use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::{client::ClientConfig, host::HostConfig, transport::ConnectionInfo};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and broadcast every line read from stdin.
    ///
    /// The host stops when stdin closes unless `--keep-running` is given.
    Host(HostArgs),
    /// Connect to a host and print every line it broadcasts.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HostArgs {
    /// Where to listen: `tcp://host:port`, `unix:///path` or a bare socket path.
    #[arg(long, default_value = "tcp://127.0.0.1:5000")]
    pub listen: ConnectionInfo,

    /// Per-client write deadline in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub write_timeout_ms: u64,

    /// Exit with an error if nothing is broadcast for this many seconds.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Keep serving after stdin closes; only Ctrl-C stops the host.
    #[arg(long)]
    pub keep_running: bool,
}

impl HostArgs {
    pub fn config(&self) -> HostConfig {
        HostConfig {
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            ..HostConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host to dial, in the same forms accepted by `--listen`.
    #[arg(long, default_value = "tcp://127.0.0.1:5000")]
    pub connect: ConnectionInfo,

    /// Seconds to wait between failed connection attempts.
    #[arg(long, default_value_t = 5)]
    pub retry_secs: u64,
}

impl ClientArgs {
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            retry_interval: Duration::from_secs(self.retry_secs),
            ..ClientConfig::default()
        }
    }
}
