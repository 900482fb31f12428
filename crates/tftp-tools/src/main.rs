//! tftpd - TFTP server executable
//!
//! Serves files below a root directory to `tftp get` and stores files sent with `tftp put`.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{DirStore, DispatchMode, LockPolicy, TftpServer, TftpServerConfig};
use tftp_tools::{init_tracing, transfer_config};

const DEFAULT_ROOT: &str = "./tftp_root";

#[derive(FromArgs, Debug)]
#[argh(
    description = "tftpd - lockstep TFTP server",
    example = "Serve ./tftp_root on port 6969:\n  {command_name} 6969",
    example = "One transfer at a time:\n  {command_name} 6969 --mode serial",
    example = "Loopback only, custom root:\n  {command_name} 6969 --bind 127.0.0.1 --root /srv/tftp"
)]
struct CliConfig {
    #[argh(positional, description = "UDP port to listen on")]
    port: u16,

    #[argh(option, short = 'b', description = "address to bind", default = "\"0.0.0.0\".to_string()")]
    bind: String,

    #[argh(
        option,
        short = 'r',
        description = "directory files are served from and stored to",
        default = "PathBuf::from(DEFAULT_ROOT)"
    )]
    root: PathBuf,

    #[argh(
        option,
        short = 'm',
        description = "dispatch mode: threaded or serial",
        default = "DispatchMode::Threaded"
    )]
    mode: DispatchMode,

    #[argh(option, short = 't', description = "seconds to wait before retransmitting", default = "5.0")]
    timeout: f64,

    #[argh(option, description = "timeouts on one block before giving up", default = "5")]
    retries: usize,

    #[argh(option, description = "concurrent transfers (threaded mode)", default = "64")]
    max_sessions: usize,

    #[argh(
        option,
        description = "store locking: global or per-resource (threaded mode)",
        default = "LockPolicy::PerResource"
    )]
    lock_policy: LockPolicy,
}

impl CliConfig {
    fn into_server_config(self) -> Result<(TftpServerConfig, PathBuf)> {
        let ip: IpAddr = self
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.bind))?;
        if self.max_sessions == 0 {
            anyhow::bail!("--max-sessions must be at least 1");
        }

        let config = TftpServerConfig {
            bind_address: SocketAddr::new(ip, self.port).to_string(),
            dispatch: self.mode,
            transfer: transfer_config(self.timeout, self.retries)?,
            lock_policy: self.lock_policy,
            max_sessions: self.max_sessions,
            local_bind: (!ip.is_unspecified()).then_some(ip),
        };
        Ok((config, self.root))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli_config: CliConfig = argh::from_env();
    let (config, root) = cli_config.into_server_config()?;

    if !root.is_dir() {
        anyhow::bail!("Root directory {} does not exist", root.display());
    }
    tracing::info!("Serving files from {}", root.display());

    let server = TftpServer::bind(config, DirStore::new(root)).await?;
    server.serve().await
}
