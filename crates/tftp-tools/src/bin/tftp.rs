//! tftp - TFTP client executable

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::TftpClient;
use tftp_tools::{init_tracing, local_store, transfer_config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Get,
    Put,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "put" => Ok(Self::Put),
            _ => Err(format!("Unknown command '{}', expected get or put", s)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "get"),
            Self::Put => write!(f, "put"),
        }
    }
}

#[derive(FromArgs, Debug)]
#[argh(
    description = "tftp - download or upload one file over TFTP",
    example = "Download boot.img into the current directory:\n  {command_name} get 10.0.1.50 6969 boot.img",
    example = "Upload a file under another local path:\n  {command_name} put 10.0.1.50 6969 report.txt --local ./out/report.txt"
)]
struct CliConfig {
    #[argh(positional, description = "get or put")]
    direction: Direction,

    #[argh(positional, description = "server IP address")]
    server: String,

    #[argh(positional, description = "server port")]
    port: u16,

    #[argh(positional, description = "name of the file on the server")]
    filename: String,

    #[argh(option, short = 'l', description = "local file path (defaults to the remote file name)")]
    local: Option<PathBuf>,

    #[argh(option, short = 't', description = "seconds to wait before retransmitting", default = "5.0")]
    timeout: f64,

    #[argh(option, description = "timeouts on one block before giving up", default = "5")]
    retries: usize,
}

impl CliConfig {
    fn server_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .parse()
            .with_context(|| format!("Invalid server address: {}", self.server))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    fn local_path(&self) -> PathBuf {
        self.local.clone().unwrap_or_else(|| PathBuf::from(&self.filename))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli: CliConfig = argh::from_env();
    let client = TftpClient::new(cli.server_addr()?, transfer_config(cli.timeout, cli.retries)?);
    let local_path = cli.local_path();
    let (store, local) = local_store(&local_path)?;

    let summary = match cli.direction {
        Direction::Get => client.get(&store, &cli.filename, &local).await,
        Direction::Put => client.put(&store, &local, &cli.filename).await,
    }
    .with_context(|| format!("{} '{}' failed", cli.direction, cli.filename))?;

    tracing::info!("{} '{}' done: {}", cli.direction, cli.filename, summary);
    Ok(())
}
