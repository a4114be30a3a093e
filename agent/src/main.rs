use anyhow::Result;
use clap::Parser;

mod connection;
mod forward;

#[derive(Parser)]
#[command(name = "porthole")]
#[command(author = "Porthole Team")]
#[command(version = "0.1.0")]
#[command(about = "Expose a local HTTP service through a porthole relay", long_about = None)]
struct Cli {
    /// Remote relay hostname
    remote_host: String,

    /// Local port requests are forwarded to
    local_port: u16,

    /// Connect to an insecure local relay (ws://host:8008) instead of the
    /// production endpoint (wss://host:443)
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let relay_uri = relay_uri(&cli.remote_host, cli.debug);
    let base_target_url = format!("http://127.0.0.1:{}", cli.local_port);

    connection::run(&relay_uri, base_target_url).await
}

fn relay_uri(remote_host: &str, debug: bool) -> String {
    if debug {
        format!("ws://{}:8008/tunnel", remote_host)
    } else {
        format!("wss://{}:443/tunnel", remote_host)
    }
}
