//! Server-side tunnel binary (§6): accepts a `qsdn-client`'s QUIC connection and re-injects its
//! streams into the local OpenFlow controller / OVSDB database sockets.

use clap::Parser;

use qsdn_quic::tunnel::{self, Cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let mode = match tunnel::cli::prompt_mode() {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("qsdn-server: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = tunnel::run(false, cli, mode).await {
        eprintln!("qsdn-server: {err}");
        std::process::exit(1);
    }
}
