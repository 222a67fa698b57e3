//! Client-side tunnel binary (§6): accepts the local OpenFlow/OVSDB traffic and forwards it as
//! QUIC streams to a remote `qsdn-server`.

use clap::Parser;

use qsdn_quic::tunnel::{self, Cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let mode = match tunnel::cli::prompt_mode() {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("qsdn-client: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = tunnel::run(true, cli, mode).await {
        eprintln!("qsdn-client: {err}");
        std::process::exit(1);
    }
}
