use clap::Parser;
use di4108_rs::{Di4108Connector, PulseServer, ServerConfig};
use std::net::TcpListener;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Serve triggered DI-4108 pulse acquisitions over TCP.
#[derive(Debug, Parser)]
#[command(name = "di4108-server", version, about)]
struct Args {
    /// Address to listen on. 4220 is the conventional site-0 control port.
    #[arg(long, default_value = "0.0.0.0:4220")]
    listen: String,

    /// Serial port of the instrument; autodetected by USB id when omitted.
    #[arg(long)]
    device: Option<String>,

    /// Socket read/write timeout in seconds.
    #[arg(long, default_value_t = 30)]
    io_timeout: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let device = args.device.clone();
    let port_key = device.clone().unwrap_or_else(|| "di4108".to_string());
    let opener = Arc::new(move || Di4108Connector::connect(device.as_deref()));

    let server = Arc::new(PulseServer::new(
        port_key,
        opener,
        ServerConfig {
            io_timeout: Duration::from_secs(args.io_timeout),
            ..ServerConfig::default()
        },
    ));

    let listener = match TcpListener::bind(&args.listen) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {}: {e}", args.listen);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.serve(listener) {
        tracing::error!("server stopped: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
