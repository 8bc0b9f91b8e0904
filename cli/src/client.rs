//! The `utkc` echo client CLI: connects to a `utks` server, sends one message
//! reliably, and prints whatever comes back.

use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;

use udp_toolkit::{Network, NetworkConfig};

#[derive(Parser)]
#[command(name = "utkc", version, about = "Run a udp-toolkit echo client")]
struct Args {
    /// Server host to connect to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to connect to.
    #[arg(long)]
    port: u16,
    /// Message to send once connected.
    #[arg(long, default_value = "hello")]
    message: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut network = match Network::new(
        |_conn, _info| false,
        |conn, reason| {
            tracing::info!(addr = %conn.endpoint(), ?reason, "connection closed");
        },
        NetworkConfig::default(),
    ) {
        Ok(network) => network,
        Err(error) => {
            eprintln!("failed to bind: {error}");
            return ExitCode::FAILURE;
        }
    };

    let start = Instant::now();
    let now = start.elapsed().as_millis() as u64;

    let server_addr = match network.connect(&args.host, args.port, now) {
        Ok(addr) => addr,
        Err(error) => {
            eprintln!("failed to resolve {}:{}: {error}", args.host, args.port);
            return ExitCode::FAILURE;
        }
    };

    let mut sent = false;

    loop {
        let now = start.elapsed().as_millis() as u64;
        network.update(now);

        let Some(conn) = network.connection(server_addr) else {
            println!("connection closed");
            return ExitCode::SUCCESS;
        };

        if conn.is_connected() && !sent {
            sent = true;
            let message = args.message.clone();
            if let Some(conn) = network.connection_mut(server_addr) {
                if let Err(error) = conn.send(true).write_string(&message) {
                    tracing::warn!(%error, "failed to queue message");
                }
            }
        }

        if let Some(conn) = network.connection(server_addr) {
            for buf in conn.received_buffers() {
                if let Ok(reply) = buf.clone().read_string() {
                    println!("server says: {reply}");
                    return ExitCode::SUCCESS;
                }
            }
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}
