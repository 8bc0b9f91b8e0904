//! The `utks` echo server CLI: binds a [`Network`], accepts every incoming
//! connection, and echoes back any `DATA` payload it receives as a UTF-8 string.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;

use udp_toolkit::{Network, NetworkConfig};

#[derive(Parser)]
#[command(name = "utks", version, about = "Run a udp-toolkit echo server")]
struct Args {
    /// Local port to bind; 0 lets the OS assign one.
    #[arg(long, default_value_t = 0)]
    port: u16,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = NetworkConfig {
        bind_port: args.port,
        ..NetworkConfig::default()
    };

    let mut network = match Network::new(
        |conn, _info| {
            tracing::info!(addr = %conn.endpoint(), "accepting connection request");
            true
        },
        |conn, reason| {
            tracing::info!(addr = %conn.endpoint(), ?reason, "connection closed");
        },
        config,
    ) {
        Ok(network) => network,
        Err(error) => {
            eprintln!("failed to bind: {error}");
            return ExitCode::FAILURE;
        }
    };

    println!("{}", network.status());

    let start = Instant::now();
    loop {
        let now = start.elapsed().as_millis() as u64;
        network.update(now);

        let addrs: Vec<SocketAddr> = network.connections().map(|c| c.endpoint()).collect();
        for addr in addrs {
            let Some(conn) = network.connection_mut(addr) else { continue };
            if !conn.is_connected() {
                continue;
            }

            let messages: Vec<String> = conn
                .received_buffers()
                .iter()
                .filter_map(|buf| buf.clone().read_string().ok())
                .collect();

            for message in messages {
                tracing::info!(%addr, %message, "echoing");
                if let Err(error) = conn.send(true).write_string(&message) {
                    tracing::warn!(%error, %addr, "failed to queue echo");
                }
            }
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}
