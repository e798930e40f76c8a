//! Connectivity probe
//!
//! Connects to the server with a single receive slot, waits for one message
//! from it, prints the message and disconnects. Useful for checking that the
//! fabric, the route and the server's send path work before running a load.
//!
//! Run with: cargo run --bin mc-probe -- --help

use anyhow::{Context, Result};
use clap::Parser;
use mc_rdma_bench::transport::{build_fabric, Fabric, LoopbackOptions};
use mc_rdma_bench::{Backend, BenchConfig, Connection, LoopbackFabric};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "mc-probe")]
#[command(about = "Wait for one message from a memcached RDMA endpoint")]
struct Args {
    /// Server address
    #[arg(short = 's', long, default_value = "127.0.0.1")]
    server: String,

    /// Server port
    #[arg(short = 'p', long, default_value = "11211")]
    port: String,

    /// Transport backend
    #[arg(long, value_enum, default_value_t = Backend::Loopback)]
    backend: Backend,

    /// Receive buffer size in bytes
    #[arg(long, default_value = "1024")]
    buffer_size: usize,

    /// How long to wait for the message, in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = BenchConfig {
        server_addr: args.server,
        server_port: args.port,
        ..Default::default()
    };
    config.transport.backend = args.backend;
    config.transport.recv_slots = 1;
    config.transport.recv_buffer_size = args.buffer_size;
    config.transport.completion_timeout = Duration::from_millis(args.timeout_ms);
    config.validate()?;

    let fabric: Arc<dyn Fabric> = match args.backend {
        // the loopback endpoint greets like a server announcing itself
        Backend::Loopback => Arc::new(LoopbackFabric::new(LoopbackOptions {
            greeting: Some(b"VERSION mc-probe-loopback\r\n".to_vec()),
            ..Default::default()
        })),
        Backend::Verbs => build_fabric(&config.transport)?,
    };

    let mut conn = Connection::open(fabric.as_ref(), &config, 0)
        .with_context(|| format!("connecting to {}:{}", config.server_addr, config.server_port))?;
    println!("Connected to {}:{} via {}", config.server_addr, config.server_port, fabric.name());

    let received = conn.await_reply(|payload| {
        println!("Received {} bytes: {}", payload.len(), payload.escape_ascii());
    });
    let summary = conn.close();
    tracing::debug!("Teardown: {:?}", summary);

    received.context("waiting for a message")?;
    Ok(())
}
