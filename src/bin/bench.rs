//! Memcached RDMA load generator
//!
//! Opens one connection per thread and drives fixed-size mutation requests
//! (add, set, replace, append, prepend, incr, decr, delete) in the text or
//! binary memcached protocol, then reports per-context and aggregate
//! throughput.
//!
//! Run with: cargo run --bin mc-bench -- --help

use anyhow::{Context, Result};
use clap::Parser;
use mc_rdma_bench::report::format_size;
use mc_rdma_bench::transport::build_fabric;
use mc_rdma_bench::{Backend, BenchConfig, Command, Driver, Encoding};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "mc-bench")]
#[command(about = "Memcached load generator over RDMA send/receive")]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of threads (one connection each)
    #[arg(short = 'c', long)]
    threads: Option<usize>,

    /// Requests per thread
    #[arg(short = 'r', long)]
    requests: Option<u64>,

    /// Run-duration bound in seconds
    #[arg(short = 't', long)]
    time: Option<u64>,

    /// Server address
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Server port
    #[arg(short = 'p', long)]
    port: Option<String>,

    /// Wire protocol
    #[arg(long, value_enum)]
    protocol: Option<Encoding>,

    /// Shorthand for --protocol binary
    #[arg(short = 'b', long, conflicts_with = "protocol")]
    binary: bool,

    /// Size of every request in bytes
    #[arg(short = 'm', long)]
    size: Option<usize>,

    /// Ask for a reply to every request and wait for it
    #[arg(short = 'R', long)]
    reply_wait: bool,

    /// Log every reply received
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Command cycle, comma separated (default: all eight)
    #[arg(long, value_enum, value_delimiter = ',')]
    commands: Option<Vec<Command>>,

    /// Transport backend
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Print the report as JSON after the summary
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<BenchConfig> {
        let mut config = match &self.config {
            Some(path) => BenchConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BenchConfig::default(),
        };

        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(requests) = self.requests {
            config.requests_per_thread = requests;
        }
        if let Some(secs) = self.time {
            config.run_duration = Duration::from_secs(secs);
        }
        if let Some(server) = self.server {
            config.server_addr = server;
        }
        if let Some(port) = self.port {
            config.server_port = port;
        }
        if self.binary {
            config.protocol = Encoding::Binary;
        } else if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(size) = self.size {
            config.request_size = size;
        }
        if self.reply_wait {
            config.reply_wait = true;
        }
        if self.verbose {
            config.verbose = true;
        }
        if let Some(commands) = self.commands {
            config.commands = commands;
        }
        if let Some(backend) = self.backend {
            config.transport.backend = backend;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let json = args.json;
    let config = args.into_config()?;

    println!("==============================================");
    println!("Memcached RDMA Benchmark");
    println!("==============================================");
    println!("Server:             {}:{}", config.server_addr, config.server_port);
    println!("Backend:            {:?}", config.transport.backend);
    println!("Threads:            {}", config.threads);
    println!("Requests/thread:    {}", config.requests_per_thread);
    println!("Duration bound:     {}s", config.run_duration.as_secs());
    println!("Protocol:           {}", config.protocol);
    println!("Request size:       {}", format_size(config.request_size));
    println!("Reply wait:         {}", config.reply_wait);
    println!(
        "Commands:           {}",
        config
            .commands
            .iter()
            .map(|c| c.verb())
            .collect::<Vec<_>>()
            .join(",")
    );
    println!("==============================================");

    let fabric = build_fabric(&config.transport)?;
    let driver = Arc::new(Driver::new(config, fabric)?);

    let stop = driver.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after the current iteration");
            stop.stop();
        }
    });

    let runner = Arc::clone(&driver);
    let report = tokio::task::spawn_blocking(move || runner.run()).await?;

    report.print_summary();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    let failed = report.contexts.iter().filter(|c| c.is_failure()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} contexts failed", failed, report.contexts.len());
    }
    Ok(())
}
