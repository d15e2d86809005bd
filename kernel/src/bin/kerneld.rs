//! Kernel Daemon
//!
//! The kerneld daemon:
//! - Serves syscalls and notices from the CPU and Memory services
//! - Runs the dispatcher and the I/O worker
//! - Boots the simulation with an initial process

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kernel::prelude::*;
use kernel::rpc::methods;
use kernel::sys::KernelStatus;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Kernel service of the OS simulator
#[derive(Parser)]
#[command(name = "kerneld")]
#[command(version)]
#[command(about = "Kernel service: scheduling, syscalls and synchronization", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Syscall server address
    #[arg(long, value_name = "ADDR", global = true)]
    listen: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the kernel with an initial process
    Run {
        /// Pseudocode file of the initial process
        path: String,

        /// Memory size of the initial process
        size: u32,

        /// Priority of its main thread
        #[arg(short, long, default_value_t = 0)]
        priority: Priority,
    },
    /// Check configuration
    Check,
    /// Show the state of a running kernel
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Run {
            path,
            size,
            priority,
        } => run_kernel(config, &path, size, priority).await?,
        Commands::Check => check_config(&config)?,
        Commands::Status => show_status(&config).await?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> KernelResult<KernelConfig> {
    let mut config = match &cli.config {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };

    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(config: &KernelConfig, verbose: u8) -> std::io::Result<()> {
    let log_level = match verbose {
        0 => config.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();
    Ok(())
}

async fn run_kernel(
    config: KernelConfig,
    path: &str,
    size: u32,
    priority: Priority,
) -> KernelResult<()> {
    info!("Starting kernel {}", kernel::VERSION);
    info!("  Listen:     {}", config.listen_addr);
    info!("  CPU:        {}", config.cpu_addr);
    info!("  Memory:     {}", config.memory_addr);
    info!("  Scheduler:  {}", config.scheduler_algorithm);

    let cpu = RemoteCpu::new(config.cpu_addr, config.rpc_timeout);
    let memory = RemoteMemory::new(config.memory_addr, config.rpc_timeout);
    let kernel = Kernel::new(config.clone(), cpu, memory);

    let mut server = RpcServer::new(config.listen_addr);
    server.start(Arc::clone(&kernel)).await?;
    let tasks = kernel.start();

    let pid = kernel.create_initial_process(path, size, priority).await?;
    info!("Initial process {} created from {}", pid, path);

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    server.stop();
    tasks.shutdown();
    Ok(())
}

fn check_config(config: &KernelConfig) -> KernelResult<()> {
    println!("Configuration check:");
    println!("{}", serde_json::to_string_pretty(config)?);
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

async fn show_status(config: &KernelConfig) -> KernelResult<()> {
    let client = RpcClient::new("kernel", config.listen_addr, config.rpc_timeout);
    let status: KernelStatus = client.call(methods::KERNEL_STATUS, serde_json::Value::Null).await?;

    println!("Kernel at {}", config.listen_addr);
    println!("  Policy:   {}", status.policy);
    match status.running {
        Some(slot) => println!("  Running:  {} (generation {})", slot.key, slot.generation),
        None => println!("  Running:  idle"),
    }
    println!("  Ready:    {}", status.ready.len());
    println!("  Blocked:  {}", status.blocked.len());
    println!("  Exited:   {}", status.exited.len());
    println!("  Backlog:  {:?}", status.backlog);
    println!();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["kerneld", "-v", "run", "init", "256", "--priority", "2"]);
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run {
                path,
                size,
                priority,
            } => {
                assert_eq!(path, "init");
                assert_eq!(size, 256);
                assert_eq!(priority, 2);
            }
            _ => panic!("expected run"),
        }
    }
}
