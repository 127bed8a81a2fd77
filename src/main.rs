//! unikvm CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

/// unikvm - control plane for unikernel virtual machines
#[derive(Parser, Debug)]
#[command(name = "unikvm")]
#[command(about = "Create, run and observe unikernel virtual machines")]
#[command(
    long_about = "unikvm manages unikernel guests on QEMU and Firecracker, together with \
the bridge networks and shared volumes they use.\n\n\
Quick start:\n  \
unikvm create --name hello ./hello_qemu-x86_64\n  \
unikvm start hello\n  \
unikvm logs -f hello"
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List machines
    #[command(alias = "ls")]
    Ps(cli::machine::PsCmd),

    /// Create a machine without starting it
    Create(cli::machine::CreateCmd),

    /// Start a machine
    Start(cli::machine::StartCmd),

    /// Stop a machine
    Stop(cli::machine::StopCmd),

    /// Pause a running machine
    Pause(cli::machine::PauseCmd),

    /// Remove machines and the resources only they use
    #[command(alias = "remove")]
    Rm(cli::machine::RmCmd),

    /// Print guest console output
    Logs(cli::machine::LogsCmd),

    /// List the backends available on this host
    Drivers(cli::machine::DriversCmd),
}

impl Commands {
    async fn run(self, ctx: &cli::Context) -> unikvm::Result<()> {
        match self {
            Commands::Ps(cmd) => cmd.run(ctx).await,
            Commands::Create(cmd) => cmd.run(ctx).await,
            Commands::Start(cmd) => cmd.run(ctx).await,
            Commands::Stop(cmd) => cmd.run(ctx).await,
            Commands::Pause(cmd) => cmd.run(ctx).await,
            Commands::Rm(cmd) => cmd.run(ctx).await,
            Commands::Logs(cmd) => cmd.run(ctx).await,
            Commands::Drivers(cmd) => cmd.run(ctx).await,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = unikvm::VERSION, "starting unikvm");

    // Execute command
    let result = run(cli.command);

    // Handle errors
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> unikvm::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let ctx = cli::Context::load()?;
        command.run(&ctx).await
    })
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("unikvm=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
