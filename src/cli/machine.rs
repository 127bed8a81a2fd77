//! Machine commands.
//!
//! - ps: List machines across all backends
//! - create: Create a machine from a kernel image
//! - start / stop / pause: Drive the lifecycle
//! - rm: Stop, detach dependents and delete
//! - logs: Print (and follow) guest console output
//! - drivers: List the backends this host supports

use crate::cli::parsers::{parse_port, parse_volume};
use crate::cli::{
    flush_output, format_pid_suffix, truncate, truncate_id, Context, ARGS_WIDTH, MACHINE_ID_WIDTH,
    NAME_WIDTH,
};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use unikvm::machine::{MachineNetwork, MachineVolume, PortMapping, Resources};
use unikvm::{
    Architecture, Error, KConfig, KernelArg, LogOptions, Machine, MachineService, MachineSpec,
    MachineState, Quantity, Subscription, WatchGroup,
};

// ============================================================================
// Ps Command
// ============================================================================

/// List machines.
#[derive(Args, Debug)]
pub struct PsCmd {
    /// Only show machine IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Show detailed output
    #[arg(short, long)]
    pub verbose: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl PsCmd {
    pub async fn run(&self, ctx: &Context) -> unikvm::Result<()> {
        let mut machines = ctx.machines.list().await?;
        machines.sort_by(|a, b| a.name.cmp(&b.name));

        if self.json {
            println!("{}", serde_json::to_string_pretty(&machines)?);
            return Ok(());
        }
        if self.quiet {
            for m in &machines {
                println!("{}", m.uid);
            }
            return Ok(());
        }
        if machines.is_empty() {
            println!("No machines found");
            return Ok(());
        }

        println!(
            "{:<12} {:<20} {:<12} {:<10} {:<8} {:<28}",
            "MACHINE ID", "NAME", "DRIVER", "STATE", "MEMORY", "ARGS"
        );
        for m in &machines {
            let memory = m.memory().map(|q| q.to_string()).unwrap_or_else(|| "-".into());
            println!(
                "{:<12} {:<20} {:<12} {:<10} {:<8} {:<28}",
                truncate_id(&m.uid),
                truncate(&m.name, NAME_WIDTH),
                m.driver().unwrap_or("-"),
                m.status.state,
                memory,
                truncate(&m.spec.application_args.join(" "), ARGS_WIDTH),
            );

            if self.verbose {
                if let Some(pid) = m.status.pid {
                    println!("  PID: {}", pid);
                }
                println!("  Kernel: {}", m.spec.kernel.display());
                for net in &m.spec.networks {
                    println!(
                        "  Network: {} ({})",
                        net.network,
                        net.interface.cidr.as_deref().unwrap_or("-")
                    );
                }
                for vol in &m.spec.volumes {
                    let ro = if vol.read_only { " (ro)" } else { "" };
                    println!("  Volume: {} -> {}{}", vol.volume, vol.destination.display(), ro);
                }
                for port in &m.spec.ports {
                    println!("  Port: {} -> {}/{}", port.host_port, port.machine_port, port.protocol);
                }
                if let Some(started) = m.status.started_at {
                    println!("  Started: {}", started);
                }
                if let (Some(exited), Some(code)) = (m.status.exited_at, m.status.exit_code) {
                    println!("  Exited: {} (code {})", exited, code);
                }
                println!();
            }
        }
        Ok(())
    }
}

// ============================================================================
// Create Command
// ============================================================================

/// Create a machine without starting it.
#[derive(Args, Debug)]
pub struct CreateCmd {
    /// Unikernel image
    pub kernel: PathBuf,

    /// Arguments for the guest application
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Machine name (derived from the UID if omitted)
    #[arg(long, default_value = "")]
    pub name: String,

    /// Backend to use (any compatible backend if omitted)
    #[arg(long)]
    pub platform: Option<String>,

    /// Guest architecture (defaults to the host's)
    #[arg(long)]
    pub arch: Option<Architecture>,

    /// Memory, e.g. 64Mi or 1Gi
    #[arg(short, long)]
    pub memory: Option<Quantity>,

    /// Number of vCPUs
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Initial ramdisk
    #[arg(long)]
    pub initrd: Option<PathBuf>,

    /// Kernel build config; backends that cannot run the image are skipped
    #[arg(long)]
    pub kconfig: Option<PathBuf>,

    /// Library parameter (library.param=value)
    #[arg(long = "karg")]
    pub kernel_args: Vec<KernelArg>,

    /// Port mapping (HOST:GUEST[/PROTO])
    #[arg(short = 'p', long = "port", value_parser = parse_port)]
    pub ports: Vec<PortMapping>,

    /// Use software emulation instead of hardware acceleration
    #[arg(long)]
    pub emulation: bool,

    /// Attach an interface on this network
    #[arg(long = "network")]
    pub networks: Vec<String>,

    /// Attach a volume (NAME[:DEST][:ro])
    #[arg(short = 'v', long = "volume", value_parser = parse_volume)]
    pub volumes: Vec<MachineVolume>,
}

impl CreateCmd {
    pub async fn run(self, ctx: &Context) -> unikvm::Result<()> {
        let spec = MachineSpec {
            architecture: self.arch.or_else(Architecture::host).unwrap_or_default(),
            platform: self.platform,
            kernel: self.kernel,
            initrd: self.initrd,
            resources: Resources {
                cpus: self.cpus,
                memory: self.memory,
            },
            kernel_args: self.kernel_args,
            application_args: self.args,
            emulation: self.emulation,
            ports: self.ports,
            networks: self
                .networks
                .into_iter()
                .map(|network| MachineNetwork {
                    network,
                    interface: Default::default(),
                })
                .collect(),
            volumes: self.volumes,
        };
        let mut machine = Machine::new(self.name, spec);

        let kconfig_path = self.kconfig.filter(|_| machine.spec.platform.is_none());
        if let Some(path) = kconfig_path {
            let kconfig = KConfig::parse(&std::fs::read_to_string(&path)?);
            let source = machine.spec.kernel.to_string_lossy().into_owned();
            let compatible = ctx.registry.compatible(&source, &kconfig);
            let Some(strategy) = compatible.first() else {
                return Err(Error::invalid_config(format!(
                    "no backend can run {}",
                    machine.spec.kernel.display()
                )));
            };
            tracing::debug!(driver = %strategy.name, "selected backend from kconfig");
            machine.spec.platform = Some(strategy.name.clone());
        }

        let attach = ctx.attach()?;
        let attached = attach.attach(&mut machine).await?;
        if let Err(e) = ctx.machines.create(&mut machine).await {
            attach.rollback(attached).await;
            return Err(e);
        }
        println!("Created machine: {}", machine.name);
        println!(
            "  ID: {}, Driver: {}",
            machine.uid,
            machine.driver().unwrap_or("-")
        );
        println!(
            "  CPUs: {}, Memory: {}",
            machine.spec.resources.cpus.unwrap_or_default(),
            machine.memory().map(|q| q.to_string()).unwrap_or_default()
        );
        for net in &machine.spec.networks {
            println!(
                "  Network: {} ({}, {})",
                net.network,
                net.interface.cidr.as_deref().unwrap_or("-"),
                net.interface.mac.as_deref().unwrap_or("-")
            );
        }
        for vol in &machine.spec.volumes {
            println!("  Volume: {} -> {}", vol.volume, vol.destination.display());
        }
        println!("\nUse 'unikvm start {}' to start the machine", machine.name);
        Ok(())
    }
}

// ============================================================================
// Start / Stop / Pause Commands
// ============================================================================

/// Start a machine.
#[derive(Args, Debug)]
pub struct StartCmd {
    /// Machine name or UID
    pub machine: String,
}

impl StartCmd {
    pub async fn run(&self, ctx: &Context) -> unikvm::Result<()> {
        let mut machine = ctx.resolve(&self.machine).await?;
        if machine.status.state == MachineState::Running {
            println!(
                "Machine '{}' already running{}",
                machine.name,
                format_pid_suffix(machine.status.pid)
            );
            return Ok(());
        }
        println!("Starting machine '{}'...", machine.name);
        flush_output();
        ctx.machines.start(&mut machine).await?;
        println!(
            "Machine '{}' {}{}",
            machine.name,
            machine.status.state,
            format_pid_suffix(machine.status.pid)
        );
        Ok(())
    }
}

/// Stop a machine.
#[derive(Args, Debug)]
pub struct StopCmd {
    /// Machine name or UID
    pub machine: String,
}

impl StopCmd {
    pub async fn run(&self, ctx: &Context) -> unikvm::Result<()> {
        let mut machine = ctx.resolve(&self.machine).await?;
        if machine.status.state.is_terminal() {
            println!("Machine '{}' not running", machine.name);
            return Ok(());
        }
        println!("Stopping machine '{}'...", machine.name);
        flush_output();
        ctx.machines.stop(&mut machine).await?;
        println!("Stopped machine: {}", machine.name);
        Ok(())
    }
}

/// Pause a running machine.
#[derive(Args, Debug)]
pub struct PauseCmd {
    /// Machine name or UID
    pub machine: String,
}

impl PauseCmd {
    pub async fn run(&self, ctx: &Context) -> unikvm::Result<()> {
        let mut machine = ctx.resolve(&self.machine).await?;
        ctx.machines.pause(&mut machine).await?;
        println!("Paused machine: {}", machine.name);
        Ok(())
    }
}

// ============================================================================
// Rm Command
// ============================================================================

/// Remove machines along with network interfaces and volumes nothing else uses.
#[derive(Args, Debug)]
pub struct RmCmd {
    /// Machine names or UIDs
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub machines: Vec<String>,

    /// Remove every machine
    #[arg(short, long)]
    pub all: bool,
}

impl RmCmd {
    pub async fn run(&self, ctx: &Context) -> unikvm::Result<()> {
        let teardown = ctx.teardown()?;

        if self.all {
            let result = teardown.remove_all().await;
            if let Ok(removed) = &result {
                for name in removed {
                    println!("Removed machine: {}", name);
                }
            }
            return result.map(|_| ());
        }

        let mut errors = Vec::new();
        for id in &self.machines {
            let result = match ctx.resolve(id).await {
                Ok(mut machine) => teardown.remove(&mut machine).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => println!("Removed machine: {}", id),
                Err(e) => {
                    tracing::warn!(machine = %id, error = %e, "remove failed");
                    errors.push((id.clone(), e));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::aggregate(errors))
        }
    }
}

// ============================================================================
// Logs Command
// ============================================================================

/// Print guest console output.
#[derive(Args, Debug)]
pub struct LogsCmd {
    /// Machine names or UIDs
    #[arg(required = true)]
    pub machines: Vec<String>,

    /// Follow log output until interrupted
    #[arg(short, long)]
    pub follow: bool,
}

impl LogsCmd {
    pub async fn run(&self, ctx: &Context) -> unikvm::Result<()> {
        let cancel = CancellationToken::new();
        let group = Arc::new(WatchGroup::new());
        let prefixed = self.machines.len() > 1;
        let mut tasks = Vec::new();

        for id in &self.machines {
            let machine = ctx.resolve(id).await?;
            if !group.add(machine.uid.clone()) {
                continue;
            }
            let opts = LogOptions {
                cancel: cancel.clone(),
                follow: self.follow,
            };
            let sub = match ctx.machines.logs(&machine, opts).await {
                Ok(sub) => sub,
                Err(e) => {
                    cancel.cancel();
                    group.done(&machine.uid);
                    return Err(e);
                }
            };

            let group = group.clone();
            let prefix = prefixed.then(|| truncate(&machine.name, MACHINE_ID_WIDTH));
            let task = tokio::spawn(async move {
                let result = print_lines(sub, prefix).await;
                group.done(&machine.uid);
                result
            });
            tasks.push((id.clone(), task));
        }

        tokio::select! {
            _ = group.wait() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::debug!("interrupted, stopping log followers");
                cancel.cancel();
            }
        }

        let mut errors = Vec::new();
        for (id, task) in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push((id, e)),
                Err(e) => errors.push((id, Error::driver("logs", "follow", e.to_string()))),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::aggregate(errors))
        }
    }
}

/// Print a log stream until it ends.
async fn print_lines(mut sub: Subscription<String>, prefix: Option<String>) -> unikvm::Result<()> {
    let print = |line: &str| match &prefix {
        Some(p) => println!("{:<12} | {}", p, line),
        None => println!("{}", line),
    };
    loop {
        tokio::select! {
            biased;
            line = sub.events.recv() => match line {
                Some(line) => print(&line),
                None => return Ok(()),
            },
            err = sub.errors.recv() => {
                while let Ok(line) = sub.events.try_recv() {
                    print(&line);
                }
                return match err {
                    None | Some(Error::EndOfStream) | Some(Error::Cancelled) => Ok(()),
                    Some(e) => Err(e),
                };
            }
        }
    }
}

// ============================================================================
// Drivers Command
// ============================================================================

/// List the backends available on this host.
#[derive(Args, Debug)]
pub struct DriversCmd {}

impl DriversCmd {
    pub async fn run(&self, ctx: &Context) -> unikvm::Result<()> {
        for name in ctx.registry.driver_names() {
            println!("{}", name);
        }
        Ok(())
    }
}
