//! QEMU backend.
//!
//! Guests are launched daemonized with halted vCPUs and controlled over
//! QMP. Two QMP sockets are opened: one for commands and status queries,
//! one held by a watcher for the event stream, since QEMU serves a single
//! client per socket.

pub mod config;
pub mod qmp;

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::log_rotation;
use crate::machine::service::{
    self, abandon, check_platform, list_reconciled, load_owned, mark_exited, mark_failed, mark_running,
    owned_machines, persist, prepare, reconcile, Probe,
};
use crate::machine::{
    Architecture, LogOptions, Machine, MachineService, MachineState, PlatformConfig, WatchOptions,
};
use crate::process::{self, Executable};
use crate::store::Store;
use crate::watch::{self, subscription, Publisher, Subscription};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

pub use config::QemuConfig;
use qmp::QmpClient;

/// Registry name of this backend.
pub const DRIVER_NAME: &str = "qemu";

/// Map a `query-status` run state.
///
/// QEMU reports a halted guest as `prelaunch` before the first `cont` and
/// as `paused` afterwards; a guest that never ran counts as created.
pub fn map_status(status: &str, started: bool) -> MachineState {
    match status {
        "running" => MachineState::Running,
        "prelaunch" => MachineState::Created,
        "paused" if started => MachineState::Paused,
        "paused" => MachineState::Created,
        "shutdown" | "postmigrate" => MachineState::Exited,
        "internal-error" | "io-error" | "guest-panicked" => MachineState::Failed,
        "suspended" => MachineState::Suspended,
        _ => MachineState::Unknown,
    }
}

/// Map a QMP event to the state it announces.
pub fn map_event(event: &str) -> Option<MachineState> {
    match event {
        "STOP" => Some(MachineState::Paused),
        "RESUME" | "WAKEUP" => Some(MachineState::Running),
        "RESET" => Some(MachineState::Restarting),
        "SUSPEND" | "SUSPEND_DISK" => Some(MachineState::Suspended),
        "GUEST_PANICKED" => Some(MachineState::Failed),
        "SHUTDOWN" | "POWERDOWN" => Some(MachineState::Exited),
        _ => None,
    }
}

fn qemu_config(machine: &Machine) -> Result<&QemuConfig> {
    match &machine.status.platform_config {
        Some(PlatformConfig::Qemu(c)) => Ok(c),
        Some(other) => Err(Error::WrongPlatform {
            expected: DRIVER_NAME.to_string(),
            actual: other.driver().to_string(),
        }),
        None => Err(Error::machine_not_found(&machine.uid)),
    }
}

/// Machine service backed by QEMU.
#[derive(Debug, Clone)]
pub struct QemuService {
    config: Arc<HostConfig>,
    store: Store,
}

impl QemuService {
    /// Create the service.
    pub fn new(config: Arc<HostConfig>, store: Store) -> Self {
        Self { config, store }
    }

    /// Build the invocation from the current spec and launch it.
    ///
    /// Returns once the emulator has daemonized, with the guest halted.
    async fn launch(&self, machine: &mut Machine) -> Result<i32> {
        let qemu = config::build(&self.config.qemu_prefix, machine)?;
        machine.status.platform_config = Some(PlatformConfig::Qemu(qemu.clone()));

        for path in qemu.sockets().iter().chain(std::iter::once(&qemu.pid_file)) {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut exe = Executable::new(&qemu.binary).args(qemu.args.iter().cloned());
        tracing::debug!(machine = %machine.uid, command = %exe.command_line(), "launching qemu");
        exe.start_and_wait().await?;

        let pid = tokio::fs::read_to_string(&qemu.pid_file)
            .await?
            .trim()
            .parse::<i32>()
            .map_err(|e| Error::driver(DRIVER_NAME, "launch", format!("invalid pid file: {}", e)))?;
        machine.status.pid = Some(pid);
        Ok(pid)
    }

    async fn control(&self, qemu: &QemuConfig) -> Result<QmpClient> {
        QmpClient::connect(&qemu.control_socket, self.config.connect_timeout).await
    }

    /// Ask the guest to power down, then escalate to `quit` and signals.
    async fn shutdown(&self, qemu: &QemuConfig, pid: i32) -> Result<i32> {
        match self.control(qemu).await {
            Ok(mut qmp) => {
                if let Err(e) = qmp.execute("system_powerdown").await {
                    tracing::warn!(pid, error = %e, "system_powerdown failed");
                }
            }
            Err(e) => tracing::warn!(pid, error = %e, "qmp unavailable for powerdown"),
        }

        if let Some(code) = process::wait_for_exit(pid, self.config.stop_timeout).await {
            return Ok(code);
        }

        tracing::debug!(pid, "guest ignored powerdown, sending quit");
        if let Ok(mut qmp) = self.control(qemu).await {
            // The emulator may close the socket before replying.
            let _ = qmp.execute("quit").await;
        }
        if let Some(code) = process::wait_for_exit(pid, self.config.stop_timeout).await {
            return Ok(code);
        }

        process::stop_process(pid, self.config.stop_timeout, true).await
    }

    async fn run_watch(
        self,
        mut machine: Machine,
        keep_observing: bool,
        publisher: Publisher<Machine>,
    ) {
        if !publisher.send(machine.clone()).await {
            if publisher.token().is_cancelled() {
                publisher.cancelled();
            }
            return;
        }
        if machine.status.state.is_terminal() && !keep_observing {
            return;
        }

        let events_socket = match qemu_config(&machine) {
            Ok(q) => q.events_socket.clone(),
            Err(e) => {
                let _ = publisher.fail(e).await;
                return;
            }
        };
        let mut qmp = match QmpClient::connect(&events_socket, self.config.connect_timeout).await {
            Ok(c) => c,
            Err(e) => {
                let _ = publisher.fail(e).await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = publisher.token().cancelled() => {
                    publisher.cancelled();
                    return;
                }
                _ = publisher.closed() => return,
                event = qmp.next_event() => match event {
                    Ok(Some(event)) => {
                        let Some(state) = map_event(&event.event) else {
                            continue;
                        };
                        tracing::debug!(machine = %machine.uid, event = %event.event, "qmp event");
                        machine.status.state = state;
                        match state {
                            MachineState::Running => {
                                machine.status.started_at.get_or_insert_with(Utc::now);
                            }
                            MachineState::Exited => mark_exited(&mut machine, 0),
                            _ => {}
                        }
                        if let Err(e) = persist(&self.store, &machine) {
                            tracing::warn!(machine = %machine.uid, error = %e, "failed to persist event state");
                        }
                        if !publisher.send(machine.clone()).await {
                            return;
                        }
                        if state == MachineState::Exited && !keep_observing {
                            return;
                        }
                    }
                    Ok(None) => {
                        // Emulator went away; report whatever is left.
                        if let Err(e) = self.get(&mut machine).await {
                            let _ = publisher.fail(e).await;
                        } else {
                            let _ = publisher.send(machine).await;
                        }
                        return;
                    }
                    Err(e) => {
                        let _ = publisher.fail(e).await;
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MachineService for QemuService {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn create(&self, machine: &mut Machine) -> Result<()> {
        check_platform(DRIVER_NAME, machine)?;
        if !machine.spec.emulation && Architecture::host() != Some(machine.spec.architecture) {
            return Err(Error::UnsupportedArchitecture {
                driver: DRIVER_NAME.to_string(),
                arch: format!("{} without emulation", machine.spec.architecture),
            });
        }
        prepare(&self.config, machine)?;

        if let Err(e) = config::build(&self.config.qemu_prefix, machine) {
            let _ = std::fs::remove_dir_all(&machine.status.state_dir);
            return Err(e);
        }

        match self.launch(machine).await {
            Ok(pid) => {
                machine.status.state = MachineState::Created;
                persist(&self.store, machine)?;
                tracing::info!(machine = %machine.uid, pid, "machine created");
                Ok(())
            }
            Err(e) => {
                mark_failed(&self.store, machine, &e);
                Err(e)
            }
        }
    }

    async fn start(&self, machine: &mut Machine) -> Result<()> {
        load_owned(&self.store, DRIVER_NAME, machine)?;
        let live = machine.status.pid.filter(|p| process::is_alive(*p));
        if machine.status.state == MachineState::Running && live.is_some() {
            return Ok(());
        }

        let (pid, relaunched) = match live {
            Some(pid) => (pid, false),
            None => {
                if let Err(e) = log_rotation::rotate_if_needed(&machine.status.log_file) {
                    tracing::warn!(machine = %machine.uid, error = %e, "log rotation failed");
                }
                (self.launch(machine).await?, true)
            }
        };

        let resumed = async {
            let qemu = qemu_config(machine)?.clone();
            self.control(&qemu).await?.execute("cont").await?;
            Ok::<(), Error>(())
        }
        .await;
        if let Err(e) = resumed {
            if relaunched {
                abandon(&self.store, machine, pid, &e).await;
            }
            return Err(e);
        }

        mark_running(machine, pid);
        persist(&self.store, machine)?;
        tracing::info!(machine = %machine.uid, pid, "machine started");
        Ok(())
    }

    async fn pause(&self, machine: &mut Machine) -> Result<()> {
        load_owned(&self.store, DRIVER_NAME, machine)?;
        if machine.status.pid.filter(|p| process::is_alive(*p)).is_none() {
            return Err(Error::InvalidState {
                expected: MachineState::Running.to_string(),
                actual: machine.status.state.to_string(),
            });
        }

        let qemu = qemu_config(machine)?.clone();
        let mut qmp = self.control(&qemu).await?;
        qmp.execute("stop").await?;

        machine.status.state = MachineState::Paused;
        persist(&self.store, machine)?;
        tracing::info!(machine = %machine.uid, "machine paused");
        Ok(())
    }

    async fn stop(&self, machine: &mut Machine) -> Result<()> {
        load_owned(&self.store, DRIVER_NAME, machine)?;

        let code = match machine.status.pid.filter(|p| process::is_alive(*p)) {
            Some(pid) => {
                let qemu = qemu_config(machine)?.clone();
                self.shutdown(&qemu, pid).await?
            }
            None => machine
                .status
                .pid
                .and_then(process::try_wait)
                .unwrap_or(0),
        };

        let already = machine.status.state.is_terminal();
        mark_exited(machine, code);
        persist(&self.store, machine)?;
        if !already {
            tracing::info!(machine = %machine.uid, "machine stopped");
        }
        Ok(())
    }

    async fn update(&self, machine: &mut Machine) -> Result<()> {
        let mut stored = machine.clone();
        load_owned(&self.store, DRIVER_NAME, &mut stored)?;
        stored.name = machine.name.clone();
        stored.spec = machine.spec.clone();
        persist(&self.store, &stored)?;
        *machine = stored;
        Ok(())
    }

    async fn delete(&self, machine: &mut Machine) -> Result<()> {
        load_owned(&self.store, DRIVER_NAME, machine)?;
        let qemu = qemu_config(machine)?.clone();
        let mut errors = Vec::new();

        if let Some(pid) = machine.status.pid.filter(|p| process::is_alive(*p)) {
            if let Err(e) = process::stop_process(pid, self.config.stop_timeout, true).await {
                errors.push(("stop".to_string(), e));
            }
        }

        let mut extra = qemu.sockets();
        extra.push(qemu.pid_file.clone());
        if let Err(e) = service::remove_state(&self.store, machine, &extra) {
            errors.push(("cleanup".to_string(), e));
        }

        if errors.is_empty() {
            tracing::info!(machine = %machine.uid, "machine deleted");
            Ok(())
        } else {
            Err(Error::aggregate(errors))
        }
    }

    async fn get(&self, machine: &mut Machine) -> Result<()> {
        load_owned(&self.store, DRIVER_NAME, machine)?;
        let socket = qemu_config(machine)?.control_socket.clone();
        let timeout = self.config.connect_timeout;
        let started = machine.status.started_at.is_some();

        reconcile(&self.store, machine, |_pid| async move {
            match QmpClient::connect(&socket, timeout).await {
                Ok(mut qmp) => {
                    let status = qmp.query_status().await?;
                    Ok(Probe::State(map_status(&status, started)))
                }
                Err(e) if qmp::is_gone(&e) => Ok(Probe::Gone),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Machine>> {
        let machines = owned_machines(&self.store, DRIVER_NAME)?;
        Ok(list_reconciled(self, machines).await)
    }

    async fn watch(&self, machine: &Machine, opts: WatchOptions) -> Result<Subscription<Machine>> {
        let mut current = machine.clone();
        self.get(&mut current).await?;

        let (publisher, sub) = subscription(opts.cancel);
        tokio::spawn(self.clone().run_watch(current, opts.keep_observing, publisher));
        Ok(sub)
    }

    async fn logs(&self, machine: &Machine, opts: LogOptions) -> Result<Subscription<String>> {
        let mut current = machine.clone();
        load_owned(&self.store, DRIVER_NAME, &mut current)?;
        watch::follow(&current.status.log_file, opts.follow, opts.cancel)
    }
}
