//! Firecracker backend.
//!
//! The VMM is spawned at create time and configured through its REST API;
//! the guest only boots on `InstanceStart`. Firecracker has no event
//! channel, so watching polls the instance state.

pub mod api;
pub mod config;

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
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;

use api::ApiClient;
pub use config::FirecrackerConfig;

/// Registry name of this backend.
pub const DRIVER_NAME: &str = "firecracker";

/// Map the `state` field of `GET /`.
pub fn map_state(state: &str) -> MachineState {
    match state {
        "Not started" => MachineState::Created,
        "Running" => MachineState::Running,
        "Paused" => MachineState::Paused,
        _ => MachineState::Unknown,
    }
}

fn firecracker_config(machine: &Machine) -> Result<&FirecrackerConfig> {
    match &machine.status.platform_config {
        Some(PlatformConfig::Firecracker(c)) => Ok(c),
        Some(other) => Err(Error::WrongPlatform {
            expected: DRIVER_NAME.to_string(),
            actual: other.driver().to_string(),
        }),
        None => Err(Error::machine_not_found(&machine.uid)),
    }
}

/// Machine service backed by Firecracker.
#[derive(Debug, Clone)]
pub struct FirecrackerService {
    config: Arc<HostConfig>,
    store: Store,
}

impl FirecrackerService {
    /// Create the service.
    pub fn new(config: Arc<HostConfig>, store: Store) -> Self {
        Self { config, store }
    }

    fn client(&self, fc: &FirecrackerConfig) -> ApiClient {
        ApiClient::new(&fc.api_socket, self.config.connect_timeout)
    }

    /// Spawn the VMM and push the guest configuration. The guest is left
    /// not started.
    async fn launch(&self, machine: &mut Machine) -> Result<i32> {
        let fc = config::build(&self.config.firecracker_bin, machine)?;
        machine.status.platform_config = Some(PlatformConfig::Firecracker(fc.clone()));

        match std::fs::remove_file(&fc.api_socket) {
            Ok(()) => tracing::debug!(socket = %fc.api_socket.display(), "removed stale api socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let log = &machine.status.log_file;
        let mut exe = Executable::new(&fc.binary)
            .args(fc.args(&machine.uid))
            .stdout(log)
            .stderr(log)
            .detach(true);
        let pid = exe.start()?;
        machine.status.pid = Some(pid);

        if let Err(e) = self.configure(&fc, pid).await {
            process::kill(pid);
            let _ = process::wait_for_exit(pid, process::SIGKILL_WAIT).await;
            return Err(e);
        }
        Ok(pid)
    }

    async fn configure(&self, fc: &FirecrackerConfig, pid: i32) -> Result<()> {
        wait_for_socket(&fc.api_socket, pid, self.config.connect_timeout).await?;

        let client = self.client(fc);
        client.put("/boot-source", &fc.boot_source).await?;
        client.put("/machine-config", &fc.machine_config).await?;
        for iface in &fc.network_interfaces {
            client
                .put(&format!("/network-interfaces/{}", iface.iface_id), iface)
                .await?;
        }
        Ok(())
    }

    async fn run_watch(self, mut machine: Machine, keep_observing: bool, publisher: Publisher<Machine>) {
        if !publisher.send(machine.clone()).await {
            if publisher.token().is_cancelled() {
                publisher.cancelled();
            }
            return;
        }

        let mut last = machine.status.state;
        loop {
            if last.is_terminal() && !keep_observing {
                return;
            }
            tokio::select! {
                _ = publisher.token().cancelled() => {
                    publisher.cancelled();
                    return;
                }
                _ = publisher.closed() => return,
                _ = tokio::time::sleep(self.config.watch_poll_interval) => {}
            }

            if let Err(e) = self.get(&mut machine).await {
                let _ = publisher.fail(e).await;
                return;
            }
            if machine.status.state != last {
                last = machine.status.state;
                if !publisher.send(machine.clone()).await {
                    if publisher.token().is_cancelled() {
                        publisher.cancelled();
                    }
                    return;
                }
            }
        }
    }
}

/// Wait for the VMM to create its API socket.
async fn wait_for_socket(path: &Path, pid: i32, timeout: std::time::Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if path.exists() {
            return Ok(());
        }
        if !process::is_alive(pid) {
            return Err(Error::driver(
                DRIVER_NAME,
                "launch",
                "vmm exited before its api socket appeared",
            ));
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                operation: format!("waiting for {}", path.display()),
                duration: timeout,
            });
        }
        tokio::time::sleep(process::FAST_POLL_INTERVAL).await;
    }
}

#[async_trait]
impl MachineService for FirecrackerService {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn create(&self, machine: &mut Machine) -> Result<()> {
        check_platform(DRIVER_NAME, machine)?;
        if machine.spec.emulation {
            return Err(Error::invalid_config(
                "firecracker requires hardware virtualization",
            ));
        }
        if Architecture::host() != Some(machine.spec.architecture) {
            return Err(Error::UnsupportedArchitecture {
                driver: DRIVER_NAME.to_string(),
                arch: machine.spec.architecture.to_string(),
            });
        }
        prepare(&self.config, machine)?;

        if let Err(e) = config::build(&self.config.firecracker_bin, machine) {
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

        // A relaunched VMM has not booted yet, whatever the record says.
        let resume = !relaunched && machine.status.state == MachineState::Paused;
        let booted = async {
            let client = self.client(firecracker_config(machine)?);
            if resume {
                client
                    .patch("/vm", &serde_json::json!({ "state": "Resumed" }))
                    .await
            } else {
                client.action("InstanceStart").await
            }
        }
        .await;
        if let Err(e) = booted {
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

        let fc = firecracker_config(machine)?.clone();
        self.client(&fc)
            .patch("/vm", &serde_json::json!({ "state": "Paused" }))
            .await?;

        machine.status.state = MachineState::Paused;
        persist(&self.store, machine)?;
        tracing::info!(machine = %machine.uid, "machine paused");
        Ok(())
    }

    async fn stop(&self, machine: &mut Machine) -> Result<()> {
        load_owned(&self.store, DRIVER_NAME, machine)?;

        let code = match machine.status.pid.filter(|p| process::is_alive(*p)) {
            Some(pid) => {
                // Ctrl-Alt-Del is only wired to the i8042 device on x86.
                let mut exited = None;
                if machine.spec.architecture == Architecture::X86_64
                    && machine.status.state == MachineState::Running
                {
                    let fc = firecracker_config(machine)?.clone();
                    match self.client(&fc).action("SendCtrlAltDel").await {
                        Ok(()) => {
                            exited = process::wait_for_exit(pid, self.config.stop_timeout).await;
                        }
                        Err(e) => tracing::warn!(pid, error = %e, "SendCtrlAltDel failed"),
                    }
                }
                match exited {
                    Some(code) => code,
                    None => process::stop_process(pid, self.config.stop_timeout, true).await?,
                }
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
        let fc = firecracker_config(machine)?.clone();
        let mut errors = Vec::new();

        if let Some(pid) = machine.status.pid.filter(|p| process::is_alive(*p)) {
            if let Err(e) = process::stop_process(pid, self.config.stop_timeout, true).await {
                errors.push(("stop".to_string(), e));
            }
        }
        if let Err(e) = service::remove_state(&self.store, machine, &[fc.api_socket]) {
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
        let client = self.client(firecracker_config(machine)?);

        reconcile(&self.store, machine, |_pid| async move {
            match client.describe().await {
                Ok(info) => Ok(Probe::State(map_state(&info.state))),
                Err(Error::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    Ok(Probe::Gone)
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineSpec;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Stands in for the VMM: announces its launch next to the api socket
    /// path and stays alive. The test serves the API itself.
    const FAKE_FIRECRACKER: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "--api-sock" ]; then sock="$2"; fi
  shift
done
echo "vmm starting"
: > "$sock.launched"
exec sleep 300
"#;

    fn setup() -> (TempDir, FirecrackerService) {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake-firecracker");
        std::fs::write(&script, FAKE_FIRECRACKER).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = HostConfig::with_root(dir.path());
        config.firecracker_bin = script.display().to_string();
        config.stop_timeout = Duration::from_millis(200);
        config.connect_timeout = Duration::from_secs(5);
        config.watch_poll_interval = Duration::from_millis(20);
        let store = config.open_store().unwrap();
        (dir, FirecrackerService::new(Arc::new(config), store))
    }

    fn machine(dir: &Path) -> Machine {
        let kernel = dir.join("kernel");
        std::fs::write(&kernel, b"\x7fELF").unwrap();
        Machine::new(
            "fc",
            MachineSpec {
                kernel,
                architecture: Architecture::host().unwrap_or_default(),
                ..Default::default()
            },
        )
    }

    /// Serve the API once the fake VMM for `uid` has (re)launched.
    fn serve_after_launch(
        svc: &FirecrackerService,
        uid: &str,
    ) -> tokio::task::JoinHandle<api::testing::FakeApi> {
        let sock = svc.config.runtime_dir.join(uid).join(config::API_SOCKET);
        let marker = sock.with_extension("sock.launched");
        let _ = std::fs::remove_file(&marker);
        tokio::spawn(async move {
            while !marker.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            api::testing::serve(&sock)
        })
    }

    /// Create `m`, serving the API once the fake VMM has launched.
    async fn create_with_api(svc: &FirecrackerService, m: &mut Machine) -> api::testing::FakeApi {
        let server = serve_after_launch(svc, &m.uid);
        svc.create(m).await.unwrap();
        server.await.unwrap()
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_state("Not started"), MachineState::Created);
        assert_eq!(map_state("Running"), MachineState::Running);
        assert_eq!(map_state("Paused"), MachineState::Paused);
        assert_eq!(map_state("Halted"), MachineState::Unknown);
    }

    #[tokio::test]
    async fn test_emulation_is_rejected() {
        let (dir, svc) = setup();
        let mut m = machine(dir.path());
        m.spec.emulation = true;
        assert!(matches!(
            svc.create(&mut m).await,
            Err(Error::InvalidConfig(_))
        ));
        assert!(!svc.config.runtime_dir.join(&m.uid).exists());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (dir, svc) = setup();
        let mut m = machine(dir.path());
        let fake = create_with_api(&svc, &mut m).await;

        assert_eq!(m.status.state, MachineState::Created);
        let pid = m.status.pid.unwrap();
        let seen = fake.seen();
        assert!(seen.iter().any(|r| r.starts_with("PUT /boot-source")));
        assert!(seen.iter().any(|r| r.contains(r#""mem_size_mib":64"#)));

        let mut got = Machine::reference(&m.uid);
        svc.get(&mut got).await.unwrap();
        assert_eq!(got.status.state, MachineState::Created);

        svc.start(&mut got).await.unwrap();
        svc.get(&mut got).await.unwrap();
        assert_eq!(got.status.state, MachineState::Running);
        assert!(got.status.started_at.is_some());

        svc.pause(&mut got).await.unwrap();
        svc.get(&mut got).await.unwrap();
        assert_eq!(got.status.state, MachineState::Paused);

        svc.start(&mut got).await.unwrap();
        assert!(fake.seen().iter().any(|r| r.contains("Resumed")));

        svc.stop(&mut got).await.unwrap();
        assert_eq!(got.status.state, MachineState::Exited);
        assert!(!process::is_alive(pid));
        let exited_at = got.status.exited_at;
        svc.stop(&mut got).await.unwrap();
        assert_eq!(got.status.exited_at, exited_at);

        fake.shutdown().await;
        svc.delete(&mut got).await.unwrap();
        assert!(!got.status.state_dir.exists());
    }

    #[tokio::test]
    async fn test_start_relaunches_when_recorded_running_but_dead() {
        let (dir, svc) = setup();
        let mut m = machine(dir.path());
        let fake = create_with_api(&svc, &mut m).await;
        fake.shutdown().await;
        let old_pid = m.status.pid.unwrap();

        process::stop_process(old_pid, Duration::from_millis(200), true)
            .await
            .unwrap();
        m.status.state = MachineState::Running;
        persist(&svc.store, &m).unwrap();

        let server = serve_after_launch(&svc, &m.uid);
        let mut got = Machine::reference(&m.uid);
        svc.start(&mut got).await.unwrap();
        let fake = server.await.unwrap();

        let new_pid = got.status.pid.unwrap();
        assert_ne!(new_pid, old_pid);
        assert!(process::is_alive(new_pid));
        assert!(fake.seen().iter().any(|r| r.contains("InstanceStart")));
        let stored = svc.store.lookup_machine(&m.uid).unwrap().unwrap();
        assert_eq!(stored.status.pid, Some(new_pid));
        assert_eq!(stored.status.state, MachineState::Running);

        svc.stop(&mut got).await.unwrap();
        fake.shutdown().await;
        svc.delete(&mut got).await.unwrap();
    }

    #[tokio::test]
    async fn test_logs_capture_vmm_output() {
        let (dir, svc) = setup();
        let mut m = machine(dir.path());
        let fake = create_with_api(&svc, &mut m).await;

        let opts = LogOptions {
            follow: false,
            ..Default::default()
        };
        let mut sub = svc.logs(&m, opts).await.unwrap();
        assert_eq!(sub.events.recv().await.as_deref(), Some("vmm starting"));
        assert!(matches!(sub.errors.recv().await, Some(Error::EndOfStream)));

        fake.shutdown().await;
        svc.delete(&mut m).await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_polls_for_changes_until_cancelled() {
        let (dir, svc) = setup();
        let mut m = machine(dir.path());
        let fake = create_with_api(&svc, &mut m).await;

        let cancel = CancellationToken::new();
        let opts = WatchOptions {
            cancel: cancel.clone(),
            keep_observing: false,
        };
        let mut sub = svc.watch(&m, opts).await.unwrap();
        let first = sub.events.recv().await.unwrap();
        assert_eq!(first.status.state, MachineState::Created);

        *fake.state.lock() = "Running".to_string();
        let next = tokio::time::timeout(Duration::from_secs(5), sub.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.status.state, MachineState::Running);

        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), sub.errors.recv())
            .await
            .unwrap();
        assert!(matches!(err, Some(Error::Cancelled)));

        fake.shutdown().await;
        svc.delete(&mut m).await.unwrap();
    }
}
