//! The uniform machine lifecycle contract.
//!
//! Every backend implements [`MachineService`]. The helpers below carry
//! the parts that are the same for all of them: default resources, the
//! state directory layout, ownership checks against the store and the
//! liveness-first reconciliation of persisted and live state.

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::machine::{Machine, MachineState};
use crate::process;
use crate::store::Store;
use crate::watch::Subscription;
use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// File name of the guest console log inside the state directory.
pub const LOG_FILE_NAME: &str = "machine.log";

/// File name of the hypervisor pid file inside the state directory.
pub const PID_FILE_NAME: &str = "machine.pid";

/// Options for [`MachineService::watch`].
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Ends the stream.
    pub cancel: CancellationToken,
    /// Keep streaming after the guest shuts down.
    pub keep_observing: bool,
}

/// Options for [`MachineService::logs`].
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Ends the stream.
    pub cancel: CancellationToken,
    /// Keep emitting lines as they are written.
    pub follow: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            follow: true,
        }
    }
}

/// Lifecycle operations every backend provides.
///
/// Operations take the machine by mutable reference and leave the latest
/// known status in it, also when they fail.
#[async_trait]
pub trait MachineService: Send + Sync {
    /// Backend name.
    fn name(&self) -> &str;

    /// Allocate resources and launch the guest in a created, not-running state.
    async fn create(&self, machine: &mut Machine) -> Result<()>;

    /// Boot or resume the guest.
    async fn start(&self, machine: &mut Machine) -> Result<()>;

    /// Suspend guest execution.
    async fn pause(&self, machine: &mut Machine) -> Result<()> {
        let _ = machine;
        Err(Error::not_implemented(self.name(), "pause"))
    }

    /// Shut the guest down. Stopping an exited machine succeeds.
    async fn stop(&self, machine: &mut Machine) -> Result<()>;

    /// Persist a changed specification.
    async fn update(&self, machine: &mut Machine) -> Result<()>;

    /// Remove every host resource of the machine.
    async fn delete(&self, machine: &mut Machine) -> Result<()>;

    /// Reconcile the persisted status with the live guest.
    async fn get(&self, machine: &mut Machine) -> Result<()>;

    /// Every machine owned by this backend, reconciled.
    async fn list(&self) -> Result<Vec<Machine>>;

    /// Stream state changes, starting with the current state.
    async fn watch(&self, machine: &Machine, opts: WatchOptions) -> Result<Subscription<Machine>>;

    /// Stream console lines from the start of the log.
    async fn logs(&self, machine: &Machine, opts: LogOptions) -> Result<Subscription<String>>;
}

// ============================================================================
// Create helpers
// ============================================================================

/// State directory of a machine. Derived from the UID only.
pub fn state_dir(runtime_dir: &Path, uid: &str) -> PathBuf {
    runtime_dir.join(uid)
}

/// Resolve defaults and host paths for a new machine.
///
/// Fills in unset resources, resolves the kernel and initrd, and assigns
/// the state directory and log file once. Fails before anything is
/// allocated if the kernel or initrd is missing.
pub fn prepare(config: &HostConfig, machine: &mut Machine) -> Result<()> {
    let resources = &mut machine.spec.resources;
    resources.memory.get_or_insert(config.default_memory);
    match resources.cpus {
        Some(0) => return Err(Error::invalid_config("cpus must be at least 1")),
        Some(_) => {}
        None => resources.cpus = Some(config.default_cpus),
    }

    let kernel = resolve_image(&machine.spec.kernel)?;
    let initrd = match &machine.spec.initrd {
        Some(path) => Some(resolve_image(path)?),
        None => None,
    };

    if machine.status.state_dir.as_os_str().is_empty() {
        machine.status.state_dir = state_dir(&config.runtime_dir, &machine.uid);
    }
    if machine.status.log_file.as_os_str().is_empty() {
        machine.status.log_file = machine.status.state_dir.join(LOG_FILE_NAME);
    }
    machine.status.kernel_path = Some(kernel);
    machine.status.initrd_path = initrd;

    std::fs::create_dir_all(&machine.status.state_dir)?;
    Ok(())
}

fn resolve_image(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(Error::invalid_config("kernel path is required"));
    }
    let resolved = path.canonicalize().map_err(|_| Error::KernelNotFound {
        path: path.to_path_buf(),
    })?;
    std::fs::File::open(&resolved).map_err(|_| Error::KernelNotFound {
        path: path.to_path_buf(),
    })?;
    Ok(resolved)
}

/// Reject a machine that asks for another backend.
pub fn check_platform(driver: &str, machine: &Machine) -> Result<()> {
    match &machine.spec.platform {
        Some(p) if p != driver => Err(Error::WrongPlatform {
            expected: driver.to_string(),
            actual: p.clone(),
        }),
        _ => Ok(()),
    }
}

/// Mark a machine failed after a launch or boot error and persist it best-effort.
pub fn mark_failed(store: &Store, machine: &mut Machine, err: &Error) {
    tracing::warn!(machine = %machine.uid, error = %err, "machine failed");
    machine.status.state = MachineState::Failed;
    machine.status.exited_at.get_or_insert_with(Utc::now);
    machine.status.exit_code.get_or_insert(1);
    if let Err(e) = persist(store, machine) {
        tracing::warn!(machine = %machine.uid, error = %e, "failed to persist failed state");
    }
}

/// Kill a freshly launched process whose boot failed and record the
/// machine as failed, so the store never points at a stale pid.
pub async fn abandon(store: &Store, machine: &mut Machine, pid: i32, err: &Error) {
    process::kill(pid);
    let _ = process::wait_for_exit(pid, process::SIGKILL_WAIT).await;
    mark_failed(store, machine, err);
}

/// Save the machine record and its state.
pub fn persist(store: &Store, machine: &Machine) -> Result<()> {
    store.save_machine(machine)?;
    store.save_state(&machine.uid, machine.status.state)?;
    if let Some(config) = &machine.status.platform_config {
        store.save_driver_config(&machine.uid, config)?;
    }
    Ok(())
}

// ============================================================================
// Ownership
// ============================================================================

/// Replace `machine` with the stored record if `driver` owns it.
///
/// Returns [`Error::MachineNotFound`] if the store has no such machine and
/// [`Error::WrongPlatform`] if another backend owns it.
pub fn load_owned(store: &Store, driver: &str, machine: &mut Machine) -> Result<()> {
    let stored = store
        .lookup_machine(&machine.uid)?
        .ok_or_else(|| Error::machine_not_found(&machine.uid))?;
    match stored.driver() {
        Some(d) if d == driver => {
            *machine = stored;
            Ok(())
        }
        Some(d) => Err(Error::WrongPlatform {
            expected: driver.to_string(),
            actual: d.to_string(),
        }),
        None => Err(Error::machine_not_found(&machine.uid)),
    }
}

/// Every stored machine owned by `driver`.
pub fn owned_machines(store: &Store, driver: &str) -> Result<Vec<Machine>> {
    Ok(store
        .list_machines()?
        .into_iter()
        .filter(|m| m.driver() == Some(driver))
        .collect())
}

/// Reconcile each machine, keeping the persisted status of any that fail.
pub async fn list_reconciled<S>(service: &S, machines: Vec<Machine>) -> Vec<Machine>
where
    S: MachineService + ?Sized,
{
    let mut out = Vec::with_capacity(machines.len());
    for mut machine in machines {
        let cached = machine.clone();
        if let Err(e) = service.get(&mut machine).await {
            tracing::warn!(
                driver = service.name(),
                machine = %cached.uid,
                error = %e,
                "reconcile failed, keeping persisted status"
            );
            machine = cached;
        }
        out.push(machine);
    }
    out
}

// ============================================================================
// Reconciliation
// ============================================================================

/// What the native status channel reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The channel answered with a mapped state.
    State(MachineState),
    /// The channel is gone although the process is alive.
    Gone,
}

/// Reconcile persisted and live state.
///
/// Process liveness is checked first; only a live process is asked for its
/// native status through `query`. The record is written back only if the
/// state or one of the timestamps/exit code changed.
pub async fn reconcile<F, Fut>(store: &Store, machine: &mut Machine, query: F) -> Result<()>
where
    F: FnOnce(i32) -> Fut,
    Fut: Future<Output = Result<Probe>>,
{
    let before = snapshot(machine);
    let status = &mut machine.status;

    match status.pid {
        Some(pid) if process::is_alive(pid) => match query(pid).await? {
            Probe::State(state) => {
                status.state = state;
                if state == MachineState::Running {
                    status.started_at.get_or_insert_with(Utc::now);
                }
                if state.is_terminal() {
                    status.exited_at.get_or_insert_with(Utc::now);
                    status.exit_code.get_or_insert(0);
                }
            }
            Probe::Gone => {
                status.state = MachineState::Dead;
                status.exited_at.get_or_insert_with(Utc::now);
                status.exit_code = Some(1);
            }
        },
        Some(pid) => {
            if !status.state.is_terminal() {
                status.state = MachineState::Exited;
            }
            let reaped = process::try_wait(pid);
            let fallback = if status.state == MachineState::Exited { 0 } else { 1 };
            status
                .exit_code
                .get_or_insert(reaped.unwrap_or(fallback));
            status.exited_at.get_or_insert_with(Utc::now);
        }
        // Never launched: nothing live to consult.
        None => {}
    }

    if snapshot(machine) != before {
        tracing::info!(
            machine = %machine.uid,
            from = %before.0,
            to = %machine.status.state,
            "machine state changed"
        );
        persist(store, machine)?;
    }
    Ok(())
}

type Snapshot = (
    MachineState,
    Option<chrono::DateTime<Utc>>,
    Option<chrono::DateTime<Utc>>,
    Option<i32>,
);

fn snapshot(machine: &Machine) -> Snapshot {
    let s = &machine.status;
    (s.state, s.started_at, s.exited_at, s.exit_code)
}

/// Record a completed stop. Keeps an earlier exit time.
pub fn mark_exited(machine: &mut Machine, exit_code: i32) {
    let status = &mut machine.status;
    if status.state != MachineState::Failed && status.state != MachineState::Dead {
        status.state = MachineState::Exited;
    }
    status.exited_at.get_or_insert_with(Utc::now);
    status.exit_code.get_or_insert(exit_code.max(0));
}

/// Record a successful start.
pub fn mark_running(machine: &mut Machine, pid: i32) {
    let status = &mut machine.status;
    status.state = MachineState::Running;
    status.pid = Some(pid);
    status.started_at = Some(Utc::now());
    status.exited_at = None;
    status.exit_code = None;
}

/// Remove the state directory and logs of a machine and purge its records.
///
/// Already-absent resources are skipped; every other failure is collected.
pub fn remove_state(store: &Store, machine: &Machine, extra: &[PathBuf]) -> Result<()> {
    let mut errors = Vec::new();

    if !machine.status.log_file.as_os_str().is_empty() {
        if let Err(e) = crate::log_rotation::cleanup_logs(&machine.status.log_file) {
            errors.push(("logs".to_string(), Error::from(e)));
        }
    }
    for path in extra {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => errors.push((path.display().to_string(), Error::from(e))),
        }
    }
    if !machine.status.state_dir.as_os_str().is_empty() {
        match std::fs::remove_dir_all(&machine.status.state_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => errors.push(("state directory".to_string(), Error::from(e))),
        }
    }
    if let Err(e) = store.purge(&machine.uid) {
        errors.push(("store".to_string(), e));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::aggregate(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::qemu::QemuConfig;
    use crate::machine::{MachineSpec, PlatformConfig, Quantity};
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, HostConfig, Store) {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::with_root(dir.path());
        let store = config.open_store().unwrap();
        (dir, config, store)
    }

    fn machine_with_kernel(dir: &TempDir) -> Machine {
        let kernel = dir.path().join("kernel");
        std::fs::write(&kernel, b"\x7fELF").unwrap();
        Machine::new(
            "test",
            MachineSpec {
                kernel,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_prepare_applies_defaults() {
        let (dir, config, _store) = setup();
        let mut m = machine_with_kernel(&dir);
        prepare(&config, &mut m).unwrap();

        assert_eq!(m.spec.resources.memory, Some(Quantity::mebibytes(64)));
        assert_eq!(m.spec.resources.memory.unwrap().to_string(), "64Mi");
        assert_eq!(m.spec.resources.cpus, Some(1));
        assert_eq!(m.status.state_dir, config.runtime_dir.join(&m.uid));
        assert_eq!(m.status.log_file, m.status.state_dir.join(LOG_FILE_NAME));
        assert!(m.status.state_dir.is_dir());
    }

    #[test]
    fn test_prepare_keeps_explicit_resources_and_paths() {
        let (dir, config, _store) = setup();
        let mut m = machine_with_kernel(&dir);
        m.spec.resources.memory = Some(Quantity::mebibytes(256));
        m.spec.resources.cpus = Some(4);
        prepare(&config, &mut m).unwrap();
        let first = m.status.state_dir.clone();
        prepare(&config, &mut m).unwrap();

        assert_eq!(m.spec.resources.memory, Some(Quantity::mebibytes(256)));
        assert_eq!(m.spec.resources.cpus, Some(4));
        assert_eq!(m.status.state_dir, first);
    }

    #[test]
    fn test_prepare_missing_kernel() {
        let (dir, config, _store) = setup();
        let mut m = machine_with_kernel(&dir);
        m.spec.kernel = dir.path().join("missing");
        let err = prepare(&config, &mut m).unwrap_err();
        assert!(matches!(err, Error::KernelNotFound { .. }));
        assert!(!config.runtime_dir.join(&m.uid).exists());
    }

    #[test]
    fn test_check_platform() {
        let mut m = Machine::new("x", MachineSpec::default());
        assert!(check_platform("qemu", &m).is_ok());
        m.spec.platform = Some("firecracker".to_string());
        assert!(matches!(
            check_platform("qemu", &m),
            Err(Error::WrongPlatform { .. })
        ));
    }

    #[test]
    fn test_load_owned() {
        let (_dir, _config, store) = setup();
        let mut m = Machine::new("x", MachineSpec::default());
        m.status.platform_config = Some(PlatformConfig::Qemu(QemuConfig::default()));
        store.save_machine(&m).unwrap();

        let mut r = Machine::reference(&m.uid);
        load_owned(&store, "qemu", &mut r).unwrap();
        assert_eq!(r.name, "x");

        let mut r = Machine::reference(&m.uid);
        assert!(matches!(
            load_owned(&store, "firecracker", &mut r),
            Err(Error::WrongPlatform { .. })
        ));

        let mut r = Machine::reference("nope");
        assert!(load_owned(&store, "qemu", &mut r).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_reconcile_dead_process_forces_exited_without_query() {
        let (_dir, _config, store) = setup();
        let mut m = Machine::new("x", MachineSpec::default());
        m.status.state = MachineState::Running;
        m.status.pid = Some(999_999_999);

        reconcile(&store, &mut m, |_| async {
            Err(Error::invalid_config("native channel consulted for a dead process"))
        })
        .await
        .unwrap();

        assert_eq!(m.status.state, MachineState::Exited);
        assert!(m.status.exited_at.is_some());
        assert_eq!(m.status.exit_code, Some(0));
        assert_eq!(store.lookup_state(&m.uid).unwrap(), Some(MachineState::Exited));
    }

    #[tokio::test]
    async fn test_reconcile_live_process_uses_native_status() {
        let (_dir, _config, store) = setup();
        let mut m = Machine::new("x", MachineSpec::default());
        m.status.state = MachineState::Created;
        m.status.pid = Some(unsafe { libc::getpid() });

        reconcile(&store, &mut m, |_| async { Ok(Probe::State(MachineState::Running)) })
            .await
            .unwrap();
        assert_eq!(m.status.state, MachineState::Running);
        assert!(m.status.started_at.is_some());

        reconcile(&store, &mut m, |_| async { Ok(Probe::Gone) })
            .await
            .unwrap();
        assert_eq!(m.status.state, MachineState::Dead);
        assert_eq!(m.status.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_reconcile_skips_write_when_unchanged() {
        let (_dir, _config, store) = setup();
        let mut m = Machine::new("x", MachineSpec::default());
        m.status.state = MachineState::Created;

        reconcile(&store, &mut m, |_| async { Ok(Probe::Gone) })
            .await
            .unwrap();
        assert!(store.lookup_machine(&m.uid).unwrap().is_none());
    }

    #[test]
    fn test_mark_exited_keeps_first_exit_time() {
        let mut m = Machine::new("x", MachineSpec::default());
        mark_exited(&mut m, 0);
        let first = m.status.exited_at;
        std::thread::sleep(Duration::from_millis(5));
        mark_exited(&mut m, 0);
        assert_eq!(m.status.exited_at, first);
        assert_eq!(m.status.state, MachineState::Exited);
    }

    #[test]
    fn test_remove_state_tolerates_absent_resources() {
        let (dir, config, store) = setup();
        let mut m = machine_with_kernel(&dir);
        prepare(&config, &mut m).unwrap();
        std::fs::write(&m.status.log_file, b"log").unwrap();
        persist(&store, &m).unwrap();

        remove_state(&store, &m, &[m.status.state_dir.join("gone.sock")]).unwrap();
        assert!(!m.status.state_dir.exists());
        assert!(store.lookup_machine(&m.uid).unwrap().is_none());

        remove_state(&store, &m, &[]).unwrap();
    }
}
