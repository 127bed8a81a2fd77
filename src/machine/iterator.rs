//! A machine service over every registered backend.
//!
//! Callers that only hold a UID do not know which backend created the
//! machine. The iterator asks each backend in registration order and
//! returns the first success; if none succeeds, the error names every
//! backend's failure.

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::machine::{LogOptions, Machine, MachineService, Registry, WatchOptions};
use crate::store::Store;
use crate::watch::Subscription;
use async_trait::async_trait;
use std::sync::Arc;

/// Name reported by the iterator itself.
pub const ITERATOR_NAME: &str = "all";

#[derive(Debug, Clone, Copy)]
enum Op {
    Create,
    Start,
    Pause,
    Stop,
    Update,
    Delete,
    Get,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Start => "start",
            Op::Pause => "pause",
            Op::Stop => "stop",
            Op::Update => "update",
            Op::Delete => "delete",
            Op::Get => "get",
        }
    }

    async fn call(self, service: &dyn MachineService, machine: &mut Machine) -> Result<()> {
        match self {
            Op::Create => service.create(machine).await,
            Op::Start => service.start(machine).await,
            Op::Pause => service.pause(machine).await,
            Op::Stop => service.stop(machine).await,
            Op::Update => service.update(machine).await,
            Op::Delete => service.delete(machine).await,
            Op::Get => service.get(machine).await,
        }
    }
}

/// Whether a backend simply does not own the machine.
fn is_miss(err: &Error) -> bool {
    err.is_not_found()
        || err.is_not_implemented()
        || matches!(
            err,
            Error::WrongPlatform { .. } | Error::UnsupportedArchitecture { .. }
        )
}

/// Composite service trying every backend in turn.
pub struct MachineIterator {
    services: Vec<Arc<dyn MachineService>>,
}

impl std::fmt::Debug for MachineIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineIterator")
            .field("services", &self.names())
            .finish()
    }
}

impl MachineIterator {
    /// Compose the given services.
    pub fn new(services: Vec<Arc<dyn MachineService>>) -> Self {
        Self { services }
    }

    /// Compose every backend of `registry`.
    pub fn from_registry(registry: &Registry, config: &Arc<HostConfig>, store: &Store) -> Result<Self> {
        Ok(Self::new(registry.services(config, store)?))
    }

    /// Backend names, in order.
    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    async fn first_success(&self, op: Op, machine: &mut Machine) -> Result<()> {
        let mut errors = Vec::with_capacity(self.services.len());
        let mut attempted = None;

        for service in &self.services {
            let mut candidate = machine.clone();
            match op.call(service.as_ref(), &mut candidate).await {
                Ok(()) => {
                    tracing::debug!(
                        driver = service.name(),
                        machine = %candidate.uid,
                        operation = op.name(),
                        "backend accepted operation"
                    );
                    *machine = candidate;
                    return Ok(());
                }
                Err(e) => {
                    if is_miss(&e) {
                        tracing::debug!(driver = service.name(), error = %e, "backend skipped");
                    } else {
                        tracing::warn!(
                            driver = service.name(),
                            operation = op.name(),
                            error = %e,
                            "backend failed"
                        );
                        attempted = Some(candidate);
                    }
                    errors.push((service.name().to_string(), e));
                }
            }
        }

        // Keep the status left by a backend that actually tried.
        if let Some(candidate) = attempted {
            *machine = candidate;
        }
        if errors.is_empty() {
            return Err(Error::DriverNotFound(ITERATOR_NAME.to_string()));
        }
        Err(Error::aggregate(errors))
    }

    /// Find the backend that answers `get` for the machine.
    async fn owner(&self, machine: &Machine) -> Result<(Arc<dyn MachineService>, Machine)> {
        let mut errors = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let mut candidate = machine.clone();
            match service.get(&mut candidate).await {
                Ok(()) => return Ok((service.clone(), candidate)),
                Err(e) => errors.push((service.name().to_string(), e)),
            }
        }
        if errors.is_empty() {
            return Err(Error::DriverNotFound(ITERATOR_NAME.to_string()));
        }
        Err(Error::aggregate(errors))
    }
}

#[async_trait]
impl MachineService for MachineIterator {
    fn name(&self) -> &str {
        ITERATOR_NAME
    }

    async fn create(&self, machine: &mut Machine) -> Result<()> {
        self.first_success(Op::Create, machine).await
    }

    async fn start(&self, machine: &mut Machine) -> Result<()> {
        self.first_success(Op::Start, machine).await
    }

    async fn pause(&self, machine: &mut Machine) -> Result<()> {
        self.first_success(Op::Pause, machine).await
    }

    async fn stop(&self, machine: &mut Machine) -> Result<()> {
        self.first_success(Op::Stop, machine).await
    }

    async fn update(&self, machine: &mut Machine) -> Result<()> {
        self.first_success(Op::Update, machine).await
    }

    async fn delete(&self, machine: &mut Machine) -> Result<()> {
        self.first_success(Op::Delete, machine).await
    }

    async fn get(&self, machine: &mut Machine) -> Result<()> {
        self.first_success(Op::Get, machine).await
    }

    /// Concatenate every backend's machines.
    ///
    /// A failing backend is skipped; the call only fails if all of them do.
    async fn list(&self) -> Result<Vec<Machine>> {
        let mut machines = Vec::new();
        let mut errors = Vec::new();
        for service in &self.services {
            match service.list().await {
                Ok(items) => machines.extend(items),
                Err(e) => {
                    tracing::warn!(driver = service.name(), error = %e, "list failed");
                    errors.push((service.name().to_string(), e));
                }
            }
        }
        if !self.services.is_empty() && errors.len() == self.services.len() {
            return Err(Error::aggregate(errors));
        }
        Ok(machines)
    }

    async fn watch(&self, machine: &Machine, opts: WatchOptions) -> Result<Subscription<Machine>> {
        let (service, current) = self.owner(machine).await?;
        service.watch(&current, opts).await
    }

    async fn logs(&self, machine: &Machine, opts: LogOptions) -> Result<Subscription<String>> {
        let (service, current) = self.owner(machine).await?;
        service.logs(&current, opts).await
    }
}
