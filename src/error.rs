//! Error types for unikvm.
//!
//! # Error Message Style Guide
//!
//! All error messages follow a consistent format:
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`
//! - **Case**: All lowercase (Rust convention for error messages)
//! - **Context**: Include the machine UID, driver name or path when available
//!
//! ```text
//! "qemu start failed: control socket refused connection"
//! "machine not found: 3f2a..."
//! "invalid config: network gateway is required"
//! ```
//!
//! Errors fall into a few classes that callers treat differently:
//! configuration errors are surfaced verbatim and never retried,
//! not-found errors are success during teardown (see [`Error::is_not_found`]),
//! aggregates name every underlying failure, and [`Error::NotImplemented`]
//! is never folded into a recoverable-looking driver error.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using unikvm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in unikvm operations.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Caller supplied an invalid specification.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Kernel image is missing or unreadable.
    #[error("kernel not found: {}", path.display())]
    KernelNotFound {
        /// Path that was not found.
        path: PathBuf,
    },

    /// Architecture is not supported by the selected driver.
    #[error("unsupported architecture for {driver}: {arch}")]
    UnsupportedArchitecture {
        /// Driver that rejected the architecture.
        driver: String,
        /// Requested architecture.
        arch: String,
    },

    // ========================================================================
    // Machine Errors
    // ========================================================================
    /// Machine not found by UID or name.
    #[error("machine not found: {id}")]
    MachineNotFound {
        /// UID or name of the machine.
        id: String,
    },

    /// Machine is in a state that does not allow the operation.
    #[error("invalid machine state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// A backend was handed another backend's platform configuration.
    #[error("wrong platform config: expected {expected}, got {actual}")]
    WrongPlatform {
        /// Driver that received the config.
        expected: String,
        /// Driver the config belongs to.
        actual: String,
    },

    // ========================================================================
    // Driver Errors
    // ========================================================================
    /// A hypervisor driver operation failed.
    #[error("{driver} {operation} failed: {reason}")]
    Driver {
        /// Driver name (e.g. "qemu").
        driver: String,
        /// The operation that failed (e.g. "start", "connect").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The driver does not implement the operation.
    #[error("{operation} is not implemented by the {driver} driver")]
    NotImplemented {
        /// Driver name.
        driver: String,
        /// Unsupported operation.
        operation: String,
    },

    /// No driver is registered under the name.
    #[error("driver not found: {0}")]
    DriverNotFound(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// How long we waited.
        duration: Duration,
    },

    /// Several independent operations failed.
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<(String, Error)>),

    // ========================================================================
    // Stream Errors
    // ========================================================================
    /// A watch stream was cancelled by its caller.
    #[error("watch cancelled")]
    Cancelled,

    /// The end of a log stream was reached.
    #[error("end of stream")]
    EndOfStream,

    // ========================================================================
    // Network and Volume Errors
    // ========================================================================
    /// Network operation failed.
    #[error("network operation failed: {operation}: {reason}")]
    Network {
        /// The operation that failed (e.g. "create bridge").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Network not found by UID or name.
    #[error("network not found: {0}")]
    NetworkNotFound(String),

    /// Interface still answers liveness probes.
    #[error("interface in use: {name} ({addr}) still responds")]
    InterfaceInUse {
        /// Interface name.
        name: String,
        /// Address that answered.
        addr: String,
    },

    /// Volume operation failed.
    #[error("volume operation failed: {operation}: {reason}")]
    Volume {
        /// The operation that failed.
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Volume not found by UID or name.
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    /// Volume is bound to a machine and cannot be removed.
    #[error("volume is bound: {0}")]
    VolumeBound(String),

    // ========================================================================
    // Store Errors
    // ========================================================================
    /// Database operation failed.
    #[error("database operation failed: {operation}: {reason}")]
    Database {
        /// The operation that failed (e.g. "open", "read", "write").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Record (de)serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // ========================================================================
    // Command Execution Errors
    // ========================================================================
    /// External command failed.
    #[error("command '{command}' failed: {reason}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message or reason for failure.
        reason: String,
    },

    // ========================================================================
    // IO Errors
    // ========================================================================
    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

fn format_aggregate(errors: &[(String, Error)]) -> String {
    let parts: Vec<String> = errors
        .iter()
        .map(|(source, err)| format!("{}: {}", source, err))
        .collect();
    format!("{} operations failed: {}", errors.len(), parts.join("; "))
}

impl Error {
    // ========================================================================
    // Constructors
    // ========================================================================

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Create a machine not found error.
    pub fn machine_not_found(id: impl Into<String>) -> Self {
        Self::MachineNotFound { id: id.into() }
    }

    /// Create a driver operation error.
    pub fn driver(
        driver: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Driver {
            driver: driver.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-implemented error.
    pub fn not_implemented(driver: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotImplemented {
            driver: driver.into(),
            operation: operation.into(),
        }
    }

    /// Create a network operation error.
    pub fn network(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a volume operation error.
    pub fn volume(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Volume {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a database operation error.
    pub fn database(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Database {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Collapse a list of failures into one error.
    ///
    /// A single failure is returned as-is so callers keep the precise variant.
    pub fn aggregate(mut errors: Vec<(String, Error)>) -> Self {
        if errors.len() == 1 {
            return errors.remove(0).1;
        }
        Self::Aggregate(errors)
    }

    // ========================================================================
    // Classification
    // ========================================================================

    /// Whether the error means the resource is already absent.
    ///
    /// Teardown paths treat these as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::MachineNotFound { .. }
            | Self::NetworkNotFound(_)
            | Self::VolumeNotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Whether the error is an explicit not-implemented signal.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Machine Error Tests
    // ========================================================================

    #[test]
    fn test_machine_not_found_includes_id() {
        let err = Error::machine_not_found("3f2a-uid");
        let msg = err.to_string();
        assert!(msg.contains("3f2a-uid"), "Error should include machine id");
        assert!(msg.contains("not found"), "Error should indicate not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_driver_error_includes_driver_and_operation() {
        let err = Error::driver("qemu", "start", "control socket refused");
        let msg = err.to_string();
        assert_eq!(msg, "qemu start failed: control socket refused");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_implemented_is_distinct() {
        let err = Error::not_implemented("firecracker", "pause");
        assert!(err.is_not_implemented());
        assert!(err.to_string().contains("not implemented"));
        assert!(!Error::driver("firecracker", "pause", "x").is_not_implemented());
    }

    #[test]
    fn test_kernel_not_found_includes_path() {
        let err = Error::KernelNotFound {
            path: PathBuf::from("/no/such/kernel"),
        };
        assert!(err.to_string().contains("/no/such/kernel"));
    }

    // ========================================================================
    // Aggregate Tests
    // ========================================================================

    #[test]
    fn test_aggregate_names_every_failure() {
        let err = Error::aggregate(vec![
            ("qemu".to_string(), Error::machine_not_found("a")),
            ("firecracker".to_string(), Error::machine_not_found("a")),
            ("xen".to_string(), Error::driver("xen", "get", "no xenstore")),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("3 operations failed"));
        assert!(msg.contains("qemu:"));
        assert!(msg.contains("firecracker:"));
        assert!(msg.contains("xen: xen get failed: no xenstore"));
    }

    #[test]
    fn test_aggregate_of_one_keeps_variant() {
        let err = Error::aggregate(vec![("qemu".to_string(), Error::machine_not_found("a"))]);
        assert!(matches!(err, Error::MachineNotFound { .. }));
    }

    #[test]
    fn test_io_not_found_is_not_found() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!err.is_not_found());
    }

    // ========================================================================
    // Error Message Format Consistency Tests
    // ========================================================================

    #[test]
    fn test_all_errors_are_lowercase() {
        let errors: Vec<Error> = vec![
            Error::invalid_config("test"),
            Error::machine_not_found("test"),
            Error::driver("qemu", "op", "reason"),
            Error::not_implemented("qemu", "op"),
            Error::network("op", "reason"),
            Error::volume("op", "reason"),
            Error::database("op", "reason"),
            Error::command_failed("ip", "reason"),
            Error::Cancelled,
            Error::EndOfStream,
        ];

        for err in errors {
            let msg = err.to_string();
            let first_char = msg.chars().next().unwrap();
            assert!(
                first_char.is_lowercase(),
                "Error message should start lowercase: {}",
                msg
            );
        }
    }
}
