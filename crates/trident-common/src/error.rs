//! Error types for the Trident installer
//!
//! Errors are structured with fields to aid debugging in production. The
//! variants follow how the installer reacts to them: absent objects drive
//! create-vs-patch decisions. Ambiguous cluster state, pods running an
//! unexpected image and terminal custom resource states stop a run.
//! Everything else is retried by the phase-level backoff until the time
//! budget runs out.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for installer operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An optional object does not exist
    #[error("{kind} not found: {message}")]
    NotFound {
        /// Kind of object that was looked up
        kind: String,
        /// What was searched for
        message: String,
    },

    /// More than one object matched where exactly one was expected
    #[error("ambiguous {kind}: {message}")]
    Ambiguous {
        /// Kind of object that matched more than once
        kind: String,
        /// Description of the conflicting matches
        message: String,
    },

    /// An asynchronous condition has not been reached yet
    #[error("{resource} not ready: {message}")]
    NotReady {
        /// Resource being observed (e.g., "operator pod", "CRD")
        resource: String,
        /// Which part of the condition is not met
        message: String,
    },

    /// A pod runs a different image than the one the installer deployed
    #[error("{resource} pod spec reports image {actual}, expected {expected}")]
    ImageMismatch {
        /// Resource whose pod was inspected
        resource: String,
        /// Image the installer expects
        expected: String,
        /// Image found in the pod spec
        actual: String,
    },

    /// A wait condition was not met within its time budget
    #[error("{operation} did not complete within {:.2} seconds; {last_error}", .elapsed.as_secs_f64())]
    Timeout {
        /// Name of the wait that gave up
        operation: String,
        /// Time spent waiting
        elapsed: Duration,
        /// Last error observed by the check
        last_error: Box<Error>,
    },

    /// Marks an error that must stop a backoff loop immediately
    #[error("{source}")]
    Permanent {
        /// The error that ended the retries
        source: Box<Error>,
    },

    /// The managed TridentOrchestrator reached a state it will not leave
    #[error("tridentorchestrator reached a terminal state ({status}); {message}")]
    TerminalState {
        /// Status reported by the custom resource
        status: String,
        /// Status message reported by the custom resource
        message: String,
    },

    /// The requested version is older than the supported floor
    #[error("version {version} is older than the minimum supported version {minimum}")]
    VersionIncompatible {
        /// Version that was requested
        version: String,
        /// Oldest supported version
        minimum: String,
    },

    /// A version string could not be parsed
    #[error("invalid version {input:?}: {message}")]
    InvalidVersion {
        /// The text that failed to parse
        input: String,
        /// Why it failed
        message: String,
    },

    /// The install target is not usable
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A command executed inside a pod failed
    #[error("exec in pod {pod} failed: {message}")]
    Exec {
        /// Pod the command ran in
        pod: String,
        /// Description of the failure
        message: String,
        /// Combined stdout and stderr captured before the failure
        output: String,
    },

    /// An installation phase failed
    #[error("{phase} failed: {source}")]
    Phase {
        /// Name of the phase
        phase: String,
        /// What went wrong inside it
        source: Box<Error>,
    },

    /// The caller cancelled the operation
    #[error("{operation} was cancelled")]
    Cancelled {
        /// Operation that observed the cancellation
        operation: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the given object kind
    pub fn not_found(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create an ambiguous-state error for the given object kind
    pub fn ambiguous(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Ambiguous {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a not-ready error for a resource being waited on
    pub fn not_ready(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotReady {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an exec error carrying the partial output
    pub fn exec(pod: impl Into<String>, msg: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Exec {
            pod: pod.into(),
            message: msg.into(),
            output: output.into(),
        }
    }

    /// Wrap an error with the name of the phase it came from
    pub fn in_phase(phase: impl Into<String>, source: Error) -> Self {
        Self::Phase {
            phase: phase.into(),
            source: Box::new(source),
        }
    }

    /// Mark an error as permanent so backoff loops stop on it
    pub fn permanent(source: Error) -> Self {
        match source {
            already @ Self::Permanent { .. } => already,
            other => Self::Permanent {
                source: Box::new(other),
            },
        }
    }

    /// Create a cancellation error for the given operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error means the object does not exist
    ///
    /// Kubernetes 404 responses count as not-found so callers can branch on
    /// them the same way as on lookups that matched nothing.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::Phase { source, .. } | Error::Permanent { source } => source.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error carries the permanent marker
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Permanent { .. })
    }

    /// Check if a whole installation attempt should be retried after this error
    ///
    /// Ambiguous cluster state, a pod running an unexpected image, terminal
    /// custom resource states, exhausted waits and configuration problems end
    /// the run. Cluster API errors and
    /// conditions that may still change are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::NotFound { .. } => true,
            Error::NotReady { .. } => true,
            Error::Exec { .. } => true,
            Error::Internal { .. } => true,
            Error::Ambiguous { .. } => false,
            Error::ImageMismatch { .. } => false,
            Error::Timeout { .. } => false,
            Error::Permanent { .. } => false,
            Error::TerminalState { .. } => false,
            Error::VersionIncompatible { .. } => false,
            Error::InvalidVersion { .. } => false,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Cancelled { .. } => false,
            Error::Phase { source, .. } => source.is_retryable(),
        }
    }

    /// Strip the permanent marker and phase wrappers, returning the root error
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Permanent { source } | Error::Phase { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: absent objects steer create-vs-patch decisions
    ///
    /// Lookups that match nothing and API 404s are both treated as
    /// "not there yet", including when wrapped by a phase.
    #[test]
    fn story_not_found_drives_create_decisions() {
        let err = Error::not_found("deployment", "no deployments have the label app=x");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("deployment not found"));

        let err: Error = api_error(404).into();
        assert!(err.is_not_found());

        let err: Error = api_error(500).into();
        assert!(!err.is_not_found());

        let wrapped = Error::in_phase("ensure namespace", Error::not_found("namespace", "trident"));
        assert!(wrapped.is_not_found());
    }

    /// Story: ambiguous and terminal states end the run instead of retrying
    #[test]
    fn story_fatal_errors_are_not_retried() {
        assert!(!Error::ambiguous("tridentorchestrator", "2 found").is_retryable());
        assert!(!Error::TerminalState {
            status: "Error".to_string(),
            message: "failed".to_string(),
        }
        .is_retryable());
        assert!(!Error::VersionIncompatible {
            version: "20.04.0".to_string(),
            minimum: "21.01.0".to_string(),
        }
        .is_retryable());
        assert!(!Error::validation("two providers").is_retryable());
        let mismatch = Error::ImageMismatch {
            resource: "pod trident-operator-7d9f".to_string(),
            expected: "registry/trident-operator:24.02.0".to_string(),
            actual: "registry/trident-operator:24.01.0".to_string(),
        };
        assert!(!Error::in_phase("wait for operator", mismatch).is_retryable());
        assert!(!Error::cancelled("install").is_retryable());
    }

    /// Story: transient cluster trouble is retried by the phase backoff
    #[test]
    fn story_transient_errors_are_retried() {
        let err: Error = api_error(503).into();
        assert!(err.is_retryable());
        assert!(Error::not_ready("operator pod", "container is not ready").is_retryable());
        assert!(Error::in_phase("create deployment", api_error(409).into()).is_retryable());
        assert!(!Error::in_phase("wait for CRD", Error::cancelled("wait")).is_retryable());
    }

    /// Story: a timeout tells the operator what was last observed
    #[test]
    fn story_timeout_reports_last_error() {
        let err = Error::Timeout {
            operation: "wait for CRD established".to_string(),
            elapsed: Duration::from_secs(300),
            last_error: Box::new(Error::not_ready("CRD", "Established condition is False")),
        };
        let message = err.to_string();
        assert!(message.contains("300.00 seconds"));
        assert!(message.contains("Established condition is False"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn permanent_marker_is_not_nested() {
        let err = Error::permanent(Error::permanent(Error::validation("bad")));
        match &err {
            Error::Permanent { source } => assert!(!source.is_permanent()),
            other => panic!("expected Permanent, got {other:?}"),
        }
        assert_eq!(err.to_string(), "validation error: bad");
    }

    #[test]
    fn root_cause_unwraps_phase_and_permanent() {
        let err = Error::in_phase(
            "wait for install",
            Error::permanent(Error::TerminalState {
                status: "Uninstalled".to_string(),
                message: String::new(),
            }),
        );
        assert!(matches!(err.root_cause(), Error::TerminalState { .. }));
        assert!(err.to_string().starts_with("wait for install failed"));
    }

    #[test]
    fn exec_error_keeps_output() {
        match Error::exec("trident-controller-0", "exit code 1", "partial output") {
            Error::Exec { output, .. } => assert_eq!(output, "partial output"),
            other => panic!("expected Exec, got {other:?}"),
        }
    }
}
