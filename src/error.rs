//! Error types for the peernet fabric controller

use thiserror::Error;

/// Main error type for fabric operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration or resource content
    #[error("validation error: {0}")]
    Validation(String),

    /// Network interface create/query/delete failure
    #[error("device error on {device}: {message}")]
    Device {
        /// Interface name
        device: String,
        /// Underlying cause
        message: String,
        /// The device does not exist
        not_found: bool,
    },

    /// Packet-filter rule or chain failure
    #[error("rule error in {table}/{chain}: {message}")]
    Rule {
        /// Packet-filter table (nat, filter)
        table: String,
        /// Chain the operation targeted
        chain: String,
        /// Underlying cause
        message: String,
        /// The rule or chain does not exist
        not_found: bool,
    },

    /// Kernel route add/delete failure
    #[error("route error for {route}: {message}")]
    Route {
        /// Human-readable route description
        route: String,
        /// Underlying cause
        message: String,
        /// The route does not exist
        not_found: bool,
    },

    /// Malformed IPv4 address or CIDR
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Optimistic-concurrency conflict while persisting a resource
    #[error("persist conflict: {0}")]
    PersistConflict(String),

    /// A host command could not be spawned
    #[error("command error: {program}: {message}")]
    Command {
        /// Program that was executed
        program: String,
        /// Underlying cause
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a device error
    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Device {
            device: device.into(),
            message: message.into(),
            not_found: false,
        }
    }

    /// Create a device error for a missing interface
    pub fn device_not_found(device: impl Into<String>) -> Self {
        Self::Device {
            device: device.into(),
            message: "device does not exist".to_string(),
            not_found: true,
        }
    }

    /// Create a rule error
    pub fn rule(
        table: impl Into<String>,
        chain: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Rule {
            table: table.into(),
            chain: chain.into(),
            message: message.into(),
            not_found: false,
        }
    }

    /// Create a rule error for a missing rule or chain
    pub fn rule_not_found(
        table: impl Into<String>,
        chain: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Rule {
            table: table.into(),
            chain: chain.into(),
            message: message.into(),
            not_found: true,
        }
    }

    /// Create a route error
    pub fn route(route: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Route {
            route: route.into(),
            message: message.into(),
            not_found: false,
        }
    }

    /// Create a route error for a route the kernel does not have
    pub fn route_not_found(route: impl Into<String>) -> Self {
        Self::Route {
            route: route.into(),
            message: "no such route".to_string(),
            not_found: true,
        }
    }

    /// Create an invalid address error
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create a persist conflict error
    pub fn persist_conflict(msg: impl Into<String>) -> Self {
        Self::PersistConflict(msg.into())
    }

    /// Create a command error
    pub fn command(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True when the error reports that the target object is already absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Device { not_found, .. }
            | Error::Rule { not_found, .. }
            | Error::Route { not_found, .. } => *not_found,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// False for failures that repeating the call cannot fix, such as a
    /// rejected request or malformed input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => is_retryable_kube_error(e),
            Error::Validation(_) | Error::InvalidAddress(_) | Error::Serialization(_) => false,
            _ => true,
        }
    }

    /// True when the error is a recoverable write conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::PersistConflict(_) => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }
}

/// Apiserver rejections for authentication, authorization or a malformed
/// request are permanent; everything else may clear up on retry.
pub fn is_retryable_kube_error(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(ae) => !matches!(ae.code, 400 | 401 | 403 | 422),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    // ==========================================================================
    // Story Tests: Error Classification During Reconciliation
    // ==========================================================================
    //
    // Delete-style kernel operations treat "not found" as success, and
    // persist conflicts abandon the pass without surfacing an error. Both
    // decisions hinge on the classifiers below.

    /// Story: Deleting something that is already gone is not a failure
    ///
    /// A rule flushed by an administrator, a route removed with the device,
    /// or a tunnel deleted by hand all land on the "absence already holds" path.
    #[test]
    fn story_missing_kernel_objects_are_classified_as_not_found() {
        assert!(Error::device_not_found("gre0").is_not_found());
        assert!(Error::rule_not_found("nat", "PEERNET-POSTROUTING", "Bad rule").is_not_found());
        assert!(Error::route_not_found("10.1.0.0/16 via 10.255.0.2").is_not_found());
        assert!(api_error(404).is_not_found());

        // Real failures are not swallowed
        assert!(!Error::device("gre0", "operation not permitted").is_not_found());
        assert!(!Error::rule("filter", "FORWARD", "Permission denied").is_not_found());
        assert!(!Error::route("10.1.0.0/16", "Network is unreachable").is_not_found());
        assert!(!Error::invalid_address("10.0.0.300").is_not_found());
    }

    /// Story: Concurrent writers to the same session never surface as errors
    #[test]
    fn story_write_conflicts_are_recoverable() {
        assert!(Error::persist_conflict("session cluster-a modified").is_conflict());
        assert!(api_error(409).is_conflict());
        assert!(!api_error(500).is_conflict());
        assert!(!Error::validation("bad").is_conflict());
    }

    /// Story: Startup calls give up at once when the apiserver refuses them
    #[test]
    fn story_rejected_requests_are_not_retried() {
        assert!(!api_error(401).is_retryable());
        assert!(!api_error(403).is_retryable());
        assert!(!api_error(422).is_retryable());
        assert!(!Error::validation("bad").is_retryable());

        assert!(api_error(503).is_retryable());
        assert!(api_error(429).is_retryable());
        assert!(Error::command("ip", "Resource temporarily unavailable").is_retryable());
    }

    /// Story: Error messages identify where the kernel call failed
    #[test]
    fn story_error_messages_carry_kernel_context() {
        let err = Error::rule("nat", "PEERNET-POSTROUTING", "Permission denied");
        let msg = err.to_string();
        assert!(msg.contains("nat/PEERNET-POSTROUTING"));
        assert!(msg.contains("Permission denied"));

        let err = Error::device("peernet-vxlan", "RTNETLINK answers: Operation not permitted");
        assert!(err.to_string().contains("peernet-vxlan"));

        let err = Error::command("iptables", "No such file or directory");
        assert!(err.to_string().contains("iptables"));
    }

    /// Story: Error helper functions accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let cluster = "cluster-b";
        let err = Error::validation(format!("session {} has no clusterID", cluster));
        assert!(err.to_string().contains("cluster-b"));

        match Error::invalid_address("not-an-ip") {
            Error::InvalidAddress(msg) => assert_eq!(msg, "not-an-ip"),
            _ => panic!("Expected InvalidAddress variant"),
        }
    }
}
