//! Error types for the motion-capture client.
//!
//! Every public operation returns [`Result`], and every [`CortexError`] maps onto
//! one of the host SDK's legacy [`ReturnCode`]s so callers that reason in return
//! codes can keep doing so.
//!
//! ## Error Categories
//!
//! - **General**: socket faults and anything without a more specific home
//! - **Api**: misuse, such as starting a session twice or malformed arguments
//! - **Network**: address resolution, bind and connect failures
//! - **Timeout**: no correlated reply within the deadline
//! - **Memory**: allocation failure while resizing or copying a frame
//! - **Unrecognized**: the host understood the transport but rejected the command
//! - **Protocol**: malformed datagrams (reported as a general error)
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use cortex_stream::{CortexError, ReturnCode};
//!
//! let error = CortexError::network_error("host name did not resolve");
//! assert_eq!(error.return_code(), ReturnCode::NetworkError);
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T, E = CortexError> = std::result::Result<T, E>;

/// Legacy return codes of the host SDK.
///
/// The numeric values match the codes exchanged on the wire and in the host's
/// own tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum ReturnCode {
    Okay = 0,
    GeneralError = 1,
    ApiError = 2,
    NetworkError = 3,
    TimeOut = 4,
    MemoryError = 5,
    Unrecognized = 6,
}

impl ReturnCode {
    /// Decode a wire value. Unknown codes collapse to `GeneralError`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ReturnCode::Okay,
            2 => ReturnCode::ApiError,
            3 => ReturnCode::NetworkError,
            4 => ReturnCode::TimeOut,
            5 => ReturnCode::MemoryError,
            6 => ReturnCode::Unrecognized,
            _ => ReturnCode::GeneralError,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_okay(self) -> bool {
        self == ReturnCode::Okay
    }
}

/// Main error type for client operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CortexError {
    #[error("General error: {context}")]
    General {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid use of the API: {reason}")]
    Api { reason: String },

    #[error("Network error: {reason}")]
    Network {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("No response from host after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Memory allocation failed while {context} ({requested} elements)")]
    Memory { context: String, requested: usize },

    #[error("Host did not recognize request '{command}'")]
    Unrecognized { command: String },

    #[error("Protocol error in {context}: {details}")]
    Protocol { context: String, details: String },
}

impl CortexError {
    /// The legacy return code this error corresponds to.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            CortexError::General { .. } => ReturnCode::GeneralError,
            CortexError::Api { .. } => ReturnCode::ApiError,
            CortexError::Network { .. } => ReturnCode::NetworkError,
            CortexError::Timeout { .. } => ReturnCode::TimeOut,
            CortexError::Memory { .. } => ReturnCode::MemoryError,
            CortexError::Unrecognized { .. } => ReturnCode::Unrecognized,
            CortexError::Protocol { .. } => ReturnCode::GeneralError,
        }
    }

    /// Returns whether this error is potentially recoverable through retry.
    ///
    /// Timeouts and unrecognized commands leave the session usable; network
    /// failures during start are retried with a fresh start.
    pub fn is_retryable(&self) -> bool {
        match self {
            CortexError::General { .. } => true,
            CortexError::Network { .. } => true,
            CortexError::Timeout { .. } => true,
            CortexError::Memory { .. } => true,
            CortexError::Api { .. } => false,
            CortexError::Unrecognized { .. } => false,
            CortexError::Protocol { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            CortexError::General { .. } => vec![
                "Check that the host machine is reachable",
                "Restart the session",
            ],
            CortexError::Api { .. } => vec![
                "Apply configuration before starting the session",
                "Check argument ranges and shapes",
            ],
            CortexError::Network { .. } => vec![
                "Verify NIC and host addresses",
                "Check that configured ports are free",
                "Check firewall rules for UDP and multicast traffic",
            ],
            CortexError::Timeout { .. } => vec![
                "Increase the request timeout or the minimum timeout",
                "Verify the host is running and not busy",
            ],
            CortexError::Memory { .. } => vec![
                "Release retained frame copies",
                "Check the host is not sending oversized frames",
            ],
            CortexError::Unrecognized { .. } => vec![
                "Check the command spelling",
                "Verify the host version supports the command",
            ],
            CortexError::Protocol { .. } => vec![
                "Check that host and client protocol versions match",
                "Verify nothing else is sending to the same port",
            ],
        }
    }

    /// Helper constructor for general errors.
    pub fn general(context: impl Into<String>) -> Self {
        CortexError::General { context: context.into(), source: None }
    }

    /// Helper constructor for general errors with a source.
    pub fn general_with_source(
        context: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        CortexError::General { context: context.into(), source: Some(source) }
    }

    /// Helper constructor for API misuse.
    pub fn api_misuse(reason: impl Into<String>) -> Self {
        CortexError::Api { reason: reason.into() }
    }

    /// Helper constructor for network errors.
    pub fn network_error(reason: impl Into<String>) -> Self {
        CortexError::Network { reason: reason.into(), source: None }
    }

    /// Helper constructor for network errors with a source.
    pub fn network_error_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        CortexError::Network { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for allocation failures.
    pub fn allocation_failed(context: impl Into<String>, requested: usize) -> Self {
        CortexError::Memory { context: context.into(), requested }
    }

    /// Helper constructor for malformed datagrams.
    pub fn protocol(context: impl Into<String>, details: impl Into<String>) -> Self {
        CortexError::Protocol { context: context.into(), details: details.into() }
    }
}

impl From<std::io::Error> for CortexError {
    fn from(err: std::io::Error) -> Self {
        CortexError::General { context: "socket operation failed".to_string(), source: Some(Box::new(err)) }
    }
}

impl From<&CortexError> for ReturnCode {
    fn from(err: &CortexError) -> Self {
        err.return_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_contain_their_context(
            reason in ".*",
            command in "\\w+",
            requested in 0usize..1_000_000usize,
            duration_ms in 1u64..60000u64
          ) {
            let api = CortexError::api_misuse(reason.clone());
            let network = CortexError::network_error(reason.clone());
            let unrecognized = CortexError::Unrecognized { command: command.clone() };
            let memory = CortexError::allocation_failed("resizing markers", requested);
            let timeout = CortexError::Timeout { duration: Duration::from_millis(duration_ms) };

            prop_assert!(api.to_string().contains(&reason));
            prop_assert!(network.to_string().contains(&reason));
            prop_assert!(unrecognized.to_string().contains(&command));
            prop_assert!(memory.to_string().contains(&requested.to_string()));
            prop_assert!(!timeout.to_string().is_empty());
          }

          #[test]
          fn return_codes_roundtrip_through_wire_values(value in 0u8..=6u8) {
            let code = ReturnCode::from_u8(value);
            prop_assert_eq!(code.as_u8(), value);
          }

          #[test]
          fn unknown_wire_codes_are_general_errors(value in 7u8..=255u8) {
            prop_assert_eq!(ReturnCode::from_u8(value), ReturnCode::GeneralError);
          }
        }
    }

    #[test]
    fn every_variant_maps_to_its_return_code() {
        assert_eq!(CortexError::general("x").return_code(), ReturnCode::GeneralError);
        assert_eq!(CortexError::api_misuse("x").return_code(), ReturnCode::ApiError);
        assert_eq!(CortexError::network_error("x").return_code(), ReturnCode::NetworkError);
        assert_eq!(
            CortexError::Timeout { duration: Duration::from_millis(500) }.return_code(),
            ReturnCode::TimeOut
        );
        assert_eq!(CortexError::allocation_failed("x", 1).return_code(), ReturnCode::MemoryError);
        assert_eq!(
            CortexError::Unrecognized { command: "Foo".into() }.return_code(),
            ReturnCode::Unrecognized
        );
        assert_eq!(CortexError::protocol("x", "y").return_code(), ReturnCode::GeneralError);
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<CortexError>();

        let error = CortexError::general("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn recovery_methods_work() {
        let timeout = CortexError::Timeout { duration: Duration::from_millis(500) };
        let api = CortexError::api_misuse("started twice");

        assert!(timeout.is_retryable());
        assert!(!api.is_retryable());

        for suggestion in timeout.recovery_suggestions().iter().chain(api.recovery_suggestions().iter()) {
            assert!(suggestion.len() > 5);
        }
    }

    #[test]
    fn io_errors_become_general_errors_with_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: CortexError = io_err.into();

        assert_eq!(err.return_code(), ReturnCode::GeneralError);
        let source = std::error::Error::source(&err).expect("source should be kept");
        assert_eq!(source.to_string(), "reset by peer");
    }
}
