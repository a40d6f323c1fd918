//! Async client for Cortex-style motion-capture hosts.
//!
//! A host multicasts one frame per video frame (marker positions, skeleton
//! segments, degrees of freedom, analog samples) and answers text commands on
//! a unicast port. This crate receives and decodes that stream, talks to the
//! host, and can relay frames to downstream clients of its own.
//!
//! # Features
//!
//! - **Frame streaming**: multicast subscriber with an injected handler and an
//!   optional polled, rate-limited stream of owned snapshots
//! - **Commands**: request/response with a configurable timeout floor, Sky
//!   commands, body definitions, skeleton (HTR) upload
//! - **Relay**: an optional distribution server for downstream clients
//! - **Utilities**: Euler angle conversion and a treadmill remote
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cortex_stream::{Session, SessionConfig, UpdateRate};
//! use futures::StreamExt;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> cortex_stream::Result<()> {
//!     let mut session = Session::new(SessionConfig::default().host("10.1.1.20"));
//!     session.start().await?;
//!
//!     let defs = session.body_definitions(Duration::from_secs(1)).await?;
//!     println!("host tracks {} bodies", defs.bodies.len());
//!
//!     let mut frames = session.frames(UpdateRate::Max(30))?;
//!     while let Some(frame) = frames.next().await {
//!         println!("frame {}: {} unidentified markers", frame.frame_number, frame.unidentified_markers.len());
//!     }
//!
//!     session.shutdown().await
//! }
//! ```

// Core types and error handling
pub mod buffer;
mod error;
pub mod logging;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Wire protocol and networking
pub mod command;
pub mod config;
pub mod distribution;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod subscriber;

// Boundary utilities
pub mod euler;
pub mod treadmill;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use command::{FrameView, Response};
pub use config::{PortSetting, SessionConfig};
pub use distribution::{ClientReply, ClientRequestHandler};
pub use logging::{LogCallbackLayer, VerbosityLevel};
pub use session::{Session, SessionState};
pub use subscriber::FrameHandler;

/// Version this SDK reports to hosts and downstream clients.
///
/// The first byte is a module id; the rest read as major, minor, patch.
pub const SDK_VERSION: [u8; 4] = [0, 5, 0, 0];

pub fn sdk_version() -> [u8; 4] {
    SDK_VERSION
}
