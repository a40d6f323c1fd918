//! Forward this crate's log events to an application callback.
//!
//! All diagnostics are emitted through `tracing`. Applications that already
//! run a subscriber see them with the `cortex_stream` target. Applications that
//! want plain callbacks add a [`LogCallbackLayer`] to their subscriber:
//!
//! ```rust
//! use cortex_stream::logging::{LogCallbackLayer, VerbosityLevel};
//! use tracing_subscriber::prelude::*;
//!
//! let layer = LogCallbackLayer::new(VerbosityLevel::Info, |level, message: &str| {
//!     eprintln!("[{:?}] {}", level, message);
//! });
//! let _ = tracing_subscriber::registry().with(layer).try_init();
//! ```

use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Level};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Target prefix of every event this crate emits.
pub const LOG_TARGET: &str = "cortex_stream";

/// How much of the crate's logging reaches a callback.
///
/// Levels are ordered: a callback at `Info` also receives `Warning` and
/// `Error` messages. `None` silences everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerbosityLevel {
    None,
    Error,
    #[default]
    Warning,
    Info,
    Debug,
}

impl VerbosityLevel {
    pub fn from_tracing(level: Level) -> Self {
        match level {
            Level::ERROR => VerbosityLevel::Error,
            Level::WARN => VerbosityLevel::Warning,
            Level::INFO => VerbosityLevel::Info,
            _ => VerbosityLevel::Debug,
        }
    }

    /// Whether a message at `message_level` passes this threshold.
    pub fn allows(self, message_level: VerbosityLevel) -> bool {
        message_level != VerbosityLevel::None && message_level <= self
    }
}

/// `tracing` layer that hands formatted crate events to a callback.
pub struct LogCallbackLayer<F> {
    level: VerbosityLevel,
    callback: F,
}

impl<F> LogCallbackLayer<F>
where
    F: Fn(VerbosityLevel, &str) + Send + Sync + 'static,
{
    pub fn new(level: VerbosityLevel, callback: F) -> Self {
        Self { level, callback }
    }

    pub fn level(&self) -> VerbosityLevel {
        self.level
    }
}

impl<S, F> Layer<S> for LogCallbackLayer<F>
where
    S: tracing::Subscriber,
    F: Fn(VerbosityLevel, &str) + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with(LOG_TARGET) {
            return;
        }

        let level = VerbosityLevel::from_tracing(*metadata.level());
        if !self.level.allows(level) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        (self.callback)(level, &visitor.finish());
    }
}

/// Renders the message followed by any structured fields as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(mut self) -> String {
        if !self.fields.is_empty() {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message.push_str(&self.fields);
        }
        self.message
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={:?}", field.name(), value);
    }
}
