//! Injected logging capability
//!
//! Components never log through ambient global state of their own. Each
//! engine is handed a [`Logger`] at construction time; the handle owns a
//! `tracing` span naming the component, and every event is emitted inside
//! that span. Whatever subscriber the host installed decides where the
//! events go.

use std::fmt::Display;
use tracing::{Level, Span};

/// Cloneable logging handle scoped to one component
#[derive(Debug, Clone)]
pub struct Logger {
    span: Span,
    component: &'static str,
    enabled: bool,
}

impl Logger {
    /// Create a logger for a named component
    pub fn new(component: &'static str) -> Self {
        Self {
            span: tracing::span!(Level::DEBUG, "palimpsest", component),
            component,
            enabled: true,
        }
    }

    /// A logger whose events are discarded
    pub fn disabled() -> Self {
        Self {
            span: Span::none(),
            component: "disabled",
            enabled: false,
        }
    }

    /// Derive a logger for a sub-component, nested under this one
    pub fn child(&self, component: &'static str) -> Self {
        let span = self
            .span
            .in_scope(|| tracing::span!(Level::DEBUG, "palimpsest", component));
        Self {
            span,
            component,
            enabled: self.enabled,
        }
    }

    /// Name of the component this logger belongs to
    pub fn component(&self) -> &'static str {
        self.component
    }

    /// Emit a trace-level event
    pub fn trace(&self, message: impl Display) {
        if self.enabled {
            self.span.in_scope(|| tracing::trace!(component = self.component, "{}", message));
        }
    }

    /// Emit a debug-level event
    pub fn debug(&self, message: impl Display) {
        if self.enabled {
            self.span.in_scope(|| tracing::debug!(component = self.component, "{}", message));
        }
    }

    /// Emit an info-level event
    pub fn info(&self, message: impl Display) {
        if self.enabled {
            self.span.in_scope(|| tracing::info!(component = self.component, "{}", message));
        }
    }

    /// Emit a warning
    pub fn warn(&self, message: impl Display) {
        if self.enabled {
            self.span.in_scope(|| tracing::warn!(component = self.component, "{}", message));
        }
    }

    /// Emit an error-level event
    pub fn error(&self, message: impl Display) {
        if self.enabled {
            self.span.in_scope(|| tracing::error!(component = self.component, "{}", message));
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("palimpsest")
    }
}
