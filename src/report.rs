// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Failure reporting.
//!
//! When a migration tool fails, a structured failure event is handed to a
//! metrics collector before the process exits, so failures in the field can
//! be counted. The collector itself lives outside this crate; a
//! [`FailureSink`] is the seam where one plugs in.

use std::fmt::{Display, Formatter, Result as FmtResult};
use tracing::error;

/// Event id of a failed migration tool run.
pub const MIGRATION_FAILURE_EVENT: &str = "cf09194a-3090-4782-ab03-87b2f1515aed";

/// Structured failure event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    /// Event id understood by the metrics collector.
    pub event_id: &'static str,

    /// Name of the tool that failed.
    pub tool: String,

    /// Rendered error chain.
    pub error: String,
}

impl FailureEvent {
    /// Construct new migration failure event.
    pub fn migration(tool: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            event_id: MIGRATION_FAILURE_EVENT,
            tool: tool.into(),
            error: format!("{error:#}"),
        }
    }
}

impl Display for FailureEvent {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{} ({}): {}", self.tool, self.event_id, self.error)
    }
}

/// Destination of failure events.
pub trait FailureSink {
    /// Hand failure event over to the collector.
    fn record(&self, event: &FailureEvent);
}

/// Failure sink that emits events as error log records with the event fields
/// attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl FailureSink for LogSink {
    fn record(&self, event: &FailureEvent) {
        error!(
            event_id = event.event_id,
            tool = %event.tool,
            error = %event.error,
            "migration failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    #[derive(Default)]
    struct MemorySink(RefCell<Vec<FailureEvent>>);

    impl FailureSink for MemorySink {
        fn record(&self, event: &FailureEvent) {
            self.0.borrow_mut().push(event.clone());
        }
    }

    #[test]
    fn migration_event_carries_error_chain() {
        let error = anyhow::anyhow!("disk full").context("failed to duplicate repository");
        let event = FailureEvent::migration("ostree-split", &error);
        let sink = MemorySink::default();
        sink.record(&event);

        let recorded = sink.0.borrow();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].event_id, MIGRATION_FAILURE_EVENT);
        assert_eq!(recorded[0].tool, "ostree-split");
        assert_eq!(recorded[0].error, "failed to duplicate repository: disk full");
    }
}
