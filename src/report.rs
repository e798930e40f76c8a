//! Run reports
//!
//! Per-context results and the aggregate over a whole run, printable as a
//! human summary or serialisable to JSON.

use crate::connection::TeardownSummary;
use crate::protocol::Encoding;
use serde::{Serialize, Serializer};
use std::time::Duration;

fn as_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

/// Per-context lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Init,
    Connected,
    Running,
    Draining,
    Done,
}

impl ContextState {
    /// Whether `next` directly follows `self`. Setup failures go straight
    /// from INIT to DONE and runtime failures from RUNNING to DRAINING,
    /// which are ordinary edges here.
    pub fn can_advance_to(self, next: ContextState) -> bool {
        use ContextState::*;
        matches!(
            (self, next),
            (Init, Connected) | (Init, Done) | (Connected, Running) | (Running, Draining) | (Draining, Done)
        )
    }
}

/// Why a context stopped issuing requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every requested iteration was sent
    Completed,
    /// The run-duration bound passed first
    DurationElapsed,
    /// Stopped through a `StopHandle`
    Interrupted,
    /// The connection could not be opened
    SetupFailed,
    /// A send or reply failed mid-run
    RuntimeFailed,
}

/// Outcome of one execution context
#[derive(Clone, Debug, Serialize)]
pub struct ContextReport {
    pub context: usize,
    pub state: ContextState,
    pub requested: u64,
    pub completed: u64,
    /// Replies consumed, including rejections of silent requests
    pub replies: u64,
    #[serde(serialize_with = "as_secs")]
    pub setup_time: Duration,
    /// Time spent in RUNNING
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub stop_reason: StopReason,
    pub error: Option<String>,
    pub teardown: TeardownSummary,
}

impl ContextReport {
    /// A context that never got past setup
    pub fn failed(context: usize, requested: u64, error: impl Into<String>) -> Self {
        Self {
            context,
            state: ContextState::Done,
            requested,
            completed: 0,
            replies: 0,
            setup_time: Duration::ZERO,
            elapsed: Duration::ZERO,
            stop_reason: StopReason::SetupFailed,
            error: Some(error.into()),
            teardown: TeardownSummary::default(),
        }
    }

    /// Ran every requested iteration
    pub fn is_complete(&self) -> bool {
        self.stop_reason == StopReason::Completed && self.completed == self.requested
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.stop_reason,
            StopReason::SetupFailed | StopReason::RuntimeFailed
        )
    }

    pub fn requests_per_sec(&self) -> f64 {
        rate(self.completed, self.elapsed)
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Aggregate over every context of a run
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub backend: String,
    pub encoding: Encoding,
    pub request_size: usize,
    pub reply_wait: bool,
    pub contexts: Vec<ContextReport>,
    /// Wall-clock time from the first spawn to the last join
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub total_requests: u64,
    pub total_replies: u64,
    pub requests_per_sec: f64,
    pub complete_contexts: usize,
    pub stopped_early: usize,
}

impl RunReport {
    pub fn new(
        backend: &str,
        encoding: Encoding,
        request_size: usize,
        reply_wait: bool,
        mut contexts: Vec<ContextReport>,
        elapsed: Duration,
    ) -> Self {
        contexts.sort_by_key(|c| c.context);
        let total_requests = contexts.iter().map(|c| c.completed).sum();
        let total_replies = contexts.iter().map(|c| c.replies).sum();
        let complete_contexts = contexts.iter().filter(|c| c.is_complete()).count();
        Self {
            backend: backend.to_string(),
            encoding,
            request_size,
            reply_wait,
            stopped_early: contexts.len() - complete_contexts,
            complete_contexts,
            requests_per_sec: rate(total_requests, elapsed),
            total_requests,
            total_replies,
            contexts,
            elapsed,
        }
    }

    /// Any context hit a setup or runtime failure
    pub fn has_failures(&self) -> bool {
        self.contexts.iter().any(ContextReport::is_failure)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_requests * self.request_size as u64
    }

    pub fn print_summary(&self) {
        println!("\n=== Per-Context Results ===");
        for c in &self.contexts {
            let status = match c.stop_reason {
                StopReason::Completed => "complete".to_string(),
                reason => format!("stopped early ({:?})", reason),
            };
            println!(
                "Context {:3}: {}/{} requests in {:.3}s ({:.0} req/s), setup {:.1}ms, {}",
                c.context,
                c.completed,
                c.requested,
                c.elapsed.as_secs_f64(),
                c.requests_per_sec(),
                c.setup_time.as_secs_f64() * 1000.0,
                status
            );
            if let Some(error) = &c.error {
                println!("             error: {}", error);
            }
            if c.teardown.failures > 0 {
                println!("             teardown failures: {}", c.teardown.failures);
            }
        }

        println!("\n=== Summary ===");
        println!("Backend:          {}", self.backend);
        println!(
            "Protocol:         {} ({} per request, {})",
            self.encoding,
            format_size(self.request_size),
            if self.reply_wait { "reply wait" } else { "noreply" }
        );
        println!("Elapsed:          {:.3}s", self.elapsed.as_secs_f64());
        println!("Requests:         {}", self.total_requests);
        if self.reply_wait {
            println!("Replies:          {}", self.total_replies);
        }
        println!("Throughput:       {:.0} req/s", self.requests_per_sec);
        println!(
            "Bandwidth:        {}",
            format_throughput(rate(self.total_bytes(), self.elapsed))
        );
        println!(
            "Contexts:         {} complete, {} stopped early",
            self.complete_contexts, self.stopped_early
        );
    }
}

/// Format size in human-readable form
pub fn format_size(bytes: usize) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Format throughput in human-readable form
pub fn format_throughput(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} GB/s", bytes_per_sec / (1024.0 * 1024.0 * 1024.0))
    } else if bytes_per_sec >= 1024.0 * 1024.0 {
        format!("{:.2} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    } else if bytes_per_sec >= 1024.0 {
        format!("{:.2} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.2} B/s", bytes_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(id: usize, completed: u64, reason: StopReason) -> ContextReport {
        ContextReport {
            context: id,
            state: ContextState::Done,
            requested: 100,
            completed,
            replies: 0,
            setup_time: Duration::from_millis(1),
            elapsed: Duration::from_secs(1),
            stop_reason: reason,
            error: None,
            teardown: TeardownSummary::default(),
        }
    }

    #[test]
    fn test_aggregates() {
        let report = RunReport::new(
            "loopback",
            Encoding::Text,
            100,
            false,
            vec![
                context(1, 40, StopReason::RuntimeFailed),
                context(0, 100, StopReason::Completed),
            ],
            Duration::from_secs(2),
        );
        assert_eq!(report.contexts[0].context, 0);
        assert_eq!(report.total_requests, 140);
        assert_eq!(report.complete_contexts, 1);
        assert_eq!(report.stopped_early, 1);
        assert!((report.requests_per_sec - 70.0).abs() < f64::EPSILON);
        assert_eq!(report.total_bytes(), 14_000);
        assert!(report.has_failures());
    }

    #[test]
    fn test_json_shape() {
        let report = RunReport::new(
            "loopback",
            Encoding::Binary,
            64,
            true,
            vec![ContextReport::failed(0, 10, "refused")],
            Duration::from_millis(1500),
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["encoding"], "binary");
        assert_eq!(json["elapsed"], 1.5);
        assert_eq!(json["contexts"][0]["stop_reason"], "setup_failed");
        assert_eq!(json["contexts"][0]["state"], "done");
        assert_eq!(json["contexts"][0]["error"], "refused");
    }

    #[test]
    fn test_state_edges() {
        assert!(ContextState::Init.can_advance_to(ContextState::Connected));
        assert!(ContextState::Running.can_advance_to(ContextState::Draining));
        assert!(!ContextState::Running.can_advance_to(ContextState::Done));
        assert!(!ContextState::Done.can_advance_to(ContextState::Init));
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_size(100), "100 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_throughput(3.0 * 1024.0 * 1024.0), "3.00 MB/s");
    }
}
