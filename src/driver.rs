//! Load generation
//!
//! The driver runs one execution context per configured thread. Each context
//! opens its own connection, cycles through the template table for the
//! configured number of iterations, then tears the connection down:
//!
//! ```text
//! INIT -> CONNECTED -> RUNNING -> DRAINING -> DONE
//!   \______________________________________/
//!               (setup failure)
//! ```
//!
//! Contexts share only the read-only configuration, the template table and
//! the fabric. A failure in one context is recorded in its report and never
//! stops its siblings.

use crate::config::BenchConfig;
use crate::connection::Connection;
use crate::error::BenchError;
use crate::protocol::{summarize_reply, TemplateTable};
use crate::report::{ContextReport, ContextState, RunReport, StopReason};
use crate::transport::Fabric;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative stop flag, checked between iterations
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Top-level benchmark driver
pub struct Driver {
    config: BenchConfig,
    templates: TemplateTable,
    fabric: Arc<dyn Fabric>,
    stop: StopHandle,
}

impl Driver {
    /// Validate `config` and build the template table. Every configuration
    /// error surfaces here, before any connection exists.
    pub fn new(config: BenchConfig, fabric: Arc<dyn Fabric>) -> Result<Self, BenchError> {
        config.validate()?;
        let templates = TemplateTable::build(&config)?;
        Ok(Self {
            config,
            templates,
            fabric,
            stop: StopHandle::default(),
        })
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateTable {
        &self.templates
    }

    /// Handle that stops every context after its current iteration
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run every context to completion and aggregate the results
    pub fn run(&self) -> RunReport {
        let threads = self.config.threads;
        tracing::info!(
            "Starting {} context(s) against {}:{} over {}",
            threads,
            self.config.server_addr,
            self.config.server_port,
            self.fabric.name()
        );

        let start = Instant::now();
        let contexts = if threads == 1 {
            vec![self.run_context(0)]
        } else {
            self.run_threads(threads)
        };
        let elapsed = start.elapsed();

        let report = RunReport::new(
            self.fabric.name(),
            self.templates.encoding(),
            self.templates.request_size(),
            self.config.reply_wait,
            contexts,
            elapsed,
        );
        tracing::info!(
            "Run finished: {} requests in {:.3}s, {} complete, {} stopped early",
            report.total_requests,
            elapsed.as_secs_f64(),
            report.complete_contexts,
            report.stopped_early
        );
        report
    }

    fn run_threads(&self, threads: usize) -> Vec<ContextReport> {
        let requested = self.config.requests_per_thread;
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|id| {
                    let spawned = std::thread::Builder::new()
                        .name(format!("mc-bench-{id}"))
                        .spawn_scoped(scope, move || self.run_context(id));
                    (id, spawned)
                })
                .collect();

            handles
                .into_iter()
                .map(|(id, spawned)| match spawned {
                    Ok(handle) => handle.join().unwrap_or_else(|panic| {
                        let message = panic_message(panic.as_ref());
                        tracing::error!("Context {} panicked: {}", id, message);
                        let mut report = ContextReport::failed(id, requested, message);
                        report.stop_reason = StopReason::RuntimeFailed;
                        report
                    }),
                    Err(e) => {
                        tracing::error!("Context {}: failed to spawn thread: {}", id, e);
                        ContextReport::failed(id, requested, e.to_string())
                    }
                })
                .collect()
        })
    }

    fn run_context(&self, id: usize) -> ContextReport {
        let span = tracing::info_span!("context", context = id);
        let _enter = span.enter();
        let mut run = ContextRun::new(id, self.config.requests_per_thread);

        let setup_start = Instant::now();
        let mut conn = match Connection::open(self.fabric.as_ref(), &self.config, id) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("Context {}: setup failed: {}", id, e);
                run.setup_time = setup_start.elapsed();
                run.stop_reason = StopReason::SetupFailed;
                run.error = Some(e.to_string());
                run.advance(ContextState::Done);
                return run.finish();
            }
        };
        run.setup_time = setup_start.elapsed();
        run.advance(ContextState::Connected);

        run.advance(ContextState::Running);
        let start = Instant::now();
        self.iterate(&mut conn, &mut run, start);
        run.elapsed = start.elapsed();

        run.advance(ContextState::Draining);
        run.teardown = conn.close();
        run.advance(ContextState::Done);

        tracing::info!(
            "Context {}: {}/{} requests in {:.3}s ({:?})",
            id,
            run.completed,
            run.requested,
            run.elapsed.as_secs_f64(),
            run.stop_reason
        );
        run.finish()
    }

    fn log_reply(&self, context: usize, payload: &[u8]) {
        if self.config.verbose {
            tracing::info!(
                "Context {}: reply ({} bytes) {} [{}]",
                context,
                payload.len(),
                summarize_reply(self.templates.encoding(), payload),
                payload.escape_ascii()
            );
        }
    }

    fn iterate(&self, conn: &mut Connection, run: &mut ContextRun, start: Instant) {
        let id = run.id;
        let bound = self.config.run_duration;

        while run.completed < run.requested {
            if self.stop.is_stopped() {
                run.stop_reason = StopReason::Interrupted;
                return;
            }
            if start.elapsed() >= bound {
                run.stop_reason = StopReason::DurationElapsed;
                return;
            }

            let template = self.templates.for_iteration(run.completed);
            if let Err(e) = conn.send_request(template) {
                run.fail(format!("send of `{}` failed: {}", template.command(), e));
                return;
            }

            if template.expects_reply() {
                let reply = conn.await_reply(|payload| self.log_reply(id, payload));
                if let Err(e) = reply {
                    run.fail(format!("reply to `{}` failed: {}", template.command(), e));
                    return;
                }
                run.replies += 1;
            } else {
                match conn.collect_replies(|payload| self.log_reply(id, payload)) {
                    Ok(collected) => run.replies += collected as u64,
                    Err(e) => {
                        run.fail(format!(
                            "collecting replies after `{}` failed: {}",
                            template.command(),
                            e
                        ));
                        return;
                    }
                }
            }

            run.completed += 1;
            tracing::trace!("Context {}: iteration {} done", run.id, run.completed);
        }
        run.stop_reason = StopReason::Completed;
    }
}

/// Mutable state of one context while it runs
struct ContextRun {
    id: usize,
    state: ContextState,
    requested: u64,
    completed: u64,
    replies: u64,
    setup_time: Duration,
    elapsed: Duration,
    stop_reason: StopReason,
    error: Option<String>,
    teardown: crate::connection::TeardownSummary,
}

impl ContextRun {
    fn new(id: usize, requested: u64) -> Self {
        Self {
            id,
            state: ContextState::Init,
            requested,
            completed: 0,
            replies: 0,
            setup_time: Duration::ZERO,
            elapsed: Duration::ZERO,
            stop_reason: StopReason::Completed,
            error: None,
            teardown: Default::default(),
        }
    }

    fn advance(&mut self, next: ContextState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!("Context {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, error: String) {
        tracing::error!("Context {}: {}", self.id, error);
        self.stop_reason = StopReason::RuntimeFailed;
        self.error = Some(error);
    }

    fn finish(self) -> ContextReport {
        ContextReport {
            context: self.id,
            state: self.state,
            requested: self.requested,
            completed: self.completed,
            replies: self.replies,
            setup_time: self.setup_time,
            elapsed: self.elapsed,
            stop_reason: self.stop_reason,
            error: self.error,
            teardown: self.teardown,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic with non-string payload".to_string()
    }
}
