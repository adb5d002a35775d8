use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::error::{ErrorKind, SessionError, StepError};
use crate::report::RunReport;
use crate::surface::{Connector, Surface};
use crate::task::{Task, TaskOutcome, TaskStatus};
use crate::workflow::Workflow;

/// A run stopped by a fatal error, with the outcomes gathered until then.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct RunAborted {
    pub error: SessionError,
    pub report: RunReport,
}

/// Owns the session handle for one batch and walks the task queue.
pub struct SessionDriver {
    connector: Box<dyn Connector>,
    workflow: Box<dyn Workflow>,
}

impl SessionDriver {
    pub fn new(connector: Box<dyn Connector>, workflow: Box<dyn Workflow>) -> Self {
        Self {
            connector,
            workflow,
        }
    }

    /// Processes `tasks` in order against one surface.
    ///
    /// Task failures are recorded and the loop moves on. Only failing to
    /// establish (or re-establish) the session, or to prepare it, returns an
    /// error; it still carries the partial report.
    pub async fn run(&self, tasks: &[Task], ctx: &RunContext) -> Result<RunReport, RunAborted> {
        let mut report = RunReport::new(self.workflow.name());
        ctx.reporter.report(format!(
            "🚀 Starting {} with {} task(s)",
            self.workflow.name(),
            tasks.len()
        ));

        let mut surface = match self.connector.connect().await {
            Ok(surface) => surface,
            Err(err) => return Err(abort(report, tasks.len(), err, ctx)),
        };
        info!("Session established: {}", surface.label());

        if let Err(err) = self.workflow.prepare(&mut *surface, ctx).await {
            close(surface).await;
            if err.kind == ErrorKind::Cancelled {
                report.cancelled = true;
                report.skipped = tasks.len();
                report.finish();
                return Ok(report);
            }
            let err = SessionError::Prepare(err.to_string());
            return Err(abort(report, tasks.len(), err, ctx));
        }

        for (index, task) in tasks.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                report.skipped = tasks.len() - index;
                ctx.reporter.report(format!(
                    "⏹️  Cancelled, {} task(s) not started",
                    report.skipped
                ));
                break;
            }

            ctx.reporter
                .report(format!("▶️  [{}/{}] {}", index + 1, tasks.len(), task.label()));
            let started = Instant::now();

            let popups = self.workflow.popups();
            popups.cleanup(&mut *surface, &ctx.reporter, &ctx.cancel).await;
            let result = self.workflow.run_task(&mut *surface, ctx, task).await;
            popups.cleanup(&mut *surface, &ctx.reporter, &ctx.cancel).await;

            let duration_secs = started.elapsed().as_secs_f64();
            let failure = result.as_ref().err().cloned();
            let status = match result {
                Ok(file) => {
                    match &file {
                        Some(path) => ctx
                            .reporter
                            .report(format!("✅ {}: saved {}", task.label(), path.display())),
                        None => ctx.reporter.report(format!("✅ {}: done", task.label())),
                    }
                    TaskStatus::Succeeded { file }
                }
                Err(err) => {
                    ctx.reporter
                        .report(format!("❌ {}: {}", task.label(), err));
                    TaskStatus::Failed {
                        kind: err.kind,
                        detail: err.detail,
                    }
                }
            };
            report.outcomes.push(TaskOutcome {
                index,
                identifier: task.identifier.clone(),
                status,
                duration_secs,
            });

            if let Some(err) = failure {
                if err.kind != ErrorKind::Cancelled {
                    surface = match self.restore(surface, ctx, &err).await {
                        Ok(surface) => surface,
                        Err(fatal) => {
                            return Err(abort(report, tasks.len() - index - 1, fatal, ctx))
                        }
                    };
                }
            }
        }

        close(surface).await;
        report.finish();
        ctx.reporter.report(format!(
            "🏁 Finished: {} succeeded, {} failed, {} skipped",
            report.succeeded(),
            report.failed(),
            report.skipped
        ));
        Ok(report)
    }

    /// Brings the surface back to a navigable state after a failed task,
    /// replacing it when the session is gone.
    async fn restore(
        &self,
        mut surface: Box<dyn Surface>,
        ctx: &RunContext,
        failure: &StepError,
    ) -> Result<Box<dyn Surface>, SessionError> {
        if !failure.is_session_lost() {
            match surface.recover().await {
                Ok(()) => return Ok(surface),
                Err(e) if e.kind() == ErrorKind::SessionLost => {
                    debug!("Recovery found the session gone: {}", e);
                }
                Err(e) => {
                    warn!("Recovery after failed task did not complete: {}", e);
                    return Ok(surface);
                }
            }
        }

        ctx.reporter.report("🔄 Session lost, reconnecting...");
        close(surface).await;

        let reconnect_err = |reason: String| SessionError::Reconnect {
            target: self.connector.target(),
            reason,
        };
        let mut fresh = self
            .connector
            .connect()
            .await
            .map_err(|e| reconnect_err(e.to_string()))?;
        if let Err(e) = self.workflow.prepare(&mut *fresh, ctx).await {
            error!("Preparation after reconnect failed: {}", e);
            close(fresh).await;
            return Err(reconnect_err(e.to_string()));
        }
        info!("Session re-established: {}", fresh.label());
        Ok(fresh)
    }
}

fn abort(
    mut report: RunReport,
    skipped: usize,
    error: SessionError,
    ctx: &RunContext,
) -> RunAborted {
    report.skipped = skipped;
    report.finish();
    ctx.reporter.report(format!("⛔ Run aborted: {}", error));
    RunAborted { error, report }
}

async fn close(surface: Box<dyn Surface>) {
    let label = surface.label();
    if let Err(e) = surface.close().await {
        warn!("Failed to close {}: {}", label, e);
    }
}
