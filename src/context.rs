use tokio_util::sync::CancellationToken;

use crate::captcha::CaptchaSolver;
use crate::config::Timings;
use crate::executor::StepExecutor;
use crate::progress::Reporter;
use crate::staging::StagingArea;

/// Everything a workflow needs besides the surface itself.
pub struct RunContext {
    pub cancel: CancellationToken,
    pub reporter: Reporter,
    pub staging: StagingArea,
    pub timings: Timings,
    pub executor: StepExecutor,
    pub captcha_solver: Option<CaptchaSolver>,
}

impl RunContext {
    pub fn new(reporter: Reporter, staging: StagingArea, timings: Timings) -> Self {
        Self {
            cancel: CancellationToken::new(),
            reporter,
            staging,
            executor: StepExecutor::from_timings(&timings),
            timings,
            captcha_solver: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_captcha_solver(mut self, solver: Option<CaptchaSolver>) -> Self {
        self.captcha_solver = solver;
        self
    }
}
