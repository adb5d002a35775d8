use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Timings;
use crate::error::{ErrorKind, StepError};
use crate::locator::{Hit, Locator};
use crate::surface::{Input, Surface};
use crate::wait::{pause, PollPolicy, Poller, WaitError};

/// What to do with the element a step locates.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Click,
    Type(String),
    WaitVisible,
    WaitGone,
    /// Waits for the element and returns the text or value it carries.
    ReadText,
}

/// One UI action against a locator.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub locator: Locator,
    pub action: StepAction,
    /// Overrides the executor's attempt count.
    pub attempts: Option<u32>,
    /// Overrides the executor's per-attempt timeout.
    pub timeout: Option<Duration>,
}

impl Step {
    pub fn new(name: &str, locator: Locator, action: StepAction) -> Self {
        Self {
            name: name.to_string(),
            locator,
            action,
            attempts: None,
            timeout: None,
        }
    }

    pub fn click(name: &str, locator: Locator) -> Self {
        Self::new(name, locator, StepAction::Click)
    }

    pub fn type_text(name: &str, locator: Locator, text: &str) -> Self {
        Self::new(name, locator, StepAction::Type(text.to_string()))
    }

    pub fn wait_visible(name: &str, locator: Locator) -> Self {
        Self::new(name, locator, StepAction::WaitVisible)
    }

    pub fn wait_gone(name: &str, locator: Locator) -> Self {
        Self::new(name, locator, StepAction::WaitGone)
    }

    pub fn read_text(name: &str, locator: Locator) -> Self {
        Self::new(name, locator, StepAction::ReadText)
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub step: String,
    pub ok: bool,
    pub error_kind: Option<ErrorKind>,
    pub detail: String,
    pub value: Option<String>,
    pub attempts: u32,
}

impl StepReport {
    fn success(step: &str, value: Option<String>, attempts: u32) -> Self {
        Self {
            step: step.to_string(),
            ok: true,
            error_kind: None,
            detail: String::new(),
            value,
            attempts,
        }
    }

    fn failure(step: &str, err: StepError, attempts: u32) -> Self {
        Self {
            step: step.to_string(),
            ok: false,
            error_kind: Some(err.kind),
            detail: err.detail,
            value: None,
            attempts,
        }
    }

    /// Converts to a `Result` so workflows can chain steps with `?`.
    pub fn into_result(self) -> Result<Option<String>, StepError> {
        if self.ok {
            Ok(self.value)
        } else {
            let kind = self.error_kind.unwrap_or(ErrorKind::Action);
            Err(StepError::new(kind, format!("{}: {}", self.step, self.detail)))
        }
    }
}

/// Bounded retries with a base delay plus random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.delay;
        }
        self.delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
    retry: RetryPolicy,
    poll_interval: Duration,
    step_timeout: Duration,
}

impl StepExecutor {
    pub fn new(retry: RetryPolicy, poll_interval: Duration, step_timeout: Duration) -> Self {
        Self {
            retry,
            poll_interval,
            step_timeout,
        }
    }

    pub fn from_timings(timings: &Timings) -> Self {
        Self::new(
            RetryPolicy {
                attempts: timings.step_attempts,
                delay: timings.retry_delay(),
                jitter: timings.retry_jitter(),
            },
            timings.poll_interval(),
            timings.step_timeout(),
        )
    }

    /// Runs `step` until it succeeds or its attempts are exhausted. Never
    /// panics and never returns a run-fatal error: a lost session is reported
    /// with `ErrorKind::SessionLost` and left to the caller.
    pub async fn run(
        &self,
        surface: &mut dyn Surface,
        step: &Step,
        cancel: &CancellationToken,
    ) -> StepReport {
        let attempts = step.attempts.unwrap_or(self.retry.attempts).max(1);
        let mut last_error = StepError::not_found(step.locator.to_string());

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return StepReport::failure(&step.name, StepError::cancelled(), attempt - 1);
            }

            match self.attempt(surface, step, cancel).await {
                Ok(value) => {
                    debug!("Step '{}' succeeded on attempt {}", step.name, attempt);
                    return StepReport::success(&step.name, value, attempt);
                }
                Err(err) if err.kind == ErrorKind::Cancelled || err.is_session_lost() => {
                    return StepReport::failure(&step.name, err, attempt);
                }
                Err(err) => {
                    debug!(
                        "Step '{}' attempt {}/{} failed: {}",
                        step.name, attempt, attempts, err
                    );
                    last_error = err;
                }
            }

            if attempt < attempts && pause(self.retry.next_delay(), cancel).await.is_err() {
                return StepReport::failure(&step.name, StepError::cancelled(), attempt);
            }
        }

        warn!(
            "Step '{}' failed after {} attempts: {}",
            step.name, attempts, last_error
        );
        StepReport::failure(&step.name, last_error, attempts)
    }

    async fn attempt(
        &self,
        surface: &mut dyn Surface,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, StepError> {
        let hit = self.await_presence(surface, step, cancel).await?;

        match (&step.action, hit) {
            (StepAction::WaitGone, _) => Ok(None),
            (StepAction::WaitVisible | StepAction::ReadText, hit) => Ok(hit.and_then(|h| h.text)),
            (StepAction::Click, Some(hit)) => {
                surface.act(&step.locator, &hit, &Input::Click).await?;
                Ok(None)
            }
            (StepAction::Type(text), Some(hit)) => {
                let input = Input::Type {
                    text: text.clone(),
                    clear: true,
                };
                surface.act(&step.locator, &hit, &input).await?;
                Ok(None)
            }
            (_, None) => Err(StepError::not_found(step.locator.to_string())),
        }
    }

    /// Polls until the locator is present (or absent, for `WaitGone`).
    async fn await_presence(
        &self,
        surface: &mut dyn Surface,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<Option<Hit>, StepError> {
        let want_present = step.action != StepAction::WaitGone;
        let timeout = step.timeout.unwrap_or(self.step_timeout);
        let mut poller = Poller::new(PollPolicy::new(self.poll_interval, timeout), cancel);

        loop {
            if let Err(e) = poller.tick().await {
                return Err(match e {
                    WaitError::Cancelled => StepError::cancelled(),
                    WaitError::Timeout(limit) => match step.action {
                        StepAction::WaitGone => StepError::timeout(format!(
                            "{} still present after {:?}",
                            step.locator, limit
                        )),
                        StepAction::WaitVisible => StepError::timeout(format!(
                            "{} did not appear within {:?}",
                            step.locator, limit
                        )),
                        _ => StepError::not_found(format!(
                            "{} not found within {:?}",
                            step.locator, limit
                        )),
                    },
                });
            }

            match surface.probe(&step.locator).await {
                Ok(hit) if hit.is_some() == want_present => return Ok(hit),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if !want_present {
                        return Ok(None);
                    }
                }
                Err(e) if e.kind() == ErrorKind::SessionLost => return Err(e.into()),
                Err(e) => debug!("Probe for {} failed: {}", step.locator, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::scripted::{Effect, Script};
    use tokio::time::Instant;

    fn executor() -> StepExecutor {
        StepExecutor::new(
            RetryPolicy {
                attempts: 3,
                delay: Duration::from_millis(1000),
                jitter: Duration::ZERO,
            },
            Duration::from_millis(500),
            Duration::from_secs(2),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_visible_element() {
        let script = Script::new();
        let button = Locator::id("btnConsultar");
        script.show(button.clone());

        let mut surface = script.surface();
        let cancel = CancellationToken::new();
        let report = executor()
            .run(&mut surface, &Step::click("consultar", button), &cancel)
            .await;

        assert!(report.ok);
        assert_eq!(report.attempts, 1);
        assert_eq!(script.journal(), vec!["click id:btnConsultar"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_element_exhausts_retries() {
        let script = Script::new();
        let mut surface = script.surface();
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let report = executor()
            .run(&mut surface, &Step::click("consultar", Locator::id("nope")), &cancel)
            .await;

        assert!(!report.ok);
        assert_eq!(report.error_kind, Some(ErrorKind::NotFound));
        assert_eq!(report.attempts, 3);
        // three 2s probe windows plus two 1s retry delays
        assert_eq!(started.elapsed(), Duration::from_secs(8));
        assert!(script.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_text_returns_value() {
        let script = Script::new();
        let situation = Locator::css("#situacao");
        script.show_with_text(situation.clone(), "Optante pelo Simples Nacional");

        let mut surface = script.surface();
        let cancel = CancellationToken::new();
        let report = executor()
            .run(&mut surface, &Step::read_text("situação", situation), &cancel)
            .await;

        assert_eq!(report.value.as_deref(), Some("Optante pelo Simples Nacional"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_visible_times_out() {
        let script = Script::new();
        let mut surface = script.surface();
        let cancel = CancellationToken::new();

        let step = Step::wait_visible("resultado", Locator::id("resultado")).with_attempts(1);
        let report = executor().run(&mut surface, &step, &cancel).await;

        assert_eq!(report.error_kind, Some(ErrorKind::Timeout));
        assert!(report.clone().into_result().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_gone_succeeds_after_element_hides() {
        let script = Script::new();
        let spinner = Locator::css(".loading");
        script.show(spinner.clone());

        let hider = script.clone();
        let hidden = spinner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            hider.hide(&hidden);
        });

        let mut surface = script.surface();
        let cancel = CancellationToken::new();
        let report = executor()
            .run(&mut surface, &Step::wait_gone("carregando", spinner), &cancel)
            .await;
        assert!(report.ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_fires_rules() {
        let script = Script::new();
        let field = Locator::name("cnpj");
        let ready = Locator::id("ok");
        script
            .show(field.clone())
            .on_type(field.clone(), None, vec![Effect::Show(ready.clone())]);

        let mut surface = script.surface();
        let cancel = CancellationToken::new();
        let report = executor()
            .run(
                &mut surface,
                &Step::type_text("cnpj", field, "11222333000181"),
                &cancel,
            )
            .await;

        assert!(report.ok);
        assert!(script.is_visible(&ready));
        assert_eq!(script.journal(), vec!["type name:cnpj 11222333000181"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lost_is_not_retried() {
        let script = Script::new();
        script.lose_session();
        let mut surface = script.surface();
        let cancel = CancellationToken::new();

        let report = executor()
            .run(&mut surface, &Step::click("x", Locator::id("x")), &cancel)
            .await;
        assert_eq!(report.error_kind, Some(ErrorKind::SessionLost));
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let script = Script::new();
        script.show(Locator::id("x"));
        let mut surface = script.surface();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = executor()
            .run(&mut surface, &Step::click("x", Locator::id("x")), &cancel)
            .await;
        assert_eq!(report.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(report.attempts, 0);
        assert!(script.journal().is_empty());
    }

    #[test]
    fn test_retry_delay_within_jitter() {
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1000),
            jitter: Duration::from_millis(500),
        };
        for _ in 0..50 {
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1500));
        }
    }
}
