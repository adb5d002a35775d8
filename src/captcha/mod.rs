use anyhow::{bail, Result};
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::error::{ErrorKind, StepError, SurfaceError};
use crate::locator::Locator;
use crate::surface::Surface;
use crate::wait::{PollPolicy, Poller, WaitError};

/// 2Captcha API client for solving reCAPTCHA v2
pub struct CaptchaSolver {
    api_key: String,
    client: Client,
    base_url: String,
}

impl CaptchaSolver {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: Client::new(),
            base_url: "https://2captcha.com".to_string(),
        }
    }

    /// Create from the TWOCAPTCHA_API_KEY environment variable
    pub fn from_env() -> Option<Self> {
        std::env::var("TWOCAPTCHA_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(Self::new)
    }

    /// Submit a reCAPTCHA v2 challenge and poll for its token
    pub async fn solve_recaptcha_v2(
        &self,
        site_key: &str,
        page_url: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        info!("🤖 Solving reCAPTCHA using 2Captcha API...");

        let submit_url = format!(
            "{}/in.php?key={}&method=userrecaptcha&googlekey={}&pageurl={}",
            self.base_url,
            self.api_key,
            urlencoding::encode(site_key),
            urlencoding::encode(page_url)
        );

        debug!("Submitting captcha to 2Captcha...");
        let text = self.client.get(&submit_url).send().await?.text().await?;
        let captcha_id = match text.strip_prefix("OK|") {
            Some(id) => id.to_string(),
            None => bail!("Failed to submit captcha: {}", text),
        };
        info!("Captcha submitted, ID: {}", captcha_id);

        // Usually solved within 10-30 seconds
        let policy = PollPolicy::new(Duration::from_secs(5), Duration::from_secs(120));
        let mut poller = Poller::new(policy, cancel);
        // The service rejects result queries sent right after submission.
        poller.tick().await?;

        loop {
            let attempt = match poller.tick().await {
                Ok(attempt) => attempt,
                Err(WaitError::Cancelled) => bail!("Cancelled while waiting for captcha solution"),
                Err(WaitError::Timeout(_)) => bail!("Timeout waiting for captcha solution"),
            };

            let result_url = format!(
                "{}/res.php?key={}&action=get&id={}",
                self.base_url, self.api_key, captcha_id
            );
            let text = self.client.get(&result_url).send().await?.text().await?;

            if let Some(solution) = text.strip_prefix("OK|") {
                info!("✅ reCAPTCHA solved (poll {})", attempt);
                return Ok(solution.to_string());
            } else if text == "CAPCHA_NOT_READY" {
                debug!("Captcha not ready yet (poll {})", attempt);
            } else {
                warn!("Unexpected response from 2Captcha: {}", text);
            }
        }
    }

    /// Get the reCAPTCHA site key from page HTML
    pub fn extract_site_key(html: &str) -> Option<String> {
        // data-sitekey="..."
        if let Some(start) = html.find("data-sitekey=\"") {
            let start_idx = start + 14;
            if let Some(end) = html[start_idx..].find('"') {
                return Some(html[start_idx..start_idx + end].to_string());
            }
        }

        // grecaptcha.execute('...')
        if let Some(start) = html.find("grecaptcha.execute('") {
            let start_idx = start + 20;
            if let Some(end) = html[start_idx..].find('\'') {
                return Some(html[start_idx..start_idx + end].to_string());
            }
        }

        None
    }
}

/// Human-verification checkpoint inside a workflow.
///
/// When `challenge` is visible the gate first tries the configured solver,
/// then waits for an operator. The captcha counts as solved once the surface
/// holds a response token, or once the optional `solved` marker shows.
#[derive(Debug, Clone)]
pub struct CaptchaGate {
    pub challenge: Locator,
    pub solved: Option<Locator>,
}

impl CaptchaGate {
    async fn is_solved(&self, surface: &mut dyn Surface) -> Result<bool, SurfaceError> {
        if surface.captcha_token().await?.is_some() {
            return Ok(true);
        }
        match &self.solved {
            Some(marker) => Ok(surface.probe(marker).await?.is_some()),
            None => Ok(false),
        }
    }

    pub async fn pass(&self, surface: &mut dyn Surface, ctx: &RunContext) -> Result<(), StepError> {
        match surface.probe(&self.challenge).await {
            Ok(None) => return Ok(()),
            Ok(Some(_)) => {}
            Err(e) if e.kind() == ErrorKind::SessionLost => return Err(e.into()),
            Err(e) => {
                debug!("Captcha probe failed, assuming no captcha: {}", e);
                return Ok(());
            }
        }

        if let Ok(true) = self.is_solved(surface).await {
            return Ok(());
        }

        if let Some(solver) = &ctx.captcha_solver {
            match surface.solve_captcha(solver, &ctx.cancel).await {
                Ok(true) => ctx.reporter.report("🤖 Captcha solved automatically"),
                Ok(false) => debug!("Surface has no automatically solvable captcha"),
                Err(e) => warn!("Automatic captcha solving failed: {}", e),
            }
        }

        ctx.reporter
            .report("⚠️  Captcha detected, waiting for the operator to solve it...");

        let policy = PollPolicy::new(ctx.timings.poll_interval(), ctx.timings.captcha_timeout());
        let mut poller = Poller::new(policy, &ctx.cancel);
        loop {
            match poller.tick().await {
                Ok(_) => match self.is_solved(surface).await {
                    Ok(true) => {
                        ctx.reporter.report("✅ Captcha solved");
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) if e.kind() == ErrorKind::SessionLost => return Err(e.into()),
                    Err(e) => debug!("Captcha probe failed: {}", e),
                },
                Err(WaitError::Cancelled) => return Err(StepError::cancelled()),
                Err(WaitError::Timeout(limit)) => {
                    return Err(StepError::timeout(format!(
                        "captcha not solved within {:?}",
                        limit
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::progress::{MemoryLog, Reporter};
    use crate::staging::StagingArea;
    use crate::surface::scripted::Script;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_extract_site_key() {
        let html = r#"<div class="g-recaptcha" data-sitekey="6LdTest1234567890"></div>"#;
        let site_key = CaptchaSolver::extract_site_key(html);
        assert_eq!(site_key, Some("6LdTest1234567890".to_string()));
    }

    #[test]
    fn test_extract_site_key_alternative() {
        let html = r#"grecaptcha.execute('6LdAlternative123');"#;
        let site_key = CaptchaSolver::extract_site_key(html);
        assert_eq!(site_key, Some("6LdAlternative123".to_string()));
    }

    #[test]
    fn test_extract_site_key_missing() {
        assert_eq!(CaptchaSolver::extract_site_key("<html></html>"), None);
    }

    fn context(staging: &std::path::Path) -> (RunContext, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        let ctx = RunContext::new(
            Reporter::new(log.clone()),
            StagingArea::new(staging).unwrap(),
            Timings::default(),
        );
        (ctx, log)
    }

    fn gate() -> CaptchaGate {
        CaptchaGate {
            challenge: Locator::css(".g-recaptcha"),
            solved: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_without_challenge_passes_at_once() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, log) = context(dir.path());
        let mut surface = Script::new().surface();

        let started = Instant::now();
        gate().pass(&mut surface, &ctx).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(log.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_waits_for_operator_token() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, log) = context(dir.path());
        let script = Script::new();
        script.show(Locator::css(".g-recaptcha"));

        let operator = script.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            operator.set_captcha_token(Some("03AGdBq2"));
        });

        let started = Instant::now();
        let mut surface = script.surface();
        gate().pass(&mut surface, &ctx).await.unwrap();

        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(7) && waited < Duration::from_secs(8));
        assert!(log.messages().iter().any(|m| m == "✅ Captcha solved"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_accepts_visible_marker() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(dir.path());
        let script = Script::new();
        script
            .show(Locator::css(".g-recaptcha"))
            .show(Locator::id("captcha-ok"));

        let gate = CaptchaGate {
            solved: Some(Locator::id("captcha-ok")),
            ..gate()
        };
        let mut surface = script.surface();
        gate.pass(&mut surface, &ctx).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_times_out_when_unsolved() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(dir.path());
        let script = Script::new();
        script.show(Locator::css(".g-recaptcha"));

        let started = Instant::now();
        let mut surface = script.surface();
        let err = gate().pass(&mut surface, &ctx).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(started.elapsed(), ctx.timings.captcha_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(dir.path());
        let script = Script::new();
        script.show(Locator::css(".g-recaptcha"));

        let trigger = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let mut surface = script.surface();
        let err = gate().pass(&mut surface, &ctx).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }
}
