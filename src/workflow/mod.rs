pub mod presets;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::captcha::CaptchaGate;
use crate::context::RunContext;
use crate::error::{ErrorKind, StepError, SurfaceError};
use crate::executor::Step;
use crate::locator::Locator;
use crate::popup::PopupScanner;
use crate::staging::{deliver, sanitize_file_name, OutputNaming, StagingError};
use crate::surface::Surface;
use crate::task::{digits_only, Task};
use crate::wait::{pause, PollPolicy, Poller, WaitError};

/// One pass of business logic per task, run against a shared surface.
#[async_trait]
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    /// Dialogs this workflow's target is known to raise.
    fn popups(&self) -> &PopupScanner;

    /// Runs once after the session is established (and again after a
    /// reconnect). A failure here is fatal to the run.
    async fn prepare(
        &self,
        _surface: &mut dyn Surface,
        _ctx: &RunContext,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Processes one task. Returns the delivered file, if the workflow
    /// produces one.
    async fn run_task(
        &self,
        surface: &mut dyn Surface,
        ctx: &RunContext,
        task: &Task,
    ) -> Result<Option<PathBuf>, StepError>;
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Portal login, reusing saved cookies when they still work.
#[derive(Debug, Clone)]
pub struct LoginSpec {
    pub url: String,
    pub username_field: Locator,
    pub password_field: Locator,
    pub submit: Locator,
    /// Visible only once logged in.
    pub logged_in: Locator,
    pub credentials: Credentials,
    pub cookie_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentifierFormat {
    #[default]
    Raw,
    DigitsOnly,
}

impl IdentifierFormat {
    pub fn apply(&self, identifier: &str) -> String {
        match self {
            IdentifierFormat::Raw => identifier.to_string(),
            IdentifierFormat::DigitsOnly => digits_only(identifier),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submit {
    Click(Locator),
    Keys(String),
}

/// A marker meaning the target rejected the identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureMarker {
    pub locator: Locator,
    pub reason: String,
}

/// How the document for a task is produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportMethod {
    /// Lookup only, nothing is saved.
    None,
    /// Render the current page to PDF.
    PrintPage,
    /// Run steps that make the target download the PDF into staging.
    Download(Vec<Step>),
    /// Print through the application's print dialog to a "save as PDF"
    /// printer, typing the staged path into the save dialog.
    PrintDialog {
        open_keys: String,
        print_dialog_title: Option<String>,
        save_dialog_title: String,
        file_field: Locator,
    },
}

/// Fill identifier, submit, wait for a verdict, export.
#[derive(Debug, Clone)]
pub struct FormWorkflow {
    pub name: String,
    pub entry: Option<String>,
    pub login: Option<LoginSpec>,
    pub before_fill: Vec<Step>,
    pub identifier_field: Locator,
    pub identifier_format: IdentifierFormat,
    pub captcha: Option<CaptchaGate>,
    pub submit: Submit,
    pub success: Locator,
    pub failures: Vec<FailureMarker>,
    pub export: ExportMethod,
    pub naming: OutputNaming,
    pub popups: PopupScanner,
}

impl FormWorkflow {
    pub fn new(
        name: &str,
        identifier_field: Locator,
        submit: Submit,
        success: Locator,
        popups: PopupScanner,
    ) -> Self {
        Self {
            name: name.to_string(),
            entry: None,
            login: None,
            before_fill: Vec::new(),
            identifier_field,
            identifier_format: IdentifierFormat::Raw,
            captcha: None,
            submit,
            success,
            failures: Vec::new(),
            export: ExportMethod::None,
            naming: OutputNaming::default(),
            popups,
        }
    }

    pub fn with_entry(mut self, entry: &str) -> Self {
        self.entry = Some(entry.to_string());
        self
    }

    pub fn with_login(mut self, login: LoginSpec) -> Self {
        self.login = Some(login);
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.before_fill.push(step);
        self
    }

    pub fn with_identifier_format(mut self, format: IdentifierFormat) -> Self {
        self.identifier_format = format;
        self
    }

    pub fn with_captcha(mut self, gate: CaptchaGate) -> Self {
        self.captcha = Some(gate);
        self
    }

    pub fn with_failure(mut self, locator: Locator, reason: &str) -> Self {
        self.failures.push(FailureMarker {
            locator,
            reason: reason.to_string(),
        });
        self
    }

    pub fn with_export(mut self, export: ExportMethod) -> Self {
        self.export = export;
        self
    }

    pub fn with_naming(mut self, naming: OutputNaming) -> Self {
        self.naming = naming;
        self
    }

    async fn step(
        &self,
        surface: &mut dyn Surface,
        ctx: &RunContext,
        step: &Step,
    ) -> Result<Option<String>, StepError> {
        ctx.executor.run(surface, step, &ctx.cancel).await.into_result()
    }

    async fn login(
        &self,
        surface: &mut dyn Surface,
        ctx: &RunContext,
        login: &LoginSpec,
    ) -> Result<(), StepError> {
        surface.navigate(&login.url).await?;

        if let Some(file) = &login.cookie_file {
            match surface.restore_session(file).await {
                Ok(true) => {
                    let check = Step::wait_visible("sessão salva", login.logged_in.clone())
                        .with_attempts(1)
                        .with_timeout(ctx.timings.step_timeout());
                    if self.step(surface, ctx, &check).await.is_ok() {
                        ctx.reporter.report("🍪 Saved session is still valid, skipping login");
                        return Ok(());
                    }
                    info!("Saved session expired, logging in again");
                    if let Err(e) = surface.discard_session(file).await {
                        warn!("Failed to discard expired session: {}", e);
                    }
                    surface.navigate(&login.url).await?;
                }
                Ok(false) => debug!("No saved session to restore"),
                Err(e) if e.kind() == ErrorKind::SessionLost => return Err(e.into()),
                Err(e) => warn!("Failed to restore saved session: {}", e),
            }
        }

        ctx.reporter.report(format!("🔐 Logging in as {}", login.credentials.username));
        let steps = [
            Step::type_text("usuário", login.username_field.clone(), &login.credentials.username),
            Step::type_text("senha", login.password_field.clone(), &login.credentials.password),
            Step::click("entrar", login.submit.clone()),
            Step::wait_visible("login confirmado", login.logged_in.clone())
                .with_timeout(ctx.timings.result_timeout()),
        ];
        for step in &steps {
            self.step(surface, ctx, step).await?;
        }

        if let Some(file) = &login.cookie_file {
            if let Err(e) = surface.save_session(file).await {
                warn!("Failed to save session cookies: {}", e);
            }
        }
        ctx.reporter.report("✅ Logged in");
        Ok(())
    }

    /// Polls the success marker and every failure marker with one poller.
    async fn await_verdict(
        &self,
        surface: &mut dyn Surface,
        ctx: &RunContext,
    ) -> Result<(), StepError> {
        let policy = PollPolicy::new(ctx.timings.poll_interval(), ctx.timings.result_timeout());
        let mut poller = Poller::new(policy, &ctx.cancel);

        loop {
            match poller.tick().await {
                Ok(_) => {}
                Err(WaitError::Cancelled) => return Err(StepError::cancelled()),
                Err(WaitError::Timeout(limit)) => {
                    return Err(StepError::timeout(format!(
                        "no result for {} within {:?}",
                        self.success, limit
                    )))
                }
            }

            for failure in &self.failures {
                if present(surface, &failure.locator).await? {
                    return Err(StepError::not_found(failure.reason.clone()));
                }
            }
            if present(surface, &self.success).await? {
                return Ok(());
            }
        }
    }

    async fn await_dialog(
        &self,
        surface: &mut dyn Surface,
        ctx: &RunContext,
        title: &str,
    ) -> Result<(), StepError> {
        let policy = PollPolicy::new(ctx.timings.poll_interval(), ctx.timings.step_timeout());
        let mut poller = Poller::new(policy, &ctx.cancel);
        loop {
            match poller.tick().await {
                Ok(_) => {}
                Err(WaitError::Cancelled) => return Err(StepError::cancelled()),
                Err(WaitError::Timeout(limit)) => {
                    return Err(StepError::timeout(format!(
                        "dialog '{}' did not open within {:?}",
                        title, limit
                    )))
                }
            }
            if surface.focus_dialog(title).await? {
                return Ok(());
            }
        }
    }

    async fn export(
        &self,
        surface: &mut dyn Surface,
        ctx: &RunContext,
        task: &Task,
    ) -> Result<Option<PathBuf>, StepError> {
        if self.export == ExportMethod::None {
            return Ok(None);
        }

        ctx.staging.clear().map_err(staging_error)?;
        let staged_name = sanitize_file_name(&digits_only(&task.identifier), &task.identifier);
        let staged_path = ctx.staging.staged_path(&staged_name);

        match &self.export {
            ExportMethod::None => {}
            ExportMethod::PrintPage => surface.export_pdf(&staged_path).await?,
            ExportMethod::Download(steps) => {
                for step in steps {
                    self.step(surface, ctx, step).await?;
                }
            }
            ExportMethod::PrintDialog {
                open_keys,
                print_dialog_title,
                save_dialog_title,
                file_field,
            } => {
                surface.send_keys(open_keys).await?;
                if let Some(title) = print_dialog_title {
                    self.await_dialog(surface, ctx, title).await?;
                    surface.send_keys("{ENTER}").await?;
                }
                self.await_dialog(surface, ctx, save_dialog_title).await?;
                let path = staged_path.to_string_lossy().to_string();
                let fill = Step::type_text("nome do arquivo", file_field.clone(), &path);
                self.step(surface, ctx, &fill).await?;
                surface.send_keys("{ENTER}").await?;
            }
        }

        let policy = PollPolicy::new(ctx.timings.poll_interval(), ctx.timings.file_timeout());
        let staged = ctx
            .staging
            .wait_for_file(policy, &ctx.cancel)
            .await
            .map_err(staging_error)?;

        let file_name = self.naming.file_name(task);
        let delivered = deliver(&staged, &task.destination, &file_name).map_err(staging_error)?;
        Ok(Some(delivered))
    }
}

#[async_trait]
impl Workflow for FormWorkflow {
    fn name(&self) -> &str {
        &self.name
    }

    fn popups(&self) -> &PopupScanner {
        &self.popups
    }

    async fn prepare(&self, surface: &mut dyn Surface, ctx: &RunContext) -> Result<(), StepError> {
        match &self.login {
            Some(login) => self.login(surface, ctx, login).await,
            None => Ok(()),
        }
    }

    async fn run_task(
        &self,
        surface: &mut dyn Surface,
        ctx: &RunContext,
        task: &Task,
    ) -> Result<Option<PathBuf>, StepError> {
        if let Some(entry) = &self.entry {
            surface.navigate(entry).await?;
        }

        for step in &self.before_fill {
            self.step(surface, ctx, step).await?;
        }

        let identifier = self.identifier_format.apply(&task.identifier);
        let fill = Step::type_text("identificador", self.identifier_field.clone(), &identifier);
        self.step(surface, ctx, &fill).await?;

        if let Some(gate) = &self.captcha {
            gate.pass(surface, ctx).await?;
        }

        match &self.submit {
            Submit::Click(locator) => {
                self.step(surface, ctx, &Step::click("consultar", locator.clone())).await?;
            }
            Submit::Keys(keys) => surface.send_keys(keys).await?,
        }
        pause(ctx.timings.settle(), &ctx.cancel)
            .await
            .map_err(|_| StepError::cancelled())?;

        match self.popups.scan(surface, &ctx.cancel).await {
            Ok(dismissed) if !dismissed.is_empty() => {
                ctx.reporter
                    .report(format!("⚠️  Dismissed after submit: {}", dismissed.join(", ")));
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::SessionLost => return Err(e.into()),
            Err(e) => warn!("Popup scan after submit failed: {}", e),
        }

        self.await_verdict(surface, ctx).await?;
        self.export(surface, ctx, task).await
    }
}

/// One probe, with "not found" errors folded into `false`.
async fn present(surface: &mut dyn Surface, locator: &Locator) -> Result<bool, StepError> {
    match surface.probe(locator).await {
        Ok(hit) => Ok(hit.is_some()),
        Err(SurfaceError::NotFound(_)) => Ok(false),
        Err(e) if e.kind() == ErrorKind::SessionLost => Err(e.into()),
        Err(e) => {
            debug!("Probe for {} failed: {}", locator, e);
            Ok(false)
        }
    }
}

fn staging_error(err: StagingError) -> StepError {
    match err {
        StagingError::NoFile(_) => StepError::timeout(err.to_string()),
        StagingError::Cancelled => StepError::cancelled(),
        StagingError::Io { .. } => StepError::action(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::popup::web_signatures;
    use crate::progress::{MemoryLog, Reporter};
    use crate::staging::{NamingPolicy, StagingArea};
    use crate::surface::scripted::{Effect, Script};
    use std::sync::Arc;

    fn context(staging: &std::path::Path) -> (RunContext, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        let ctx = RunContext::new(
            Reporter::new(log.clone()),
            StagingArea::new(staging).unwrap(),
            Timings::default(),
        );
        (ctx, log)
    }

    fn lookup() -> FormWorkflow {
        FormWorkflow::new(
            "consulta",
            Locator::id("cnpj"),
            Submit::Click(Locator::id("consultar")),
            Locator::text("Situação no Simples Nacional"),
            PopupScanner::with_timings(web_signatures(), &Timings::default()),
        )
        .with_identifier_format(IdentifierFormat::DigitsOnly)
        .with_failure(Locator::text("não encontrado"), "CNPJ não encontrado")
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            username: "fiscal".into(),
            password: "segredo".into(),
        };
        let debug = format!("{:?}", creds);
        assert!(debug.contains("fiscal"));
        assert!(!debug.contains("segredo"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_types_digits_and_reads_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(&dir.path().join("staging"));
        let script = Script::new();
        script
            .show(Locator::id("cnpj"))
            .show(Locator::id("consultar"))
            .on_click(
                Locator::id("consultar"),
                vec![Effect::Show(Locator::text("Situação no Simples Nacional"))],
            );

        let mut surface = script.surface();
        let task = Task::new("11.222.333/0001-81", dir.path().join("Padaria"));
        let file = lookup().run_task(&mut surface, &ctx, &task).await.unwrap();

        assert_eq!(file, None);
        assert_eq!(
            script.journal(),
            vec!["type id:cnpj 11222333000181", "click id:consultar"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_marker_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(&dir.path().join("staging"));
        let script = Script::new();
        script
            .show(Locator::id("cnpj"))
            .show(Locator::id("consultar"))
            .on_click(
                Locator::id("consultar"),
                vec![Effect::Show(Locator::text("não encontrado"))],
            );

        let mut surface = script.surface();
        let task = Task::new("1", dir.path().join("X"));
        let err = lookup().run_task(&mut surface, &ctx, &task).await.unwrap_err();
        assert_eq!(err, StepError::not_found("CNPJ não encontrado"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_print_page_delivers_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(&dir.path().join("staging"));
        let script = Script::new();
        script
            .show(Locator::id("cnpj"))
            .show(Locator::id("consultar"))
            .show(Locator::text("Situação no Simples Nacional"))
            .set_export(Some(b"%PDF-1.4 resultado".to_vec()));

        let workflow = lookup()
            .with_export(ExportMethod::PrintPage)
            .with_naming(OutputNaming::new(NamingPolicy::FolderName, "Simples - "));
        let dest = dir.path().join("Padaria Central");
        let task = Task::new("11222333000181", &dest);

        let mut surface = script.surface();
        let file = workflow.run_task(&mut surface, &ctx, &task).await.unwrap();

        let expected = dest.join("Simples - Padaria Central.pdf");
        assert_eq!(file, Some(expected.clone()));
        assert_eq!(std::fs::read(expected).unwrap(), b"%PDF-1.4 resultado");
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_fills_form_when_needed() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, log) = context(&dir.path().join("staging"));
        let script = Script::new();
        script.show(Locator::text("Sair"));

        let workflow = lookup().with_login(LoginSpec {
            url: "https://portal.example/login".into(),
            username_field: Locator::id("usuario"),
            password_field: Locator::id("senha"),
            submit: Locator::id("entrar"),
            logged_in: Locator::text("Sair"),
            credentials: Credentials {
                username: "fiscal".into(),
                password: "segredo".into(),
            },
            cookie_file: None,
        });

        // Without a cookie file the form is always filled; no fields yet.
        let mut surface = script.surface();
        let err = workflow.prepare(&mut surface, &ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        script.show(Locator::id("usuario")).show(Locator::id("senha")).show(Locator::id("entrar"));
        workflow.prepare(&mut surface, &ctx).await.unwrap();
        assert!(log.messages().iter().any(|m| m.contains("Logged in")));
        assert!(script
            .journal()
            .contains(&"type id:senha segredo".to_string()));
    }

    fn portal_login(cookie_file: PathBuf) -> LoginSpec {
        LoginSpec {
            url: "https://portal.example/login".into(),
            username_field: Locator::id("usuario"),
            password_field: Locator::id("senha"),
            submit: Locator::id("entrar"),
            logged_in: Locator::text("Sair"),
            credentials: Credentials {
                username: "fiscal".into(),
                password: "segredo".into(),
            },
            cookie_file: Some(cookie_file),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_saved_session_skips_login() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, log) = context(&dir.path().join("staging"));
        let script = Script::new();
        script.saved_session(true).show(Locator::text("Sair"));

        let workflow = lookup().with_login(portal_login(dir.path().join("cookies.json")));
        let mut surface = script.surface();
        workflow.prepare(&mut surface, &ctx).await.unwrap();

        assert_eq!(
            script.journal(),
            vec!["navigate https://portal.example/login", "restore session"]
        );
        assert!(log.messages().iter().any(|m| m.starts_with("🍪")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_saved_session_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, log) = context(&dir.path().join("staging"));
        let script = Script::new();
        script
            .saved_session(true)
            .show(Locator::id("usuario"))
            .show(Locator::id("senha"))
            .show(Locator::id("entrar"))
            .on_click(Locator::id("entrar"), vec![Effect::Show(Locator::text("Sair"))]);

        let workflow = lookup().with_login(portal_login(dir.path().join("cookies.json")));
        let mut surface = script.surface();
        workflow.prepare(&mut surface, &ctx).await.unwrap();

        assert_eq!(
            script.journal(),
            vec![
                "navigate https://portal.example/login",
                "restore session",
                "discard session",
                "navigate https://portal.example/login",
                "type id:usuario fiscal",
                "type id:senha segredo",
                "click id:entrar",
                "save session",
            ]
        );
        assert!(script.has_saved_session());
        assert!(!log.messages().iter().any(|m| m.starts_with("🍪")));
    }
}
