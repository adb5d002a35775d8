use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fiscal_rpa::config::Timings;
use fiscal_rpa::context::RunContext;
use fiscal_rpa::error::{ErrorKind, SessionError};
use fiscal_rpa::executor::Step;
use fiscal_rpa::locator::Locator;
use fiscal_rpa::popup::{legacy_signatures, PopupScanner};
use fiscal_rpa::progress::{MemoryLog, ProgressEvent, ProgressSink, Reporter};
use fiscal_rpa::report::RunReport;
use fiscal_rpa::session::{RunAborted, SessionDriver};
use fiscal_rpa::staging::StagingArea;
use fiscal_rpa::surface::scripted::{Effect, Script};
use fiscal_rpa::task::{Task, TaskStatus};
use fiscal_rpa::workflow::{Credentials, ExportMethod, FormWorkflow, LoginSpec, Submit};
use tokio_util::sync::CancellationToken;

const PDF: &[u8] = b"%PDF-1.4 comprovante";

/// Records events and runs a hook on each message.
struct HookSink {
    log: MemoryLog,
    hook: Box<dyn Fn(&str) + Send + Sync>,
}

impl ProgressSink for HookSink {
    fn append(&self, event: ProgressEvent) {
        (self.hook)(&event.message);
        self.log.append(event);
    }
}

fn timings() -> Timings {
    Timings {
        step_attempts: 2,
        step_timeout_secs: 2,
        retry_jitter_ms: 0,
        result_timeout_secs: 5,
        file_timeout_secs: 5,
        ..Timings::default()
    }
}

fn context(staging: &Path, sink: Arc<dyn ProgressSink>) -> RunContext {
    RunContext::new(
        Reporter::new(sink),
        StagingArea::new(staging).unwrap(),
        timings(),
    )
}

fn workflow(export: ExportMethod) -> FormWorkflow {
    FormWorkflow::new(
        "teste",
        Locator::id("cnpj"),
        Submit::Click(Locator::id("consultar")),
        Locator::id("resultado"),
        PopupScanner::with_timings(legacy_signatures(), &timings()),
    )
    .with_entry("home")
    .with_export(export)
}

/// A form where submitting shows the result, and a fresh visit to "home"
/// resets the page.
fn form_script() -> Script {
    let script = Script::new();
    script
        .show(Locator::id("cnpj"))
        .show(Locator::id("consultar"))
        .on_navigate(
            "home",
            vec![
                Effect::Show(Locator::id("consultar")),
                Effect::Hide(Locator::id("resultado")),
            ],
        )
        .on_click(
            Locator::id("consultar"),
            vec![Effect::Show(Locator::id("resultado"))],
        )
        .set_export(Some(PDF.to_vec()));
    script
}

fn tasks(root: &Path, ids: &[&str]) -> Vec<Task> {
    ids.iter()
        .map(|id| Task::new(id, root.join(format!("Empresa {}", id))))
        .collect()
}

fn delivered(root: &Path, id: &str) -> PathBuf {
    root.join(format!("Empresa {}", id))
        .join(format!("Empresa {}.pdf", id))
}

async fn run(
    script: &Script,
    workflow: FormWorkflow,
    tasks: &[Task],
    ctx: &RunContext,
) -> Result<RunReport, RunAborted> {
    let driver = SessionDriver::new(Box::new(script.connector()), Box::new(workflow));
    driver.run(tasks, ctx).await
}

#[tokio::test(start_paused = true)]
async fn test_failed_task_does_not_abort_batch() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(MemoryLog::new());
    let ctx = context(&dir.path().join("staging"), log.clone());

    let script = form_script();
    // The submit button never appears for the second company.
    script.on_type(
        Locator::id("cnpj"),
        Some("222"),
        vec![Effect::Hide(Locator::id("consultar"))],
    );

    let tasks = tasks(dir.path(), &["111", "222", "333"]);
    let report = run(&script, workflow(ExportMethod::PrintPage), &tasks, &ctx)
        .await
        .unwrap();

    let ids: Vec<_> = report.outcomes.iter().map(|o| o.identifier.as_str()).collect();
    assert_eq!(ids, vec!["111", "222", "333"]);
    assert!(report.outcomes[0].is_success());
    assert!(matches!(
        report.outcomes[1].status,
        TaskStatus::Failed {
            kind: ErrorKind::NotFound,
            ..
        }
    ));
    assert!(report.outcomes[2].is_success());
    assert!(!report.cancelled);
    assert_eq!(report.skipped, 0);

    assert_eq!(fs::read(delivered(dir.path(), "111")).unwrap(), PDF);
    assert_eq!(fs::read(delivered(dir.path(), "333")).unwrap(), PDF);
    assert!(!dir.path().join("Empresa 222").exists());
    assert!(script.journal().contains(&"recover".to_string()));
    assert!(log.messages().iter().any(|m| m.starts_with("❌ 222")));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_between_tasks_skips_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let sink = Arc::new(HookSink {
        log: MemoryLog::new(),
        hook: Box::new(move |message| {
            if message.starts_with("✅") {
                trigger.cancel();
            }
        }),
    });
    let ctx = context(&dir.path().join("staging"), sink).with_cancel(cancel);

    let script = form_script();
    let tasks = tasks(dir.path(), &["111", "222", "333"]);
    let report = run(&script, workflow(ExportMethod::PrintPage), &tasks, &ctx)
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.skipped, 2);
    assert!(report.cancelled);
    assert_eq!(report.outcomes.len() + report.skipped, tasks.len());
    assert_eq!(
        script.journal(),
        vec![
            "connect",
            "navigate home",
            "type id:cnpj 111",
            "click id:consultar",
            "export",
            "close"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_staged_pdf_is_never_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let staging = dir.path().join("staging");
    fs::create_dir_all(&staging).unwrap();
    fs::write(staging.join("zz-previous-run.pdf"), b"%PDF stale").unwrap();

    let ctx = context(&staging, Arc::new(MemoryLog::new()));
    let script = form_script();
    let tasks = tasks(dir.path(), &["111"]);
    let report = run(&script, workflow(ExportMethod::PrintPage), &tasks, &ctx)
        .await
        .unwrap();

    assert!(report.outcomes[0].is_success());
    assert_eq!(fs::read(delivered(dir.path(), "111")).unwrap(), PDF);
    assert!(!staging.join("zz-previous-run.pdf").exists());
}

#[tokio::test(start_paused = true)]
async fn test_missing_download_fails_without_touching_destination() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir.path().join("staging"), Arc::new(MemoryLog::new()));

    let script = form_script();
    script.show(Locator::id("baixar"));
    let export = ExportMethod::Download(vec![Step::click("baixar", Locator::id("baixar"))]);

    let tasks = tasks(dir.path(), &["111"]);
    let report = run(&script, workflow(export), &tasks, &ctx).await.unwrap();

    assert!(matches!(
        report.outcomes[0].status,
        TaskStatus::Failed {
            kind: ErrorKind::Timeout,
            ..
        }
    ));
    assert!(!dir.path().join("Empresa 111").exists());
}

#[tokio::test(start_paused = true)]
async fn test_download_is_moved_into_destination() {
    let dir = tempfile::tempdir().unwrap();
    let staging = dir.path().join("staging");
    let ctx = context(&staging, Arc::new(MemoryLog::new()));

    let script = form_script();
    script.show(Locator::id("baixar")).on_click(
        Locator::id("baixar"),
        vec![Effect::WriteFile {
            path: staging.join("guia_0001.pdf"),
            bytes: PDF.to_vec(),
        }],
    );
    let export = ExportMethod::Download(vec![Step::click("baixar", Locator::id("baixar"))]);

    let tasks = tasks(dir.path(), &["111"]);
    let report = run(&script, workflow(export), &tasks, &ctx).await.unwrap();

    assert!(report.outcomes[0].is_success());
    assert_eq!(fs::read(delivered(dir.path(), "111")).unwrap(), PDF);
    assert!(!staging.join("guia_0001.pdf").exists());
}

#[tokio::test(start_paused = true)]
async fn test_stray_dialog_is_dismissed_before_task() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(MemoryLog::new());
    let ctx = context(&dir.path().join("staging"), log.clone());

    let script = form_script();
    script.open_dialog("Atenção: registro bloqueado");

    let tasks = tasks(dir.path(), &["111"]);
    let report = run(&script, workflow(ExportMethod::None), &tasks, &ctx)
        .await
        .unwrap();

    assert!(report.outcomes[0].is_success());
    assert!(script.dialogs().is_empty());
    assert!(log.messages().iter().any(|m| m.contains("Dismissed: Atenção")));
    assert_eq!(script.journal()[1], "keys {ENTER}");
}

#[tokio::test(start_paused = true)]
async fn test_lost_session_is_reconnected() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir.path().join("staging"), Arc::new(MemoryLog::new()));

    let script = form_script();
    script.on_type(Locator::id("cnpj"), Some("222"), vec![Effect::LoseSession]);

    let tasks = tasks(dir.path(), &["111", "222", "333"]);
    let report = run(&script, workflow(ExportMethod::PrintPage), &tasks, &ctx)
        .await
        .unwrap();

    assert_eq!(script.connects(), 2);
    assert!(report.outcomes[0].is_success());
    assert!(matches!(
        report.outcomes[1].status,
        TaskStatus::Failed {
            kind: ErrorKind::SessionLost,
            ..
        }
    ));
    assert!(report.outcomes[2].is_success());
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let script = form_script();
    script.on_type(Locator::id("cnpj"), Some("222"), vec![Effect::LoseSession]);

    let blocker = script.clone();
    let sink = Arc::new(HookSink {
        log: MemoryLog::new(),
        hook: Box::new(move |message| {
            if message.contains("reconnecting") {
                blocker.fail_connect(true);
            }
        }),
    });
    let ctx = context(&dir.path().join("staging"), sink);

    let tasks = tasks(dir.path(), &["111", "222", "333"]);
    let err = run(&script, workflow(ExportMethod::PrintPage), &tasks, &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err.error, SessionError::Reconnect { .. }));
    assert!(!script.journal().contains(&"type id:cnpj 333".to_string()));

    // Work done before the abort is still reported.
    let partial = &err.report;
    assert_eq!(partial.outcomes.len(), 2);
    assert!(partial.outcomes[0].is_success());
    assert_eq!(partial.skipped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_target_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir.path().join("staging"), Arc::new(MemoryLog::new()));
    let script = form_script();
    script.fail_connect(true);

    let tasks = tasks(dir.path(), &["111"]);
    let err = run(&script, workflow(ExportMethod::PrintPage), &tasks, &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err.error, SessionError::Establish { .. }));
    assert!(script.journal().is_empty());
    assert!(err.report.outcomes.is_empty());
    assert_eq!(err.report.skipped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_login_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir.path().join("staging"), Arc::new(MemoryLog::new()));
    let script = form_script();

    let workflow = workflow(ExportMethod::None).with_login(LoginSpec {
        url: "login".into(),
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

    let tasks = tasks(dir.path(), &["111"]);
    let err = run(&script, workflow, &tasks, &ctx).await.unwrap_err();

    assert!(matches!(err.error, SessionError::Prepare(_)));
    assert!(!script.journal().iter().any(|e| e.starts_with("type id:cnpj")));
    assert_eq!(script.journal().last().map(String::as_str), Some("close"));
}
