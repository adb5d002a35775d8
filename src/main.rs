use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fiscal_rpa::captcha::CaptchaSolver;
use fiscal_rpa::config::{Settings, Timings};
use fiscal_rpa::context::RunContext;
use fiscal_rpa::progress::{ChannelSink, ProgressSink, Reporter, TracingSink};
use fiscal_rpa::report::RunReport;
use fiscal_rpa::session::SessionDriver;
use fiscal_rpa::staging::{sanitize_file_name, NamingPolicy, OutputNaming, StagingArea};
use fiscal_rpa::surface::desktop::DesktopConnector;
use fiscal_rpa::surface::web::WebConnector;
use fiscal_rpa::surface::Connector;
use fiscal_rpa::task::{load_tasks_csv, Task};
use fiscal_rpa::workflow::presets::{self, LEGACY_WINDOW_TITLE, SIMPLES_NACIONAL_URL};
use fiscal_rpa::workflow::{Credentials, Workflow};

fn prompt_non_empty(prompt: &str) -> Result<String> {
    loop {
        print!("{}", prompt);
        io::stdout()
            .flush()
            .context("Failed to flush stdout while prompting for input")?;

        let mut input = String::new();
        io::stdin()
            .read_line(&mut input)
            .context("Failed to read prompt input")?;

        let trimmed = input.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }

        println!("Input cannot be empty. Please try again.\n");
    }
}

fn resolve_credential(value: Option<String>, env_key: &str, prompt: &str) -> Result<String> {
    if let Some(val) = value {
        let trimmed = val.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    if let Ok(val) = std::env::var(env_key) {
        if !val.trim().is_empty() {
            return Ok(val);
        }
    }
    prompt_non_empty(prompt)
}

/// Launches a local ChromeDriver on the port of `webdriver_url`.
fn start_chromedriver(webdriver_url: &str) -> Result<()> {
    let port = webdriver_url
        .rsplit(':')
        .next()
        .and_then(|p| p.trim_end_matches('/').parse::<u16>().ok())
        .unwrap_or(9515);

    info!("Attempting to start ChromeDriver on port {}...", port);
    Command::new("chromedriver")
        .arg(format!("--port={}", port))
        .spawn()
        .context("Failed to launch chromedriver. Is it installed and on PATH?")?;
    info!("ChromeDriver launched.");
    Ok(())
}

#[derive(Parser)]
#[command(name = "fiscal-rpa")]
#[command(about = "Batch RPA runner for the tax-audit back office", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// CSV with `identifier,destination[,name]` rows
    #[arg(short, long)]
    tasks: PathBuf,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    headless: bool,

    /// Overrides RPA_WEBDRIVER_URL
    #[arg(long)]
    webdriver_url: Option<String>,

    #[arg(long, default_value_t = false)]
    start_chromedriver: bool,

    /// Overrides RPA_STAGING_DIR
    #[arg(long)]
    staging: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = NamingPolicy::FolderName)]
    naming: NamingPolicy,

    /// Prepended to every delivered file name
    #[arg(long, default_value = "")]
    prefix: String,

    /// JSON file overriding timing constants
    #[arg(long)]
    timings: Option<PathBuf>,

    /// Write a CSV report of every task outcome
    #[arg(long)]
    report: Option<PathBuf>,

    /// Send progress to the log instead of printing it
    #[arg(long, default_value_t = false)]
    log_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Simples Nacional optant lookup, printed to PDF
    Simples {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Document dispatch portal (login + download)
    Dispatch {
        #[command(flatten)]
        run: RunArgs,

        /// Portal base URL (or DISPATCH_PORTAL_URL)
        #[arg(long)]
        portal_url: Option<String>,

        #[arg(long)]
        username: Option<String>,

        #[arg(long)]
        password: Option<String>,

        /// Where the saved portal session is kept
        #[arg(long, default_value = ".")]
        cookie_dir: PathBuf,
    },

    /// Legacy "Comércio" desktop application (Windows only)
    Legacy {
        #[command(flatten)]
        run: RunArgs,

        /// Regex matched against the application window title
        #[arg(long, default_value = LEGACY_WINDOW_TITLE)]
        window_title: String,
    },

    /// Show the file name a label would be delivered under
    Sanitize {
        names: Vec<String>,

        #[arg(long, default_value = "")]
        identifier: String,
    },

    /// Validate a task CSV and list its tasks
    Tasks { file: PathBuf },
}

struct Batch {
    tasks: Vec<Task>,
    ctx: RunContext,
    timings: Timings,
    naming: OutputNaming,
    settings: Settings,
    report_path: Option<PathBuf>,
    printer: Option<tokio::task::JoinHandle<()>>,
}

impl Batch {
    fn prepare(run: &RunArgs, cancel: CancellationToken) -> Result<Self> {
        let mut settings = Settings::from_env();
        if let Some(url) = &run.webdriver_url {
            settings.webdriver_url = url.clone();
        }
        if let Some(dir) = &run.staging {
            settings.staging_dir = dir.clone();
        }

        let timings = match &run.timings {
            Some(path) => Timings::from_file(path)?,
            None => Timings::default(),
        };

        let tasks = load_tasks_csv(&run.tasks)?;
        if tasks.is_empty() {
            bail!("No tasks found in {}", run.tasks.display());
        }
        info!("Loaded {} task(s) from {}", tasks.len(), run.tasks.display());

        let staging = StagingArea::new(&settings.staging_dir)
            .with_context(|| {
                format!("Failed to prepare staging dir {}", settings.staging_dir.display())
            })?;

        let sink: Arc<dyn ProgressSink>;
        let mut printer = None;
        if run.log_progress {
            sink = Arc::new(TracingSink);
        } else {
            let (channel, mut rx) = ChannelSink::new();
            sink = Arc::new(channel);
            printer = Some(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    println!("[{}] {}", event.at.format("%H:%M:%S"), event.message);
                }
            }));
        }

        let ctx = RunContext::new(Reporter::new(sink), staging, timings.clone())
            .with_cancel(cancel)
            .with_captcha_solver(CaptchaSolver::from_env());

        Ok(Self {
            tasks,
            ctx,
            timings,
            naming: OutputNaming::new(run.naming, &run.prefix),
            settings,
            report_path: run.report.clone(),
            printer,
        })
    }

    fn web_connector(&self, run: &RunArgs, home_url: &str) -> Result<WebConnector> {
        if run.start_chromedriver {
            start_chromedriver(&self.settings.webdriver_url)?;
        }
        Ok(WebConnector {
            webdriver_url: self.settings.webdriver_url.clone(),
            headless: run.headless,
            home_url: home_url.to_string(),
            download_dir: self.ctx.staging.path().to_path_buf(),
            page_load_timeout: self.timings.page_load_timeout(),
            poll_interval: self.timings.poll_interval(),
            cancel: self.ctx.cancel.clone(),
        })
    }

    async fn execute(
        self,
        connector: Box<dyn Connector>,
        workflow: Box<dyn Workflow>,
    ) -> Result<()> {
        let Batch {
            tasks,
            ctx,
            report_path,
            printer,
            ..
        } = self;

        let driver = SessionDriver::new(connector, workflow);
        let result = driver.run(&tasks, &ctx).await;

        // Dropping the context closes the progress channel so the printer drains.
        drop(ctx);
        if let Some(printer) = printer {
            if let Err(e) = printer.await {
                warn!("Progress printer stopped abnormally: {}", e);
            }
        }

        match result {
            Ok(report) => publish(&report, report_path.as_deref()),
            Err(aborted) => {
                // Outcomes gathered before the abort are still worth keeping.
                publish(&aborted.report, report_path.as_deref())?;
                Err(anyhow::Error::new(aborted.error).context("Run aborted"))
            }
        }
    }
}

fn publish(report: &RunReport, path: Option<&Path>) -> Result<()> {
    report.display();
    if let Some(path) = path {
        report.write_csv(path)?;
        info!("📝 Report written to {}", path.display());
    }
    Ok(())
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing the current task then stopping...");
            cancel.cancel();
        }
    });
}

fn print_tasks(file: &Path) -> Result<()> {
    let tasks = load_tasks_csv(file)?;
    println!("\n{:<4} {:<22} {:<30} {}", "#", "Identifier", "Name", "Destination");
    println!("{}", "-".repeat(90));
    for (i, task) in tasks.iter().enumerate() {
        println!(
            "{:<4} {:<22} {:<30} {}",
            i + 1,
            task.identifier,
            task.display_name.as_deref().unwrap_or("-"),
            task.destination.display()
        );
    }
    println!("\n{} task(s)", tasks.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Simples { run } => {
            let batch = Batch::prepare(&run, cancel.clone())?;
            let connector = batch.web_connector(&run, SIMPLES_NACIONAL_URL)?;
            let workflow = presets::simples_nacional(&batch.timings, batch.naming.clone());
            spawn_ctrl_c(cancel);
            batch.execute(Box::new(connector), Box::new(workflow)).await?;
        }

        Commands::Dispatch {
            run,
            portal_url,
            username,
            password,
            cookie_dir,
        } => {
            let portal_url = resolve_credential(
                portal_url,
                "DISPATCH_PORTAL_URL",
                "Enter the dispatch portal URL: ",
            )?;
            let credentials = Credentials {
                username: resolve_credential(
                    username,
                    "DISPATCH_USERNAME",
                    "Enter portal username: ",
                )?,
                password: resolve_credential(
                    password,
                    "DISPATCH_PASSWORD",
                    "Enter portal password: ",
                )?,
            };

            let batch = Batch::prepare(&run, cancel.clone())?;
            let connector = batch.web_connector(&run, &portal_url)?;
            let workflow = presets::dispatch_portal(
                &portal_url,
                credentials,
                &cookie_dir,
                &batch.timings,
                batch.naming.clone(),
            );
            spawn_ctrl_c(cancel);
            batch.execute(Box::new(connector), Box::new(workflow)).await?;
        }

        Commands::Legacy { run, window_title } => {
            let title_pattern = Regex::new(&window_title)
                .with_context(|| format!("Invalid window title pattern: {}", window_title))?;

            let batch = Batch::prepare(&run, cancel.clone())?;
            let connector = DesktopConnector::new(title_pattern, batch.timings.clone());
            let workflow = presets::legacy_comercio(
                &batch.settings.assets_dir,
                &batch.timings,
                batch.naming.clone(),
            );
            spawn_ctrl_c(cancel);
            batch.execute(Box::new(connector), Box::new(workflow)).await?;
        }

        Commands::Sanitize { names, identifier } => {
            for name in &names {
                println!("{} -> {}", name, sanitize_file_name(name, &identifier));
            }
        }

        Commands::Tasks { file } => print_tasks(&file)?,
    }

    Ok(())
}
