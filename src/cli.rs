//! Opsdeck CLI
//!
//! Commands:
//! - `opsdeck status` - One health poll cycle as a table
//! - `opsdeck watch` - Live board and push notifications until Ctrl-C
//! - `opsdeck alert` - Send an operator alert
//! - `opsdeck report` - Generate, list, preview, download and delete reports

use async_trait::async_trait;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::adapters::{ConsoleBackend, HttpBackend, HttpProbe, ServiceProbe, TungsteniteConnector};
use crate::config::{AppConfig, PollMode};
use crate::domain::{
    AlertResult, ArtifactFilter, ChannelEvent, JobPhase, ReportArtifact, ReportRequest,
    ReportType, ServiceDescriptor, StatusBoard, WorkflowState, DATE_FORMAT,
    DELETE_CONFIRMATION_PHRASE,
};
use crate::error::{OpsdeckError, Result};
use crate::services::{
    AlertDispatcher, Confirmer, HealthPoller, HealthPollerConfig, HealthSource,
    NotificationChannel, ReportWorkflow,
};
use crate::session::Session;

/// Opsdeck operations console
#[derive(Parser, Debug)]
#[command(name = "opsdeck")]
#[command(author, version, about = "Live backend status, notifications, alerts and reports")]
pub struct Cli {
    /// Configuration file (defaults to config/default.toml plus environment)
    #[arg(short, long, global = true, env = "OPSDECK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Backend base address, overriding configuration
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one health poll cycle and print the board
    Status {
        /// Override poller.mode (aggregate, grouped, fan_out)
        #[arg(long)]
        mode: Option<PollMode>,
    },

    /// Follow the status board and push notifications until Ctrl-C
    Watch {
        #[arg(long)]
        mode: Option<PollMode>,
    },

    /// Send an alert to the configured chat channel
    Alert {
        message: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Report generation and artifacts
    #[command(subcommand)]
    Report(ReportCommands),
}

#[derive(Subcommand, Debug)]
pub enum ReportCommands {
    /// Generate a report for one date or a date range
    Generate {
        #[arg(long = "type")]
        report_type: ReportType,
        /// Anchor date (YYYY-MM-DD)
        #[arg(long, conflicts_with_all = ["from", "to"])]
        date: Option<NaiveDate>,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
        #[arg(short, long)]
        yes: bool,
    },

    /// List generated artifacts
    List {
        #[arg(long = "type")]
        report_type: Option<ReportType>,
        /// Case-insensitive file name filter
        #[arg(long)]
        filter: Option<String>,
    },

    /// Stream an artifact to stdout
    Preview { report_type: ReportType, name: String },

    /// Save an artifact locally under its own file name
    Download {
        report_type: ReportType,
        name: String,
        /// Target directory (defaults to report.download_dir)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Delete an artifact
    Delete {
        report_type: ReportType,
        name: String,
        /// Confirmation phrase; prompted for when absent
        #[arg(long)]
        confirm: Option<String>,
    },
}

/// Output mode for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print a vec of Tabled + Serialize items in the chosen mode.
pub fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                println!("{}", Table::new(items));
            }
        }
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

#[derive(Debug, Serialize, Tabled)]
pub struct StatusRow {
    pub category: String,
    pub service: String,
    pub state: String,
    pub checked: String,
    /// Service's own web console, when configured
    pub web: String,
}

impl StatusRow {
    pub fn from_board(board: &StatusBoard, descriptors: &[ServiceDescriptor]) -> Vec<StatusRow> {
        let web_url = |name: &str| {
            descriptors
                .iter()
                .find(|d| d.name == name)
                .and_then(|d| d.web_url.as_ref())
                .map(|u| u.to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        board
            .groups
            .iter()
            .flat_map(|group| {
                group.services.iter().map(move |s| StatusRow {
                    category: group.category.clone(),
                    service: s.name.clone(),
                    state: s.state.to_string(),
                    checked: s.last_checked.format("%H:%M:%S").to_string(),
                    web: web_url(&s.name),
                })
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct ArtifactRow {
    #[tabled(rename = "type")]
    pub report_type: String,
    pub file_name: String,
    pub created: String,
}

impl From<&ReportArtifact> for ArtifactRow {
    fn from(a: &ReportArtifact) -> Self {
        Self {
            report_type: a.report_type.to_string(),
            file_name: a.file_name.clone(),
            created: a
                .created_at
                .map(|d| d.format(DATE_FORMAT).to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

async fn read_line(prompt: &str) -> Option<String> {
    let mut stdout = tokio::io::stdout();
    let _ = stdout.write_all(prompt.as_bytes()).await;
    let _ = stdout.flush().await;
    let mut line = String::new();
    match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

/// Asks on stdin, or answers yes when `--yes` was given
pub struct StdinConfirmer {
    assume_yes: bool,
}

impl StdinConfirmer {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, prompt: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        matches!(
            read_line(&format!("{} [y/N] ", prompt))
                .await
                .map(|answer| answer.trim().to_lowercase())
                .as_deref(),
            Some("y") | Some("yes")
        )
    }
}

/// Components shared by every command
pub struct Console {
    pub config: AppConfig,
    pub session: Arc<Session>,
    pub backend: Arc<HttpBackend>,
    pub output: OutputMode,
}

impl Console {
    pub fn new(config: AppConfig, output: OutputMode) -> Result<Self> {
        config.validate()?;
        let session = Arc::new(Session::new(config.backend.token.clone()));
        let backend = Arc::new(HttpBackend::from_config(&config, Arc::clone(&session))?);
        Ok(Self {
            config,
            session,
            backend,
            output,
        })
    }

    fn poller(&self, mode: Option<PollMode>) -> Result<HealthPoller> {
        let mode = mode.unwrap_or(self.config.poller.mode);
        info!("Health polling in {} mode", mode.as_str());
        let backend: Arc<dyn ConsoleBackend> = self.backend.clone();
        let probe: Arc<dyn ServiceProbe> = Arc::new(HttpProbe::new()?);
        Ok(HealthPoller::new(
            HealthPollerConfig::from(&self.config),
            self.config.descriptors()?,
            HealthSource::from_mode(mode, backend, probe),
        ))
    }

    fn workflow(&self) -> ReportWorkflow {
        ReportWorkflow::new(self.backend.clone())
    }
}

pub async fn show_status(console: &Console, mode: Option<PollMode>) -> anyhow::Result<()> {
    let poller = console.poller(mode)?;
    let board = poller.poll_once(1).await?;
    let descriptors = console.config.descriptors()?;
    print_items(&StatusRow::from_board(&board, &descriptors), console.output)
}

pub async fn watch(console: &Console, mode: Option<PollMode>) -> anyhow::Result<()> {
    let mut poller = console.poller(mode)?;
    let descriptors = console.config.descriptors()?;
    let connector = TungsteniteConnector::new().with_session(Arc::clone(&console.session));
    let mut channel = NotificationChannel::from_config(&console.config, Arc::new(connector));

    let mut boards = poller.subscribe();
    let mut failures = poller.subscribe_failures();
    let mut events = channel.events();

    poller.start()?;
    if let Err(e) = channel.start() {
        // Status keeps updating without the push channel
        warn!("{}", e);
        println!("⚠ notifications unavailable: {}", e.operator_message());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            changed = boards.changed() => {
                if changed.is_err() {
                    break;
                }
                let board = boards.borrow_and_update().clone();
                let (up, down, unknown) = board.counts();
                println!("── cycle {} ── {} up, {} down, {} unknown", board.cycle, up, down, unknown);
                print_items(&StatusRow::from_board(&board, &descriptors), console.output)?;
            }
            changed = failures.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(failure) = failures.borrow_and_update().clone() {
                    println!("⚠ poll cycle {} failed: {}", failure.cycle, failure.reason);
                }
            }
            event = events.recv() => match event {
                Ok(ChannelEvent::Notification(n)) => println!("🔔 {}", n.text),
                Ok(ChannelEvent::BannerRaised(banner)) => println!("⚠ {}", banner.message),
                Ok(ChannelEvent::BannerCleared) => println!("✓ notification service reconnected"),
                Ok(ChannelEvent::CredentialRejected(reason)) => {
                    println!("⚠ notifications stopped: {}", reason);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Skipped {} channel events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    channel.shutdown().await;
    poller.stop().await;
    Ok(())
}

pub async fn send_alert(console: &Console, message: &str, yes: bool) -> anyhow::Result<()> {
    let dispatcher = AlertDispatcher::new(console.backend.clone());
    match dispatcher.submit(message, &StdinConfirmer::new(yes)).await? {
        None => println!("Alert not sent"),
        Some(AlertResult::Sent) => println!("✓ {}", AlertResult::Sent),
        Some(result) => anyhow::bail!("{}", result),
    }
    Ok(())
}

pub async fn run_report_command(console: &Console, cmd: &ReportCommands) -> anyhow::Result<()> {
    let workflow = console.workflow();

    match cmd {
        ReportCommands::Generate {
            report_type,
            date,
            from,
            to,
            yes,
        } => {
            let request = match (date, from, to) {
                (_, Some(start), Some(end)) => ReportRequest::range(*report_type, *start, *end),
                (Some(date), _, _) => ReportRequest::single(*report_type, *date),
                _ => ReportRequest::single(*report_type, chrono::Local::now().date_naive()),
            };
            let Some(job) = workflow.submit(request, &StdinConfirmer::new(*yes)).await? else {
                println!("Report not requested");
                return Ok(());
            };
            match (&job.phase, workflow.state()) {
                (JobPhase::Ready { artifact, message }, WorkflowState::Succeeded(_)) => {
                    println!("✓ {}", message);
                    if let Some(name) = artifact {
                        println!("  artifact: {}", name);
                    }
                }
                (JobPhase::Failed { reason }, _) => anyhow::bail!("report generation failed: {}", reason),
                (phase, state) => println!("report {:?} ({})", phase, state),
            }
        }
        ReportCommands::List {
            report_type,
            filter,
        } => {
            workflow.refresh().await?;
            let filter = ArtifactFilter {
                report_type: *report_type,
                query: filter.clone().unwrap_or_default(),
            };
            let rows: Vec<ArtifactRow> = workflow.filtered(&filter).iter().map(ArtifactRow::from).collect();
            print_items(&rows, console.output)?;
        }
        ReportCommands::Preview { report_type, name } => {
            let mut preview = workflow.preview(*report_type, name).await?;
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = preview.next_chunk().await {
                stdout.write_all(&chunk?).await?;
            }
            stdout.flush().await?;
            preview.close();
        }
        ReportCommands::Download {
            report_type,
            name,
            dir,
        } => {
            let dir = dir.clone().unwrap_or_else(|| console.config.report.download_dir());
            let path = workflow.download(*report_type, name, &dir).await?;
            println!("✓ saved {}", path.display());
        }
        ReportCommands::Delete {
            report_type,
            name,
            confirm,
        } => {
            let phrase = match confirm {
                Some(phrase) => phrase.clone(),
                None => read_line(&format!(
                    "Type \"{}\" to delete {}/{}: ",
                    DELETE_CONFIRMATION_PHRASE, report_type, name
                ))
                .await
                .unwrap_or_default(),
            };
            match workflow.delete(*report_type, name, &phrase).await {
                Ok(message) => println!("✓ {}", message),
                Err(OpsdeckError::Validation(reason)) => anyhow::bail!("{}", reason),
                Err(e) => anyhow::bail!("delete failed: {}", e.operator_message()),
            }
        }
    }
    Ok(())
}
