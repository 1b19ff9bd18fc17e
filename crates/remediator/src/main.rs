//! Remediator CLI
//!
//! Runs the alert remediation service, and offers a few offline commands for
//! inspecting the runbook catalog and the command blacklist.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use notify::Notifier;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use remediator::diagnosis::{DiagnosisClient, HttpDiagnosisClient};
use remediator::dispatch::Dispatcher;
use remediator::gate::SafetyGate;
use remediator::orchestrator::{Dependencies, Orchestrator};
use remediator::registry::RunbookRegistry;
use remediator::server::{run_server, ServerState};
use remediator::source::HttpAlertSource;
use remediator::state::InMemorySafetyStore;
use remediator::store::JsonlRecordStore;
use remediator::telemetry::PrometheusTelemetry;
use remediator::transport::SshTransport;
use remediator::{RemediatorConfig, RiskLevel};

/// Automated alert remediation - diagnoses, gates and executes runbooks against hosts
#[derive(Parser)]
#[command(name = "remediator")]
#[command(about = "Automated alert remediation - diagnoses, gates and executes runbooks against hosts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON configuration file
    #[arg(long, short, env = "REMEDIATOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the remediation service
    Serve {
        /// Address to listen on (overrides server.listen)
        #[arg(long, env = "REMEDIATOR_LISTEN")]
        listen: Option<String>,

        /// Simulate commands instead of sending them to hosts
        #[arg(long, env = "REMEDIATOR_DRY_RUN")]
        dry_run: bool,

        /// Remediation record log (overrides persistence.path)
        #[arg(long, env = "REMEDIATOR_DATA")]
        data: Option<PathBuf>,

        /// Reasoning service endpoint; diagnosis is skipped when unset
        #[arg(long, env = "DIAGNOSIS_URL")]
        diagnosis_url: Option<String>,

        /// Bearer key for the reasoning service
        #[arg(long, env = "DIAGNOSIS_API_KEY", hide_env_values = true)]
        diagnosis_api_key: Option<String>,

        /// Prometheus base URL
        #[arg(long, env = "PROMETHEUS_URL")]
        prometheus_url: Option<String>,

        /// Monitoring API base URL (alerts and hosts)
        #[arg(long, env = "MONITOR_API_URL")]
        monitor_url: Option<String>,
    },

    /// List the runbook catalog
    Runbooks,

    /// Check a command against the blacklist
    CheckCommand {
        /// Command line to check
        command: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = RemediatorConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            listen,
            dry_run,
            data,
            diagnosis_url,
            diagnosis_api_key,
            prometheus_url,
            monitor_url,
        } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            config.executor.dry_run |= dry_run;
            if let Some(data) = data {
                config.persistence.path = data.display().to_string();
            }
            if diagnosis_url.is_some() {
                config.diagnosis.url = diagnosis_url;
            }
            if diagnosis_api_key.is_some() {
                config.diagnosis.api_key = diagnosis_api_key;
            }
            if let Some(url) = prometheus_url {
                config.sources.prometheus_url = url;
            }
            if let Some(url) = monitor_url {
                config.sources.monitor_url = url;
            }
            config.validate()?;
            serve(config).await
        }
        Commands::Runbooks => {
            print_runbooks()?;
            Ok(())
        }
        Commands::CheckCommand { command } => {
            config.validate()?;
            check_command(&config, &command)
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("remediator=info,notify=info,tower_http=info"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn serve(config: RemediatorConfig) -> Result<()> {
    let registry = Arc::new(RunbookRegistry::builtin().context("Invalid built-in runbook catalog")?);
    let source_timeout = Duration::from_secs(config.sources.timeout_secs);

    let records = JsonlRecordStore::open(&config.persistence.path)
        .await
        .with_context(|| format!("Failed to open record log: {}", config.persistence.path))?;

    let diagnosis: Option<Arc<dyn DiagnosisClient>> = match &config.diagnosis.url {
        Some(url) => Some(Arc::new(
            HttpDiagnosisClient::new(url, config.diagnosis.api_key.clone(), config.diagnosis.timeout())
                .context("Failed to build diagnosis client")?,
        )),
        None => {
            warn!("No diagnosis endpoint configured, using rule-based matching only");
            None
        }
    };

    let deps = Dependencies {
        alerts: Arc::new(
            HttpAlertSource::new(&config.sources.monitor_url, source_timeout)
                .context("Failed to build monitoring API client")?,
        ),
        diagnosis,
        telemetry: Arc::new(
            PrometheusTelemetry::new(
                &config.sources.prometheus_url,
                &config.sources.host_label,
                source_timeout,
            )
            .context("Failed to build Prometheus client")?,
        ),
        transport: Arc::new(SshTransport {
            default_user: config.executor.ssh_user.clone(),
            identity_file: config.executor.ssh_identity_file.clone(),
            connect_timeout_secs: config.executor.connect_timeout_secs,
        }),
        records: Arc::new(records),
        safety: Arc::new(InMemorySafetyStore::from_config(&config)),
        notifier: Arc::new(Notifier::from_env()),
    };

    let orchestrator = Arc::new(
        Orchestrator::new(&config, Arc::clone(&registry), deps)
            .context("Failed to build remediation engine")?,
    );

    let shutdown = CancellationToken::new();
    let (dispatcher, worker) = Dispatcher::start(
        orchestrator.clone(),
        config.dispatch.queue_capacity,
        config.dispatch.max_concurrent,
        shutdown.clone(),
    );

    info!(
        runbooks = registry.len(),
        dry_run = config.executor.dry_run,
        records = %config.persistence.path,
        "Remediator starting"
    );
    if config.executor.dry_run {
        warn!("Dry run: commands will be simulated, not executed");
    }

    let state = Arc::new(ServerState {
        orchestrator,
        dispatcher,
    });
    let signal = shutdown.clone();
    run_server(state, &config.server.listen, async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received SIGINT, shutting down");
        signal.cancel();
    })
    .await?;

    shutdown.cancel();
    worker.await.context("Dispatcher task panicked")?;
    info!("Remediator stopped");
    Ok(())
}

fn print_runbooks() -> Result<()> {
    let registry = RunbookRegistry::builtin().context("Invalid built-in runbook catalog")?;

    println!("{}", format!("{} runbooks", registry.len()).cyan().bold());
    for runbook in registry.iter() {
        let label = runbook.risk_level.as_str();
        let risk = match runbook.risk_level {
            RiskLevel::Auto => label.green(),
            RiskLevel::Confirm => label.yellow(),
            RiskLevel::Block => label.red(),
        };
        println!();
        println!("{} [{}] {}", runbook.id.bold(), risk, runbook.name);
        println!("  {}", runbook.description.dimmed());
        if !runbook.predicate.metrics.is_empty() {
            println!("  metrics:  {}", runbook.predicate.metrics.join(", "));
        }
        if !runbook.predicate.keywords.is_empty() {
            println!("  keywords: {}", runbook.predicate.keywords.join(", "));
        }
        for command in &runbook.commands {
            println!("  $ {}", command.template);
        }
    }
    Ok(())
}

fn check_command(config: &RemediatorConfig, command: &str) -> Result<()> {
    let gate = SafetyGate::new(&config.blacklist_patterns(), config.safety.rate_limit_max)
        .context("Invalid blacklist pattern")?;

    match gate.blacklisted(command) {
        Some(pattern) => {
            println!("{} matches {}", "BLOCKED".red().bold(), pattern.yellow());
            std::process::exit(1);
        }
        None => {
            println!("{} no blacklist pattern matches", "ALLOWED".green().bold());
            Ok(())
        }
    }
}
