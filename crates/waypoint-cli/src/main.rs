//! CLI binary for driving Waypoint workflow sessions.
//!
//! Every command prints pretty JSON on stdout. Logs go to stderr. Engine
//! errors are printed as `{"error": {...}}` with a non-zero exit code.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use waypoint_engine::{
    parse_definitions, validate, BatchFilter, BatchRequest, DefinitionRegistry, EngineConfig,
    FileSessionStore, ProgressReport, SessionManager, StartRequest, StateLock, TokenFile,
};
use waypoint_tools::LocalContentStore;
use waypoint_types::{ErrorKind, ErrorPayload, ItemStatus, WaypointError};

#[derive(Parser)]
#[command(
    name = "waypoint",
    version,
    about = "Resumable, checklist-driven workflow sessions for AI code analysis"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding persisted sessions and outstanding tokens
    #[arg(long, global = true, env = "WAYPOINT_STATE_DIR", default_value = ".waypoint")]
    state_dir: PathBuf,

    /// Unconsumed confirmation tokens kept before the oldest is evicted
    #[arg(long, global = true, default_value = "100")]
    token_retention: usize,

    /// JSON file of workflow definitions layered over the built-ins
    #[arg(long, global = true, env = "WAYPOINT_DEFINITIONS")]
    definitions: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session over a directory
    Start {
        /// Workflow type, e.g. code-review
        workflow_type: String,

        /// Root of the code to analyse
        scope_root: PathBuf,

        /// Options as a JSON object
        #[arg(long)]
        options: Option<String>,

        /// A single option as key=value (repeatable; JSON values are parsed)
        #[arg(short = 'o', long = "option")]
        option: Vec<String>,

        /// Do not run autonomous phases before returning
        #[arg(long)]
        no_autonomous: bool,

        /// Bound on autonomous work in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show the next action of a session
    Next { session_id: String },

    /// Report the outcome of an action
    Progress {
        session_id: String,

        /// Full progress report as JSON
        #[arg(long, conflicts_with_all = ["action_id", "status", "result"])]
        report: Option<String>,

        /// Action id being reported
        #[arg(long, requires = "status")]
        action_id: Option<String>,

        /// completed, skipped or failed
        #[arg(long)]
        status: Option<String>,

        /// Free-text result recorded on the item
        #[arg(long)]
        result: Option<String>,
    },

    /// Preview, execute or group a batch operation over pattern instances
    Batch {
        session_id: String,

        /// apply_fixes, skip_instances, flag_for_review or group_by_type
        operation: String,

        /// Filter as JSON
        #[arg(long)]
        filter: Option<String>,

        /// Confirmation token from a previous dry run; executes the batch
        #[arg(long)]
        token: Option<String>,
    },

    /// Mark a session completed and print its report
    Complete {
        session_id: String,

        /// Skip the detailed report
        #[arg(long)]
        no_report: bool,

        /// Print only the Markdown report
        #[arg(long, conflicts_with = "no_report")]
        markdown: bool,
    },

    /// Continue unfinished autonomous phases of a session
    Resume {
        session_id: String,

        /// Bound on autonomous work in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show a session's phases and progress
    Status { session_id: String },

    /// List persisted sessions
    List,

    /// List available workflow types
    Workflows,

    /// Validate workflow definitions (the built-ins when no file is given)
    Validate { path: Option<PathBuf> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs on stderr so stdout stays machine-readable
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => {
            if code != 0 {
                std::process::exit(code);
            }
        }
        Err(err) => {
            print_error(&err)?;
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    if let Commands::Validate { path } = &cli.command {
        return cmd_validate(path.as_deref());
    }

    // Held until this invocation returns, so overlapping invocations cannot
    // interleave their token reads and writes.
    let state_dir = cli.state_dir.clone();
    let _state_lock = tokio::task::spawn_blocking(move || StateLock::acquire(&state_dir)).await??;

    let manager = build_manager(&cli)?;
    let mut tokens = TokenFile::new(&cli.state_dir);
    tokens.load(manager.tokens()).await?;

    match cli.command {
        Commands::Start {
            workflow_type,
            scope_root,
            options,
            option,
            no_autonomous,
            timeout_ms,
        } => {
            let root = std::fs::canonicalize(&scope_root).unwrap_or(scope_root);
            let request = StartRequest {
                workflow_type,
                scope_root: root.to_string_lossy().into_owned(),
                options: parse_options(options.as_deref(), &option)?,
                run_autonomous: !no_autonomous,
                timeout_ms,
            };
            print_json(&manager.start(request).await?)?;
        }
        Commands::Next { session_id } => {
            print_json(&manager.next(&session_id).await?)?;
        }
        Commands::Progress {
            session_id,
            report,
            action_id,
            status,
            result,
        } => {
            let report = build_report(report.as_deref(), action_id, status.as_deref(), result)?;
            print_json(&manager.progress(&session_id, report).await?)?;
        }
        Commands::Batch {
            session_id,
            operation,
            filter,
            token,
        } => {
            let filter: BatchFilter = match filter {
                Some(json) => serde_json::from_str(&json)?,
                None => BatchFilter::default(),
            };
            let request = BatchRequest {
                operation,
                filter,
                dry_run: token.is_none(),
                confirmation_token: token,
            };
            let response = manager.batch(&session_id, request).await;
            // the token may have been consumed even if the batch failed
            tokens.save(manager.tokens()).await?;
            print_json(&response?)?;
        }
        Commands::Complete {
            session_id,
            no_report,
            markdown,
        } => {
            let response = manager.complete(&session_id, !no_report).await?;
            match response.report {
                Some(report) if markdown => print!("{}", report.markdown),
                _ => print_json(&response)?,
            }
        }
        Commands::Resume {
            session_id,
            timeout_ms,
        } => {
            let timeout = timeout_ms.map(std::time::Duration::from_millis);
            print_json(&manager.resume(&session_id, timeout).await?)?;
        }
        Commands::Status { session_id } => {
            print_json(&manager.status(&session_id).await?)?;
        }
        Commands::List => {
            print_json(&manager.list().await?)?;
        }
        Commands::Workflows => {
            print_json(&manager.list_workflows().await)?;
        }
        Commands::Validate { .. } => {}
    }
    Ok(0)
}

fn build_manager(cli: &Cli) -> anyhow::Result<SessionManager> {
    let config = EngineConfig {
        state_dir: cli.state_dir.clone(),
        token_retention: cli.token_retention,
        ..EngineConfig::default()
    };

    let mut registry = DefinitionRegistry::with_builtins()?;
    if let Some(path) = &cli.definitions {
        registry.load_overrides(path)?;
    }

    let store = Arc::new(FileSessionStore::new(config.sessions_dir()));
    Ok(SessionManager::new(
        registry,
        store,
        Arc::new(LocalContentStore::new()),
        config,
    ))
}

// ---------------------------------------------------------------------------
// Input parsing
// ---------------------------------------------------------------------------

fn parse_options(
    json: Option<&str>,
    pairs: &[String],
) -> anyhow::Result<BTreeMap<String, serde_json::Value>> {
    let mut options: BTreeMap<String, serde_json::Value> = match json {
        Some(json) => serde_json::from_str(json)?,
        None => BTreeMap::new(),
    };
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("option '{pair}' is not of the form key=value"))?;
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        options.insert(key.trim().to_string(), value);
    }
    Ok(options)
}

fn build_report(
    json: Option<&str>,
    action_id: Option<String>,
    status: Option<&str>,
    result: Option<String>,
) -> anyhow::Result<ProgressReport> {
    if let Some(json) = json {
        return Ok(serde_json::from_str(json)?);
    }
    let (Some(action_id), Some(status)) = (action_id, status) else {
        anyhow::bail!("either --report or --action-id with --status is required");
    };
    let status: ItemStatus = status.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let mut report = ProgressReport::new(action_id, status);
    report.completed_action.result = result;
    Ok(report)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn error_payload(err: &anyhow::Error) -> ErrorPayload {
    match err.downcast_ref::<WaypointError>() {
        Some(e) => ErrorPayload::from(e),
        None => ErrorPayload {
            kind: ErrorKind::Configuration,
            code: "invalid_input".to_string(),
            message: format!("{err:#}"),
            retryable: false,
        },
    }
}

fn print_error(err: &anyhow::Error) -> anyhow::Result<()> {
    tracing::debug!(error = %err, "Command failed");
    print_json(&serde_json::json!({ "error": error_payload(err) }))
}

#[derive(Serialize)]
struct ValidationReport {
    workflow_type: String,
    valid: bool,
    diagnostics: Vec<waypoint_engine::Diagnostic>,
}

fn cmd_validate(path: Option<&Path>) -> anyhow::Result<i32> {
    let definitions = match path {
        Some(path) => parse_definitions(&std::fs::read_to_string(path)?)?,
        None => {
            let registry = DefinitionRegistry::with_builtins()?;
            registry
                .list_available()
                .iter()
                .map(|w| registry.get(&w.workflow_type).map(|r| r.definition.clone()))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    let reports: Vec<ValidationReport> = definitions
        .iter()
        .map(|def| {
            let diagnostics = validate(def);
            ValidationReport {
                workflow_type: def.workflow_type.clone(),
                valid: !diagnostics
                    .iter()
                    .any(|d| d.severity == waypoint_engine::Severity::Error),
                diagnostics,
            }
        })
        .collect();

    print_json(&reports)?;
    Ok(if reports.iter().all(|r| r.valid) { 0 } else { 1 })
}
